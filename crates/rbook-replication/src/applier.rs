use std::future::Future;

use rbook_types::{Peer, RollbookError, Student};

/// Narrow capability interface through which the state machine drives the
/// coordinator's replicated transitions.
///
/// The state machine must not see the coordinator's full surface (and the
/// coordinator must not depend on the consensus machinery), so committed
/// commands flow through exactly these six operations. Implementations must
/// be deterministic functions of their arguments and tier state — no local
/// clocks or per-node randomness — with the sampled-expiry pass as the one
/// tolerated exception, since it only removes keys that are already expired.
pub trait Applier: Send + Sync + 'static {
    fn apply_add(&self, student: Student)
        -> impl Future<Output = Result<(), RollbookError>> + Send;

    fn apply_update(&self, student: Student)
        -> impl Future<Output = Result<(), RollbookError>> + Send;

    fn apply_delete(&self, id: String)
        -> impl Future<Output = Result<(), RollbookError>> + Send;

    fn apply_reload_cache(&self)
        -> impl Future<Output = Result<(), RollbookError>> + Send;

    fn apply_periodic_delete(&self, examine_size: usize)
        -> impl Future<Output = Result<(), RollbookError>> + Send;

    fn apply_update_peers(&self, peer: Peer) -> impl Future<Output = ()> + Send;
}

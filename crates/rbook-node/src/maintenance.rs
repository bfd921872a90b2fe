use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::warn;

use rbook_replication::Replicator;
use rbook_types::Command;

pub struct MaintenanceConfig {
    pub reload_interval: Duration,
    pub periodic_delete_interval: Duration,
    pub examine_size: usize,
}

/// Start the two maintenance timers.
///
/// Both fire through `Replicator::submit`, so the reload and the sampled
/// expiry execute as replicated commands: every replica reloads its cache and
/// samples its expiry set at the same log index. A failed tick is logged and
/// the next one is scheduled unchanged — the log realigns replicas on the
/// next successful command.
pub fn spawn_timers(replicator: Arc<Replicator>, config: MaintenanceConfig) {
    let reload = replicator.clone();
    let reload_interval = config.reload_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reload_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; maintenance starts one full
        // period after startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = reload.submit(Command::ReloadCacheData).await {
                warn!(error = %e, "cache reload tick failed, skipping");
            }
        }
    });

    let expiry_interval = config.periodic_delete_interval;
    let examine_size = config.examine_size;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(expiry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = replicator.submit(Command::PeriodicDelete { examine_size }).await {
                warn!(error = %e, "periodic delete tick failed, skipping");
            }
        }
    });
}

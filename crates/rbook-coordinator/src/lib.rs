use std::sync::Arc;

use tracing::{debug, info, warn};

use rbook_replication::{Applier, PeerRegistry};
use rbook_storage::{CacheStore, MemTable, RecordStore};
use rbook_types::{Peer, RollbookError, Student};

/// Sequences the three storage tiers.
///
/// Reads walk memory → cache → store and short-circuit on the first hit,
/// rehydrating the colder tiers that reported absence. Mutations arrive only
/// through the replicated `apply_*` transitions and always commit the store
/// of record last, so the durable store is the final arbiter: the cache is
/// reconstructable from it via [`restore_cache`], and memory from the cache
/// at the next preheat or read-through.
///
/// [`restore_cache`]: Coordinator::restore_cache
pub struct Coordinator<C: CacheStore> {
    mem: MemTable,
    cache: C,
    store: RecordStore,
    peers: Arc<PeerRegistry>,
}

impl<C: CacheStore> Coordinator<C> {
    pub fn new(mem: MemTable, cache: C, store: RecordStore, peers: Arc<PeerRegistry>) -> Self {
        Coordinator { mem, cache, store, peers }
    }

    /// Point lookup across the tiers, warmest first. Every successful read
    /// bumps the student's access count in this node's store.
    pub async fn get(&self, id: &str) -> Result<Student, RollbookError> {
        if let Some(student) = self.mem.get(id).await {
            debug!(id, "memory hit");
            self.bump_count(id).await;
            return Ok(student);
        }

        // Read-through into the cache only when it reported absence, never
        // over a transport failure.
        let mut cache_absent = false;
        match self.cache.get_student(id).await {
            Ok(Some(student)) => {
                debug!(id, "cache hit");
                self.bump_count(id).await;
                self.mem.set(id, student.clone(), student.expiration).await;
                return Ok(student);
            }
            Ok(None) => cache_absent = true,
            Err(e) => warn!(id, error = %e, "cache read failed, falling through"),
        }

        match self.store.get_student(id).await? {
            Some(student) => {
                debug!(id, "store hit");
                self.bump_count(id).await;
                self.mem.set(id, student.clone(), student.expiration).await;
                if cache_absent {
                    if let Err(e) = self.cache.add_student(&student).await {
                        warn!(id, error = %e, "cache rehydration failed");
                    }
                }
                Ok(student)
            }
            None => Err(RollbookError::NotFound(id.to_string())),
        }
    }

    async fn bump_count(&self, id: &str) {
        if let Err(e) = self.store.touch_count(id).await {
            warn!(id, error = %e, "failed to bump access count");
        }
    }

    /// Rebuild the cached record from the store of record. Used after a
    /// rolled-back mutation while the store transaction is still unmodified,
    /// so the read returns the pre-image.
    async fn restore_cache(&self, id: &str) -> Result<(), RollbookError> {
        let student = self
            .store
            .get_student(id)
            .await?
            .ok_or_else(|| RollbookError::NotFound(id.to_string()))?;
        self.cache.add_student(&student).await
    }

    // -----------------------------------------------------------------------
    // Replicated transitions (state machine only)
    // -----------------------------------------------------------------------

    /// Insert into all three tiers; store commits last. When another replica
    /// already persisted the student, only the local memory tier is filled —
    /// the at-least-once submit path makes repeated adds for one id normal.
    pub async fn apply_add_student(&self, student: Student) -> Result<(), RollbookError> {
        let mut tx = self.store.begin();

        if self.store.get_student_row(&student.id).await?.is_some() {
            debug!(id = %student.id, "already durable, memory-only add");
            self.mem.set(&student.id, student.clone(), student.expiration).await;
            self.store.rollback(tx);
            return Ok(());
        }

        self.store.add_student(&mut tx, &student);
        if let Err(e) = self.cache.add_student(&student).await {
            warn!(id = %student.id, error = %e, "cache add failed, rolling back");
            self.store.rollback(tx);
            return Err(e);
        }
        self.mem.set(&student.id, student.clone(), student.expiration).await;
        self.store.commit(tx).await?;
        self.bump_count(&student.id).await;
        info!(id = %student.id, "student added");
        Ok(())
    }

    /// Update all three tiers under one store transaction. Absence is
    /// tolerated in the warmer tiers (plus expiry in memory); any other tier
    /// failure rolls the store back, restoring the cache from the pre-image
    /// where it may already have been touched.
    pub async fn apply_update_student(&self, student: Student) -> Result<(), RollbookError> {
        let mut tx = self.store.begin();
        self.store.update_student(&mut tx, &student).await?;

        match self.cache.update_student(&student).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(id = %student.id, "not cached, skipping"),
            Err(e) => {
                warn!(id = %student.id, error = %e, "cache update failed, rolling back");
                self.store.rollback(tx);
                return Err(e);
            }
        }

        match self.update_mem(&student).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() || e.is_expired() => {
                debug!(id = %student.id, "not live in memory, skipping")
            }
            Err(e) => {
                warn!(id = %student.id, error = %e, "memory update failed, rolling back");
                self.store.rollback(tx);
                // The transaction never committed, so this reads the
                // unmodified row.
                self.restore_cache(&student.id).await?;
                return Err(e);
            }
        }

        self.store.commit(tx).await?;
        self.bump_count(&student.id).await;
        info!(id = %student.id, "student updated");
        Ok(())
    }

    /// Merge-update against the memory tier's own current value.
    async fn update_mem(&self, incoming: &Student) -> Result<(), RollbookError> {
        let current = self
            .mem
            .get(&incoming.id)
            .await
            .ok_or_else(|| RollbookError::NotFound(incoming.id.clone()))?;
        let mut merged = incoming.clone();
        merged.merge_missing(&current);
        self.mem.update(&incoming.id, merged).await
    }

    /// Remove from all three tiers; the access counter goes last, outside the
    /// transaction. Deleting an id that is absent everywhere is a no-op.
    pub async fn apply_delete_student(&self, id: String) -> Result<(), RollbookError> {
        let mut tx = self.store.begin();

        match self.cache.delete_student(&id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(%id, "not cached, nothing to delete"),
            Err(e) => {
                warn!(%id, error = %e, "cache delete failed, rolling back");
                self.store.rollback(tx);
                return Err(e);
            }
        }

        if !self.mem.remove(&id).await {
            debug!(%id, "not in memory, nothing to delete");
        }

        self.store.delete_student(&mut tx, &id);
        self.store.commit(tx).await?;
        if let Err(e) = self.store.delete_count(&id).await {
            warn!(%id, error = %e, "failed to delete access counter");
        }
        info!(%id, "student deleted");
        Ok(())
    }

    /// Replace the cache contents with the store's hot set.
    pub async fn apply_reload_cache(&self) -> Result<(), RollbookError> {
        let students = self.store.hot_students().await?;
        self.cache.reload(&students).await?;
        info!(count = students.len(), "cache reloaded with the hot set");
        Ok(())
    }

    pub async fn apply_periodic_delete(&self, examine_size: usize) -> Result<(), RollbookError> {
        debug!(examine_size, "sampled expiry pass");
        self.mem.periodic_delete(examine_size).await;
        Ok(())
    }

    pub async fn apply_update_peers(&self, peer: Peer) {
        self.peers.add(peer).await;
    }

    // -----------------------------------------------------------------------
    // Startup rehydration
    // -----------------------------------------------------------------------

    /// Preheat the memory tier from the cache, loading at most
    /// `floor(capacity × load_ratio)` entries.
    pub async fn load_cache_to_memory(
        &self,
        capacity: usize,
        load_ratio: f64,
    ) -> Result<(), RollbookError> {
        let students = self.cache.get_all_students().await?;
        let loaded = self.fill_memory(students, capacity, load_ratio).await;
        info!(loaded, "memory preheated from cache");
        Ok(())
    }

    /// Fallback preheat from the store's hot set, capped identically. Used
    /// when the cache scan fails.
    pub async fn load_database_to_memory(
        &self,
        capacity: usize,
        load_ratio: f64,
    ) -> Result<(), RollbookError> {
        let students = self.store.hot_students().await?;
        let loaded = self.fill_memory(students, capacity, load_ratio).await;
        info!(loaded, "memory preheated from the store");
        Ok(())
    }

    async fn fill_memory(&self, students: Vec<Student>, capacity: usize, load_ratio: f64) -> usize {
        let limit = (capacity as f64 * load_ratio).floor() as usize;
        let mut loaded = 0;
        for student in students {
            if loaded >= limit {
                break;
            }
            self.mem.set(&student.id, student.clone(), student.expiration).await;
            loaded += 1;
        }
        loaded
    }
}

impl<C: CacheStore> Applier for Coordinator<C> {
    async fn apply_add(&self, student: Student) -> Result<(), RollbookError> {
        self.apply_add_student(student).await
    }

    async fn apply_update(&self, student: Student) -> Result<(), RollbookError> {
        self.apply_update_student(student).await
    }

    async fn apply_delete(&self, id: String) -> Result<(), RollbookError> {
        self.apply_delete_student(id).await
    }

    async fn apply_reload_cache(&self) -> Result<(), RollbookError> {
        Coordinator::apply_reload_cache(self).await
    }

    async fn apply_periodic_delete(&self, examine_size: usize) -> Result<(), RollbookError> {
        Coordinator::apply_periodic_delete(self, examine_size).await
    }

    async fn apply_update_peers(&self, peer: Peer) {
        Coordinator::apply_update_peers(self, peer).await
    }
}

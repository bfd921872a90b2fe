use std::collections::HashMap;
use std::time::Duration;

use lru::LruCache;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use rbook_types::{RollbookError, Student};

/// Fixed window by which a deadline is extended on every read or update of a
/// key that carries one. Hot keys therefore get a sliding TTL regardless of
/// their original expiration.
const RENEWAL_WINDOW: Duration = Duration::from_secs(3600);

struct MemInner {
    /// Front = most recently used. Evictions pop from the back.
    lru: LruCache<String, Student>,
    /// Deadline per key; keys without an entry never expire.
    expires: HashMap<String, Instant>,
}

/// Bounded in-process tier.
///
/// One reader-writer lock serialises all access; every public operation takes
/// the exclusive mode because even reads mutate (LRU promotion, deadline
/// renewal, eviction of an expired hit). The lock is never taken recursively:
/// eviction and expiry work on the already-locked inner state.
pub struct MemTable {
    capacity: usize,
    evict_ratio: f64,
    inner: RwLock<MemInner>,
}

impl MemTable {
    pub fn new(capacity: usize, evict_ratio: f64) -> Self {
        MemTable {
            capacity: capacity.max(1),
            evict_ratio,
            inner: RwLock::new(MemInner {
                // Capacity is enforced by the bulk-eviction path, not by the
                // cache itself.
                lru: LruCache::unbounded(),
                expires: HashMap::new(),
            }),
        }
    }

    /// Insert `value` at the LRU front. When the tier is full a bulk eviction
    /// runs first. `ttl_secs > 0` sets a deadline; `0` means never expires.
    pub async fn set(&self, key: &str, value: Student, ttl_secs: i64) {
        let mut g = self.inner.write().await;
        if g.lru.len() >= self.capacity {
            evict(&mut g, self.capacity, self.evict_ratio);
        }
        if ttl_secs > 0 {
            let deadline = Instant::now() + Duration::from_secs(ttl_secs as u64);
            g.expires.insert(key.to_string(), deadline);
            debug!(key, ttl_secs, "memory set with deadline");
        } else {
            g.expires.remove(key);
            debug!(key, "memory set");
        }
        g.lru.put(key.to_string(), value);
    }

    /// Observing an expired key evicts it and reports absence. A live hit is
    /// promoted to the LRU front and, if it carries a deadline, renewed by
    /// [`RENEWAL_WINDOW`].
    pub async fn get(&self, key: &str) -> Option<Student> {
        let mut g = self.inner.write().await;
        if let Some(deadline) = g.expires.get(key).copied() {
            if Instant::now() > deadline {
                g.lru.pop(key);
                g.expires.remove(key);
                debug!(key, "memory key expired on read");
                return None;
            }
            g.expires.insert(key.to_string(), Instant::now() + RENEWAL_WINDOW);
        }
        g.lru.get(key).cloned()
    }

    /// Overwrite an existing key; same expiry and renewal rules as [`get`].
    ///
    /// [`get`]: MemTable::get
    pub async fn update(&self, key: &str, value: Student) -> Result<(), RollbookError> {
        let mut g = self.inner.write().await;
        if let Some(deadline) = g.expires.get(key).copied() {
            if Instant::now() > deadline {
                g.lru.pop(key);
                g.expires.remove(key);
                debug!(key, "memory key expired on update");
                return Err(RollbookError::Expired(key.to_string()));
            }
            g.expires.insert(key.to_string(), Instant::now() + RENEWAL_WINDOW);
            g.lru.put(key.to_string(), value);
            return Ok(());
        }
        if g.lru.contains(key) {
            g.lru.put(key.to_string(), value);
            Ok(())
        } else {
            Err(RollbookError::NotFound(key.to_string()))
        }
    }

    /// Unconditional removal from both structures; idempotent. Returns whether
    /// the key was present.
    pub async fn remove(&self, key: &str) -> bool {
        let mut g = self.inner.write().await;
        g.expires.remove(key);
        g.lru.pop(key).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.lru.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sampled expiry: snapshot the keys that carry deadlines, shuffle, scan
    /// the first `min(examine_size, n)` and delete those past deadline.
    ///
    /// The sampled set differs across replicas; that is tolerable because the
    /// only effect is removing keys that are already expired everywhere.
    pub async fn periodic_delete(&self, examine_size: usize) {
        let mut g = self.inner.write().await;
        let mut keys: Vec<String> = g.expires.keys().cloned().collect();
        if keys.is_empty() {
            return;
        }
        keys.shuffle(&mut rand::thread_rng());
        let now = Instant::now();
        for key in keys.into_iter().take(examine_size) {
            if g.expires.get(&key).is_some_and(|deadline| now > *deadline) {
                g.lru.pop(&key);
                g.expires.remove(&key);
                debug!(%key, "periodic delete removed expired key");
            }
        }
    }
}

/// Remove `ceil(capacity × evict_ratio)` entries (minimum one) from the LRU
/// tail. Runs on the already-held write lock; fires only from the overflow
/// path in [`MemTable::set`].
fn evict(inner: &mut MemInner, capacity: usize, evict_ratio: f64) {
    let count = ((capacity as f64 * evict_ratio).ceil() as usize).max(1);
    debug!(capacity, count, "memory tier full, bulk evicting from the LRU tail");
    for _ in 0..count {
        match inner.lru.pop_lru() {
            Some((key, _)) => {
                inner.expires.remove(&key);
                debug!(%key, "evicted");
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(id: &str) -> Student {
        Student {
            id: id.into(),
            name: format!("name-{id}"),
            gender: "F".into(),
            class: "1-1".into(),
            grades: Default::default(),
            expiration: 0,
        }
    }

    async fn set(mem: &MemTable, id: &str, ttl: i64) {
        mem.set(id, student(id), ttl).await;
    }

    #[tokio::test]
    async fn overflow_evicts_bulk_from_the_tail() {
        // capacity 3, ratio 0.5 → ceil(1.5) = 2 evicted on overflow.
        let mem = MemTable::new(3, 0.5);
        set(&mem, "a", 0).await;
        set(&mem, "b", 0).await;
        set(&mem, "c", 0).await;
        set(&mem, "d", 0).await;

        assert!(mem.get("a").await.is_none());
        assert!(mem.get("b").await.is_none());
        assert!(mem.get("c").await.is_some());
        assert!(mem.get("d").await.is_some());
        assert_eq!(mem.len().await, 2);
    }

    #[tokio::test]
    async fn tiny_ratio_still_evicts_one() {
        let mem = MemTable::new(3, 0.01);
        set(&mem, "a", 0).await;
        set(&mem, "b", 0).await;
        set(&mem, "c", 0).await;
        set(&mem, "d", 0).await;

        assert_eq!(mem.len().await, 3);
        assert!(mem.get("a").await.is_none(), "oldest entry should be gone");
    }

    #[tokio::test]
    async fn reads_promote_against_eviction() {
        let mem = MemTable::new(3, 0.3); // ceil(0.9) = 1 per overflow
        set(&mem, "a", 0).await;
        set(&mem, "b", 0).await;
        set(&mem, "c", 0).await;
        assert!(mem.get("a").await.is_some());
        set(&mem, "d", 0).await;

        // "b" was the least recently used after the promotion of "a".
        assert!(mem.get("b").await.is_none());
        assert!(mem.get("a").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_key_reads_absent() {
        let mem = MemTable::new(8, 0.5);
        set(&mem, "x", 1).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(mem.get("x").await.is_none());
        assert_eq!(mem.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_slides_the_deadline() {
        let mem = MemTable::new(8, 0.5);
        set(&mem, "x", 1).await;
        // Touch within the TTL: deadline extends by the renewal window.
        assert!(mem.get("x").await.is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(mem.get("x").await.is_some(), "renewed key must outlive its original TTL");
    }

    #[tokio::test(start_paused = true)]
    async fn update_distinguishes_expired_from_missing() {
        let mem = MemTable::new(8, 0.5);
        set(&mem, "x", 1).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        let expired = mem.update("x", student("x")).await.unwrap_err();
        assert!(expired.is_expired());
        let missing = mem.update("y", student("y")).await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn update_overwrites_live_entry() {
        let mem = MemTable::new(8, 0.5);
        set(&mem, "x", 0).await;
        let mut changed = student("x");
        changed.name = "changed".into();
        mem.update("x", changed).await.unwrap();
        assert_eq!(mem.get("x").await.unwrap().name, "changed");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let mem = MemTable::new(8, 0.5);
        set(&mem, "x", 30).await;
        assert!(mem.remove("x").await);
        assert!(!mem.remove("x").await);
        assert_eq!(mem.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_delete_reaps_only_expired_keys() {
        let mem = MemTable::new(8, 0.5);
        set(&mem, "a", 1).await;
        set(&mem, "b", 1).await;
        set(&mem, "keep-ttl", 120).await;
        set(&mem, "keep-forever", 0).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        mem.periodic_delete(16).await;
        assert_eq!(mem.len().await, 2);
        assert!(mem.get("keep-ttl").await.is_some());
        assert!(mem.get("keep-forever").await.is_some());

        // Idempotent under a frozen clock.
        mem.periodic_delete(16).await;
        assert_eq!(mem.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_delete_examines_at_most_the_sample_size() {
        let mem = MemTable::new(64, 0.5);
        for i in 0..10 {
            set(&mem, &format!("k{i}"), 1).await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        mem.periodic_delete(4).await;
        assert_eq!(mem.len().await, 6, "exactly the sampled keys are reaped");
    }
}

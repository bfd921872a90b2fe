use std::collections::HashMap;
use std::future::Future;

use tokio::sync::RwLock;

use rbook_types::{RollbookError, Student};

/// Shared-cache tier: a durable-but-volatile store of whole records keyed by
/// id, reconstructable from the store of record at any time.
///
/// Methods use RPITIT (`-> impl Future + Send`) so async callers can await
/// across thread boundaries without an `async-trait` dependency.
///
/// Absence is a value: `get_student` returns `Ok(None)` for a missing record,
/// while transport failures surface as `RollbookError::Cache` unchanged.
pub trait CacheStore: Send + Sync + 'static {
    fn add_student(&self, student: &Student)
        -> impl Future<Output = Result<(), RollbookError>> + Send;

    fn get_student(&self, id: &str)
        -> impl Future<Output = Result<Option<Student>, RollbookError>> + Send;

    /// Merge-update: empty-string fields preserve the cached value, grades
    /// upsert by subject. `NotFound` when the record is absent.
    fn update_student(&self, student: &Student)
        -> impl Future<Output = Result<(), RollbookError>> + Send;

    /// `NotFound` when the record is absent.
    fn delete_student(&self, id: &str)
        -> impl Future<Output = Result<(), RollbookError>> + Send;

    fn get_all_students(&self)
        -> impl Future<Output = Result<Vec<Student>, RollbookError>> + Send;

    /// Purge everything, then re-insert `students`. Not transactional across
    /// the purge boundary; partial state is healed by the next reload.
    fn reload(&self, students: &[Student])
        -> impl Future<Output = Result<(), RollbookError>> + Send;
}

// ---------------------------------------------------------------------------
// MemCache — in-memory CacheStore
// ---------------------------------------------------------------------------

/// In-memory `CacheStore` backed by a `HashMap`.
///
/// Intended for unit tests; not shared between processes.
#[derive(Default)]
pub struct MemCache {
    inner: RwLock<HashMap<String, Student>>,
}

impl MemCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemCache {
    async fn add_student(&self, student: &Student) -> Result<(), RollbookError> {
        self.inner.write().await.insert(student.id.clone(), student.clone());
        Ok(())
    }

    async fn get_student(&self, id: &str) -> Result<Option<Student>, RollbookError> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn update_student(&self, student: &Student) -> Result<(), RollbookError> {
        let mut g = self.inner.write().await;
        let current = g
            .get(&student.id)
            .cloned()
            .ok_or_else(|| RollbookError::NotFound(student.id.clone()))?;
        let mut merged = student.clone();
        merged.merge_missing(&current);
        g.insert(student.id.clone(), merged);
        Ok(())
    }

    async fn delete_student(&self, id: &str) -> Result<(), RollbookError> {
        match self.inner.write().await.remove(id) {
            Some(_) => Ok(()),
            None => Err(RollbookError::NotFound(id.to_string())),
        }
    }

    async fn get_all_students(&self) -> Result<Vec<Student>, RollbookError> {
        Ok(self.inner.read().await.values().cloned().collect())
    }

    async fn reload(&self, students: &[Student]) -> Result<(), RollbookError> {
        let mut g = self.inner.write().await;
        g.clear();
        for student in students {
            g.insert(student.id.clone(), student.clone());
        }
        Ok(())
    }
}

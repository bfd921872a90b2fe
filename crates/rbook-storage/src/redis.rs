use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use rbook_types::{RollbookError, Student};

use crate::cache::CacheStore;

/// Key prefix for cached records.
const STUDENT_KEY_PREFIX: &str = "student:";

fn cache_key(id: &str) -> String {
    format!("{STUDENT_KEY_PREFIX}{id}")
}

fn cache_err(e: redis::RedisError) -> RollbookError {
    RollbookError::Cache(e.to_string())
}

/// `CacheStore` backed by a Redis hash per record.
///
/// Field layout mirrors the record: `id`, `name`, `gender`, `class`,
/// `expiration`, plus `grade` holding the grades map as an embedded JSON
/// blob. `expiration` is persisted verbatim so loaders can recreate memory
/// entries with the original TTL.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to `addr` (host:port) selecting logical database `db`.
    pub async fn connect(addr: &str, password: &str, db: i64) -> Result<Self, RollbookError> {
        let url = if password.is_empty() {
            format!("redis://{addr}/{db}")
        } else {
            format!("redis://:{password}@{addr}/{db}")
        };
        let client = redis::Client::open(url.as_str()).map_err(cache_err)?;
        let conn = ConnectionManager::new(client).await.map_err(cache_err)?;
        Ok(RedisCache { conn })
    }

    fn parse_student(id: &str, fields: &HashMap<String, String>) -> Result<Student, RollbookError> {
        let expiration = fields
            .get("expiration")
            .map(|raw| raw.parse::<i64>())
            .transpose()
            .map_err(|e| RollbookError::Cache(format!("bad expiration for {id}: {e}")))?
            .unwrap_or(0);
        let grades = match fields.get("grade") {
            Some(blob) => serde_json::from_str(blob)
                .map_err(|e| RollbookError::Cache(format!("bad grade blob for {id}: {e}")))?,
            None => Default::default(),
        };
        Ok(Student {
            id: fields.get("id").cloned().unwrap_or_else(|| id.to_string()),
            name: fields.get("name").cloned().unwrap_or_default(),
            gender: fields.get("gender").cloned().unwrap_or_default(),
            class: fields.get("class").cloned().unwrap_or_default(),
            grades,
            expiration,
        })
    }
}

impl CacheStore for RedisCache {
    async fn add_student(&self, student: &Student) -> Result<(), RollbookError> {
        let grades = serde_json::to_string(&student.grades)
            .map_err(|e| RollbookError::Cache(e.to_string()))?;
        let fields = [
            ("id", student.id.clone()),
            ("name", student.name.clone()),
            ("gender", student.gender.clone()),
            ("class", student.class.clone()),
            ("grade", grades),
            ("expiration", student.expiration.to_string()),
        ];
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(cache_key(&student.id), &fields)
            .await
            .map_err(cache_err)?;
        debug!(id = %student.id, "cached student");
        Ok(())
    }

    async fn get_student(&self, id: &str) -> Result<Option<Student>, RollbookError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(cache_key(id)).await.map_err(cache_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Self::parse_student(id, &fields).map(Some)
    }

    async fn update_student(&self, student: &Student) -> Result<(), RollbookError> {
        let current = self
            .get_student(&student.id)
            .await?
            .ok_or_else(|| RollbookError::NotFound(student.id.clone()))?;
        let mut merged = student.clone();
        merged.merge_missing(&current);
        self.add_student(&merged).await
    }

    async fn delete_student(&self, id: &str) -> Result<(), RollbookError> {
        if self.get_student(id).await?.is_none() {
            return Err(RollbookError::NotFound(id.to_string()));
        }
        let mut conn = self.conn.clone();
        let _: () = conn.del(cache_key(id)).await.map_err(cache_err)?;
        debug!(id, "removed student from cache");
        Ok(())
    }

    async fn get_all_students(&self) -> Result<Vec<Student>, RollbookError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .keys(format!("{STUDENT_KEY_PREFIX}*"))
            .await
            .map_err(cache_err)?;
        let mut students = Vec::with_capacity(keys.len());
        for key in keys {
            let fields: HashMap<String, String> =
                conn.hgetall(&key).await.map_err(cache_err)?;
            if fields.is_empty() {
                // Raced with a delete; skip.
                continue;
            }
            let id = key.trim_start_matches(STUDENT_KEY_PREFIX);
            students.push(Self::parse_student(id, &fields)?);
        }
        Ok(students)
    }

    async fn reload(&self, students: &[Student]) -> Result<(), RollbookError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        for student in students {
            self.add_student(student).await?;
        }
        debug!(count = students.len(), "cache reloaded");
        Ok(())
    }
}

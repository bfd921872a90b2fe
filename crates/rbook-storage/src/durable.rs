use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use rbook_types::{AccessCount, RollbookError, Student};

use crate::keys::{count_key, grade_key, grade_prefix, student_key};

/// Size of the hot set returned by [`RecordStore::hot_student_counts`].
pub const HOT_SET_SIZE: usize = 10;

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, RollbookError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| RollbookError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, RollbookError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| RollbookError::Storage(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> RollbookError {
    RollbookError::Storage(e.to_string())
}

/// `students` table row. Grades live in their own keyspace.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StudentRow {
    pub id: String,
    pub name: String,
    pub gender: String,
    pub class: String,
    pub expiration: i64,
}

/// `grades` table row, keyed by `(student_id, subject)`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GradeRow {
    pub subject: String,
    pub score: f64,
    pub student_id: String,
}

enum TxOp {
    PutStudent(StudentRow),
    PutGrade(GradeRow),
    DeleteStudent(String),
    /// Remove every grade row belonging to the student.
    DeleteGrades(String),
}

/// A buffered write transaction against the store of record.
///
/// Writes are staged in order and materialised into one atomic fjall batch at
/// [`RecordStore::commit`]. Until then reads keep returning the pre-image,
/// which is what the cache-restore path relies on. Dropping an uncommitted
/// transaction discards its staged writes, so rollback happens on every exit
/// path, panics included.
pub struct StoreTx {
    ops: Vec<TxOp>,
}

struct StoreHandle {
    db: fjall::Database,
    /// `id` → bincode(StudentRow)
    students: fjall::Keyspace,
    /// `student_id ++ \x00 ++ subject` → bincode(GradeRow)
    grades: fjall::Keyspace,
    /// `student_id` → bincode(AccessCount)
    counts: fjall::Keyspace,
}

/// Transactional store of record for students, grades and access counts.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<StoreHandle>,
}

impl RecordStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, RollbookError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let students =
            db.keyspace("students", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let grades =
            db.keyspace("grades", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let counts =
            db.keyspace("counts", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(RecordStore { inner: Arc::new(StoreHandle { db, students, grades, counts }) })
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub fn begin(&self) -> StoreTx {
        StoreTx { ops: Vec::new() }
    }

    /// Discard the transaction. Equivalent to dropping it; kept explicit so
    /// the mutation paths read like their intent.
    pub fn rollback(&self, tx: StoreTx) {
        debug!(staged = tx.ops.len(), "store transaction rolled back");
    }

    /// Replay the staged writes into one atomic batch and commit it.
    pub async fn commit(&self, tx: StoreTx) -> Result<(), RollbookError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RollbookError> {
            let mut batch = store.db.batch();
            for op in &tx.ops {
                match op {
                    TxOp::PutStudent(row) => {
                        batch.insert(&store.students, student_key(&row.id), encode(row)?);
                    }
                    TxOp::PutGrade(row) => {
                        batch.insert(
                            &store.grades,
                            grade_key(&row.student_id, &row.subject),
                            encode(row)?,
                        );
                    }
                    TxOp::DeleteStudent(id) => {
                        batch.remove(&store.students, student_key(id));
                    }
                    TxOp::DeleteGrades(id) => {
                        let keys: Vec<Vec<u8>> = store
                            .grades
                            .prefix(grade_prefix(id))
                            .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                            .collect::<Result<_, _>>()?;
                        for k in keys {
                            batch.remove(&store.grades, k);
                        }
                    }
                }
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(|e| RollbookError::Storage(e.to_string()))?
    }

    /// Stage one student row plus one grade row per subject.
    pub fn add_student(&self, tx: &mut StoreTx, student: &Student) {
        tx.ops.push(TxOp::PutStudent(StudentRow {
            id: student.id.clone(),
            name: student.name.clone(),
            gender: student.gender.clone(),
            class: student.class.clone(),
            expiration: student.expiration,
        }));
        for (subject, score) in &student.grades {
            tx.ops.push(TxOp::PutGrade(GradeRow {
                subject: subject.clone(),
                score: *score,
                student_id: student.id.clone(),
            }));
        }
    }

    /// Stage an update. Fields carrying the empty-string sentinel keep their
    /// stored value; grades upsert by `(student_id, subject)`; `expiration`
    /// is left untouched. Reads the pre-image, so must run before any staged
    /// write for the same id would matter.
    pub async fn update_student(
        &self,
        tx: &mut StoreTx,
        student: &Student,
    ) -> Result<(), RollbookError> {
        let current = self
            .get_student_row(&student.id)
            .await?
            .ok_or_else(|| RollbookError::NotFound(student.id.clone()))?;
        tx.ops.push(TxOp::PutStudent(StudentRow {
            id: student.id.clone(),
            name: if student.name.is_empty() { current.name } else { student.name.clone() },
            gender: if student.gender.is_empty() { current.gender } else { student.gender.clone() },
            class: if student.class.is_empty() { current.class } else { student.class.clone() },
            expiration: current.expiration,
        }));
        for (subject, score) in &student.grades {
            tx.ops.push(TxOp::PutGrade(GradeRow {
                subject: subject.clone(),
                score: *score,
                student_id: student.id.clone(),
            }));
        }
        Ok(())
    }

    /// Stage removal of the student row and all its grade rows. Blind
    /// removes, so deleting an absent student is a no-op.
    pub fn delete_student(&self, tx: &mut StoreTx, id: &str) {
        tx.ops.push(TxOp::DeleteStudent(id.to_string()));
        tx.ops.push(TxOp::DeleteGrades(id.to_string()));
    }

    // -----------------------------------------------------------------------
    // Reads (no transaction)
    // -----------------------------------------------------------------------

    pub async fn get_student_row(&self, id: &str) -> Result<Option<StudentRow>, RollbookError> {
        let store = self.inner.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<StudentRow>, RollbookError> {
            match store.students.get(student_key(&id)).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<StudentRow>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| RollbookError::Storage(e.to_string()))?
    }

    pub async fn get_grades(&self, id: &str) -> Result<Vec<GradeRow>, RollbookError> {
        let store = self.inner.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<GradeRow>, RollbookError> {
            store
                .grades
                .prefix(grade_prefix(&id))
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<GradeRow>(&v))
                })
                .collect()
        })
        .await
        .map_err(|e| RollbookError::Storage(e.to_string()))?
    }

    /// The full record, or `None` when the student row is absent.
    pub async fn get_student(&self, id: &str) -> Result<Option<Student>, RollbookError> {
        let Some(row) = self.get_student_row(id).await? else {
            return Ok(None);
        };
        let grades = self.get_grades(id).await?;
        Ok(Some(assemble(row, grades)))
    }

    pub async fn get_all_students(&self) -> Result<Vec<Student>, RollbookError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Student>, RollbookError> {
            let mut students = Vec::new();
            let rows: Vec<StudentRow> = store
                .students
                .iter()
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<StudentRow>(&v))
                })
                .collect::<Result<_, _>>()?;
            for row in rows {
                let grades: Vec<GradeRow> = store
                    .grades
                    .prefix(grade_prefix(&row.id))
                    .map(|g| {
                        g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<GradeRow>(&v))
                    })
                    .collect::<Result<_, _>>()?;
                students.push(assemble(row, grades));
            }
            Ok(students)
        })
        .await
        .map_err(|e| RollbookError::Storage(e.to_string()))?
    }

    // -----------------------------------------------------------------------
    // Access counts (written outside transactions)
    // -----------------------------------------------------------------------

    pub async fn get_count(&self, id: &str) -> Result<Option<AccessCount>, RollbookError> {
        let store = self.inner.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<AccessCount>, RollbookError> {
            match store.counts.get(count_key(&id)).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<AccessCount>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| RollbookError::Storage(e.to_string()))?
    }

    /// Insert the counter at 1 or increment it.
    pub async fn touch_count(&self, id: &str) -> Result<(), RollbookError> {
        let store = self.inner.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), RollbookError> {
            let next = match store.counts.get(count_key(&id)).map_err(fjall_err)? {
                Some(b) => {
                    let current = decode::<AccessCount>(&b)?;
                    AccessCount { student_id: id.clone(), count: current.count + 1 }
                }
                None => AccessCount { student_id: id.clone(), count: 1 },
            };
            store.counts.insert(count_key(&id), encode(&next)?).map_err(fjall_err)
        })
        .await
        .map_err(|e| RollbookError::Storage(e.to_string()))?
    }

    /// Idempotent removal of the counter row.
    pub async fn delete_count(&self, id: &str) -> Result<(), RollbookError> {
        let store = self.inner.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            store.counts.remove(count_key(&id)).map_err(fjall_err)
        })
        .await
        .map_err(|e| RollbookError::Storage(e.to_string()))?
    }

    /// Top-[`HOT_SET_SIZE`] counters, highest first; ties break on id so the
    /// result is stable.
    pub async fn hot_student_counts(&self) -> Result<Vec<AccessCount>, RollbookError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<AccessCount>, RollbookError> {
            let mut counts: Vec<AccessCount> = store
                .counts
                .iter()
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<AccessCount>(&v))
                })
                .collect::<Result<_, _>>()?;
            counts.sort_by(|a, b| {
                b.count.cmp(&a.count).then_with(|| a.student_id.cmp(&b.student_id))
            });
            counts.truncate(HOT_SET_SIZE);
            Ok(counts)
        })
        .await
        .map_err(|e| RollbookError::Storage(e.to_string()))?
    }

    /// The hot set resolved to full records. A counter whose student row has
    /// been deleted in the meantime is skipped.
    pub async fn hot_students(&self) -> Result<Vec<Student>, RollbookError> {
        let mut students = Vec::new();
        for count in self.hot_student_counts().await? {
            match self.get_student(&count.student_id).await? {
                Some(student) => students.push(student),
                None => debug!(id = %count.student_id, "hot counter without a student row"),
            }
        }
        Ok(students)
    }
}

fn assemble(row: StudentRow, grades: Vec<GradeRow>) -> Student {
    Student {
        id: row.id,
        name: row.name,
        gender: row.gender,
        class: row.class,
        grades: grades.into_iter().map(|g| (g.subject, g.score)).collect(),
        expiration: row.expiration,
    }
}

use std::collections::BTreeMap;

/// Raft node identifier.
pub type NodeId = u64;

/// Success code carried by the HTTP response envelope.
pub const SUCCESS_CODE: i64 = 1;
/// Error code carried by the HTTP response envelope.
pub const ERROR_CODE: i64 = 0;

/// A student record as seen by every tier.
///
/// `expiration` is a TTL in seconds applied when the record enters the memory
/// tier; `0` means the entry never expires there. The durable store and the
/// shared cache persist it verbatim so later loaders can recreate memory
/// entries with the original TTL.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub gender: String,
    pub class: String,
    /// subject → score. Ordered map so replicated transitions stay
    /// deterministic across nodes.
    #[serde(default)]
    pub grades: BTreeMap<String, f64>,
    #[serde(default)]
    pub expiration: i64,
}

impl Student {
    /// Fill empty-string fields from `current` and upsert the incoming grades
    /// over the current grade map.
    ///
    /// The empty string is the "preserve" sentinel: an update that leaves
    /// `name`, `gender` or `class` empty keeps the stored value. Grades merge
    /// by subject, incoming scores winning.
    pub fn merge_missing(&mut self, current: &Student) {
        if self.name.is_empty() {
            self.name = current.name.clone();
        }
        if self.gender.is_empty() {
            self.gender = current.gender.clone();
        }
        if self.class.is_empty() {
            self.class = current.class.clone();
        }
        let mut grades = current.grades.clone();
        for (subject, score) in &self.grades {
            grades.insert(subject.clone(), *score);
        }
        self.grades = grades;
    }
}

/// Per-student read counter kept only in the durable store; drives hot-set
/// selection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccessCount {
    pub student_id: String,
    pub count: i64,
}

/// Another node in the consensus group. The peer set is part of replicated
/// state (see [`Command::UpdatePeers`]).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Peer {
    pub node_id: NodeId,
    /// Raft RPC address, `host:port`.
    pub raft_addr: String,
    /// Port of the peer's client HTTP surface.
    pub http_port: u16,
}

impl Peer {
    /// Host component of `raft_addr`, used to reach the peer's HTTP surface.
    pub fn host(&self) -> &str {
        self.raft_addr.split(':').next().unwrap_or("127.0.0.1")
    }
}

/// A command proposed through the replicated log.
///
/// The wire encoding is part of the cluster contract: followers forward these
/// to the leader and every replica decodes committed entries with exactly
/// these tags.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op")]
pub enum Command {
    #[serde(rename = "add")]
    Add { student: Student },
    #[serde(rename = "update")]
    Update { student: Student },
    #[serde(rename = "delete")]
    Delete { id: String },
    #[serde(rename = "reloadCacheData")]
    ReloadCacheData,
    #[serde(rename = "periodicDelete")]
    PeriodicDelete {
        #[serde(rename = "examineSize")]
        examine_size: usize,
    },
    #[serde(rename = "updatePeers")]
    UpdatePeers { peer: Peer },
}

/// Return value of a state-machine transition, inspected by the submitter.
/// Errors travel as data so a failed apply still commits at a log index.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommandOutcome {
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn ok() -> Self {
        CommandOutcome { error: None }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        CommandOutcome { error: Some(message.into()) }
    }
}

/// Response envelope shared by every HTTP endpoint; `code == 1` is success.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn success(data: serde_json::Value) -> Self {
        Envelope { code: SUCCESS_CODE, message: String::new(), data }
    }

    pub fn ok() -> Self {
        Self::success(serde_json::Value::Null)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope { code: ERROR_CODE, message: message.into(), data: serde_json::Value::Null }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RollbookError {
    #[error("student {0} not found")]
    NotFound(String),
    #[error("student {0} expired in memory")]
    Expired(String),
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("apply timed out")]
    Timeout,
    #[error("cache error: {0}")]
    Cache(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("consensus error: {0}")]
    Consensus(String),
    #[error("command rejected: {0}")]
    Apply(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RollbookError {
    /// Absence is a value, not a failure: reads fall through to the next tier
    /// and mutations tolerate it on update/delete.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RollbookError::NotFound(_))
    }

    /// Expiry is memory-tier only and treated as absence on read, tolerated
    /// on update.
    pub fn is_expired(&self) -> bool {
        matches!(self, RollbookError::Expired(_))
    }
}

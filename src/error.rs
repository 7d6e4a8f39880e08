//! Error types for ordq.

use thiserror::Error;

use crate::kv::StorageError;
use crate::model::{TaskId, TaskState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),

    /// A caller-chosen id that cannot be stored in a key.
    #[error("invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("task {id} is {state}, expected claimed")]
    InvalidState { id: TaskId, state: TaskState },

    /// Transient: every claim attempt lost to a concurrent transaction.
    #[error("claim contention: gave up after {attempts} attempts")]
    ClaimContention { attempts: u32 },

    /// Stored key bytes could not be decoded. Indicates storage corruption.
    #[error("malformed key: {0}")]
    MalformedKey(String),

    /// Stored value could not be decoded, or an index entry dangles.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the error came from a serializable conflict in the store.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Storage(StorageError::Conflict))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

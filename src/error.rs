use std::fmt;

use thiserror::Error;

use crate::protocol::codec::Payload;
use crate::protocol::key::TaskKey;

/// Failure reported by a worker for a single task. The exception and
/// traceback are opaque payloads produced by the worker's codec and are
/// forwarded to the submitting client verbatim.
#[derive(Debug)]
pub struct TaskFailure {
    pub key: TaskKey,
    pub exception: Payload,
    pub traceback: Option<Payload>,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} failed on worker", self.key)
    }
}

#[derive(Debug, Error)]
pub enum TgError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] rmp_serde::encode::Error),
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] rmp_serde::decode::Error),
    #[error("Malformed task graph: {0}")]
    MalformedGraph(String),
    #[error("No worker capacity: {0}")]
    NoCapacity(String),
    #[error("{0}")]
    TaskFailed(TaskFailure),
    #[error("{0}")]
    GenericError(String),
}

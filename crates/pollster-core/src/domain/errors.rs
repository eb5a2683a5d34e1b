//! Errors - one enum per collaborator, aggregated into [`PollsterError`].
//!
//! Classification used by the agent:
//! - transient: infra hiccup, retried with backoff at the call site
//! - data not found: the task can never run, it ends in `Error`
//! - worker fault: consumes a retry, a successor is created
//! - store inconsistency: logged, message postponed, task left alone

use thiserror::Error;

use super::ids::{DataId, PodId, TaskId};
use super::status::TaskStatus;

/// A conditional update lost: the record no longer matches the expectation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("conditional update lost: task is {status} (owner {owner:?})")]
pub struct CasFailure {
    pub status: TaskStatus,
    pub owner: Option<PodId>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error(transparent)]
    Conflict(#[from] CasFailure),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn as_conflict(&self) -> Option<&CasFailure> {
        match self {
            StoreError::Conflict(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("message {0} already settled")]
    AlreadySettled(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("data {0} not found")]
    NotFound(DataId),

    #[error("object storage unavailable: {0}")]
    Unavailable(String),

    #[error("scratch area: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a call to the external worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// Worker could not be reached; no work started.
    #[error("worker unavailable: {0}")]
    Unavailable(String),

    /// Worker crashed or broke the stream during execution.
    #[error("worker fault: {0}")]
    Fault(String),

    /// Hard abort fired.
    #[error("worker call aborted")]
    Aborted,
}

#[derive(Debug, Error)]
#[error("processing check failed: {0}")]
pub struct CheckerError(pub String);

/// Infra errors that are worth retrying with backoff.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl Transient for QueueError {
    fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

impl Transient for CheckerError {
    fn is_transient(&self) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum PollsterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Checker(#[from] CheckerError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// The store holds a record no agent should have produced.
    #[error("store inconsistency on {task_id}: {reason}")]
    Inconsistent { task_id: TaskId, reason: String },

    #[error("handler task failed: {0}")]
    Join(String),
}

impl From<CasFailure> for PollsterError {
    fn from(value: CasFailure) -> Self {
        PollsterError::Store(StoreError::Conflict(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailability_is_transient() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::NotFound(TaskId::random()).is_transient());
        assert!(
            !StoreError::Conflict(CasFailure {
                status: TaskStatus::Dispatched,
                owner: None
            })
            .is_transient()
        );
        assert!(!StorageError::NotFound(DataId::random()).is_transient());
    }

    #[test]
    fn conflict_is_reachable_through_the_aggregate() {
        let err: PollsterError = CasFailure {
            status: TaskStatus::Processing,
            owner: Some(PodId::new("other")),
        }
        .into();

        match err {
            PollsterError::Store(store) => {
                assert_eq!(store.as_conflict().map(|c| c.status), Some(TaskStatus::Processing))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

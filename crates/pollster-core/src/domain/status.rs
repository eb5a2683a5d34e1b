//! Status enums shared by the store, the queue and the agent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a task record.
///
/// State transitions:
/// - Creating -> Submitted -> Dispatched -> Processing -> Completed
/// - Processing -> Error | Timeout | Retried
/// - Dispatched | Processing -> Cancelling -> Cancelled
/// - Pending / Paused are suspended states set by administration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Created, data dependencies not resolved yet.
    Creating,

    /// Ready and pushed to the queue.
    Submitted,

    /// Claimed by an agent, execution not started.
    Dispatched,

    /// Execution started on the owning agent.
    Processing,

    Completed,
    Error,
    Timeout,

    /// Cancellation requested while the task may still be running.
    Cancelling,
    Cancelled,

    /// Superseded: a successor task continues the lineage.
    Retried,

    Paused,
    Pending,
}

impl TaskStatus {
    /// No further transition will ever happen from this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Error
                | TaskStatus::Timeout
                | TaskStatus::Cancelled
                | TaskStatus::Retried
        )
    }

    /// Statuses in which an owner pod holds the task.
    pub fn is_owned(self) -> bool {
        matches!(self, TaskStatus::Dispatched | TaskStatus::Processing)
    }

    pub fn is_cancellation(self) -> bool {
        matches!(self, TaskStatus::Cancelling | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Administrative status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Running,
    Paused,
    Cancelled,
    Closed,
    Purged,
    Deleted,
}

impl SessionStatus {
    /// Tasks of this session must not be started anymore.
    pub fn is_terminated(self) -> bool {
        matches!(
            self,
            SessionStatus::Cancelled
                | SessionStatus::Closed
                | SessionStatus::Purged
                | SessionStatus::Deleted
        )
    }
}

/// Disposition of a delivered queue message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueMessageStatus {
    /// Nothing decided yet; released back to the queue if left as is.
    Waiting,

    /// Not processable right now; redeliver later.
    Postponed,

    /// Fully handled; remove from the queue.
    Processed,

    /// Task will not run; remove from the queue.
    Cancelled,

    /// Message must never be delivered again.
    Poisonous,

    Running,
    Failed,
}

/// What the transport does with a message once its handler is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Release,
    Reject,
}

impl QueueMessageStatus {
    pub fn settlement(self) -> Settlement {
        match self {
            QueueMessageStatus::Processed | QueueMessageStatus::Cancelled => Settlement::Ack,
            QueueMessageStatus::Poisonous => Settlement::Reject,
            QueueMessageStatus::Waiting
            | QueueMessageStatus::Postponed
            | QueueMessageStatus::Running
            | QueueMessageStatus::Failed => Settlement::Release,
        }
    }
}

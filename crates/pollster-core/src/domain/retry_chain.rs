//! Retry chain - a failed task is superseded by a successor that continues
//! its lineage, until the lineage runs out of retries.

use chrono::{DateTime, Utc};

use super::ids::TaskId;
use super::status::TaskStatus;
use super::task::TaskRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    /// Mark the task `Retried` and create a successor.
    Retry,
    /// Budget spent: the lineage ends in `Error`.
    Exhausted,
}

impl RetryPlan {
    pub fn for_task(task: &TaskRecord) -> Self {
        if task.retry_of_ids.len() >= task.options.max_retries() as usize {
            RetryPlan::Exhausted
        } else {
            RetryPlan::Retry
        }
    }

    pub fn failed_status(self) -> TaskStatus {
        match self {
            RetryPlan::Retry => TaskStatus::Retried,
            RetryPlan::Exhausted => TaskStatus::Error,
        }
    }
}

/// Successor of `parent`, in `Creating` and without owner.
pub fn successor(parent: &TaskRecord, task_id: TaskId, now: DateTime<Utc>) -> TaskRecord {
    let mut retry_of_ids = parent.retry_of_ids.clone();
    retry_of_ids.push(parent.task_id);

    TaskRecord {
        task_id,
        initial_task_id: parent.initial_task_id,
        retry_of_ids,
        data_dependencies: parent.data_dependencies.clone(),
        remaining_data_dependencies: parent.remaining_data_dependencies.clone(),
        expected_output_ids: parent.expected_output_ids.clone(),
        ..TaskRecord::new(
            task_id,
            parent.session_id,
            parent.payload_id,
            parent.options.clone(),
            now,
        )
    }
}

use async_trait::async_trait;

use crate::domain::{CheckerError, PodId, SessionId, TaskId};

/// Asks the cluster whether a pod still runs a given task.
///
/// Only consulted when the acquisition decision cannot tell a slow owner from
/// a dead one.
#[async_trait]
pub trait ProcessingChecker: Send + Sync {
    async fn is_alive(
        &self,
        session_id: SessionId,
        task_id: TaskId,
        owner: &PodId,
    ) -> Result<bool, CheckerError>;
}

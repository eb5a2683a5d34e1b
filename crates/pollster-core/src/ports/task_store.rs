//! TaskStore port - タスクレコードの正本（source of truth）
//!
//! ストアはグリッド内の全エージェントで共有されます。エージェント間の同期は
//! [`TaskStore::conditional_update`] だけです。レコードが呼び出し側の
//! 最後に見た状態と一致するときにのみ書き込みが適用されます。

use async_trait::async_trait;

use crate::domain::{
    HealthCheckTag, HealthReport, PodId, StoreError, TaskId, TaskRecord, TaskStatus, TaskUpdate,
};

/// Owner condition of an [`Expected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerMatch {
    Any,
    Unowned,
    Is(PodId),
}

/// Precondition of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expected {
    pub statuses: Vec<TaskStatus>,
    pub owner: OwnerMatch,
}

impl Expected {
    pub fn status(status: TaskStatus) -> Self {
        Self::any_of(&[status])
    }

    pub fn any_of(statuses: &[TaskStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            owner: OwnerMatch::Any,
        }
    }

    pub fn unowned(mut self) -> Self {
        self.owner = OwnerMatch::Unowned;
        self
    }

    pub fn owned_by(mut self, pod_id: &PodId) -> Self {
        self.owner = OwnerMatch::Is(pod_id.clone());
        self
    }

    pub fn matches(&self, task: &TaskRecord) -> bool {
        let owner_ok = match &self.owner {
            OwnerMatch::Any => true,
            OwnerMatch::Unowned => task.owner_pod_id.is_none(),
            OwnerMatch::Is(pod_id) => task.is_owned_by(pod_id),
        };
        owner_ok && self.statuses.contains(&task.status)
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn check(&self, _tag: HealthCheckTag) -> HealthReport {
        HealthReport::healthy()
    }

    async fn read(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Applies `update` if the record matches `expected`.
    ///
    /// A mismatch is `StoreError::Conflict` carrying the current status and
    /// owner; a missing record is `StoreError::NotFound`.
    async fn conditional_update(
        &self,
        task_id: TaskId,
        expected: &Expected,
        update: TaskUpdate,
    ) -> Result<TaskRecord, StoreError>;

    /// Inserts the retry successor of `parent`.
    ///
    /// Keyed by parent id: if a successor already exists it is returned
    /// unchanged and `successor` is dropped.
    async fn create_successor(
        &self,
        parent: &TaskRecord,
        successor: TaskRecord,
    ) -> Result<TaskRecord, StoreError>;

    async fn find_successor(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DataId, SessionId, TaskOptions};
    use chrono::Utc;
    use rstest::rstest;

    fn dispatched_to(owner: Option<&str>) -> TaskRecord {
        let task = TaskRecord::new(
            TaskId::random(),
            SessionId::random(),
            DataId::random(),
            TaskOptions::default(),
            Utc::now(),
        )
        .with_status(TaskStatus::Dispatched);
        match owner {
            Some(owner) => task.with_owner(PodId::new(owner), Utc::now()),
            None => task,
        }
    }

    #[rstest]
    #[case::any_owner(Expected::status(TaskStatus::Dispatched), Some("a"), true)]
    #[case::unowned_hit(Expected::status(TaskStatus::Dispatched).unowned(), None, true)]
    #[case::unowned_miss(Expected::status(TaskStatus::Dispatched).unowned(), Some("a"), false)]
    #[case::owner_hit(Expected::status(TaskStatus::Dispatched).owned_by(&PodId::new("a")), Some("a"), true)]
    #[case::owner_miss(Expected::status(TaskStatus::Dispatched).owned_by(&PodId::new("a")), Some("b"), false)]
    #[case::status_miss(Expected::any_of(&[TaskStatus::Submitted, TaskStatus::Processing]), Some("a"), false)]
    fn expectation_matching(
        #[case] expected: Expected,
        #[case] owner: Option<&str>,
        #[case] matches: bool,
    ) {
        assert_eq!(expected.matches(&dispatched_to(owner)), matches);
    }
}

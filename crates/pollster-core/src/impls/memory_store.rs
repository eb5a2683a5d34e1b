//! In-memory task and session stores.
//!
//! One mutex guards the whole state, so every conditional update is atomic
//! with respect to every other one. Good enough for tests and the demo
//! binary; a real deployment plugs a database behind the same ports.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::dependency::DependencyIndex;
use crate::domain::{
    CasFailure, DataId, HealthCheckTag, HealthReport, Output, SessionId, SessionRecord,
    SessionStatus, StoreError, TaskId, TaskRecord, TaskStatus, TaskUpdate,
};
use crate::ports::{Expected, SessionStore, TaskStore};

#[derive(Default)]
struct StoreState {
    tasks: HashMap<TaskId, TaskRecord>,

    /// parent -> retry successor
    successors: HashMap<TaskId, TaskId>,

    dependencies: DependencyIndex,

    /// Results already produced.
    available: HashSet<DataId>,

    /// Results that will never be produced.
    aborted: HashSet<DataId>,

    /// Every status written, in order.
    transitions: Vec<(TaskId, TaskStatus)>,

    /// Remaining calls that fail with `Unavailable`.
    failures: u32,

    health: Option<HealthReport>,
}

impl StoreState {
    fn take_failure(&mut self) -> Result<(), StoreError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn insert(&mut self, mut task: TaskRecord) {
        task.remaining_data_dependencies
            .retain(|data| !self.available.contains(data));
        for data in &task.remaining_data_dependencies {
            self.dependencies.add_dependency(task.task_id, *data);
        }
        self.transitions.push((task.task_id, task.status));
        self.tasks.insert(task.task_id, task);
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record. Already produced data is dropped from
    /// its remaining dependencies.
    pub async fn insert(&self, task: TaskRecord) {
        self.state.lock().await.insert(task);
    }

    pub async fn get(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.state.lock().await.tasks.get(&task_id).cloned()
    }

    pub async fn all(&self) -> Vec<TaskRecord> {
        self.state.lock().await.tasks.values().cloned().collect()
    }

    /// Statuses written for `task_id`, oldest first.
    pub async fn transitions_of(&self, task_id: TaskId) -> Vec<TaskStatus> {
        self.state
            .lock()
            .await
            .transitions
            .iter()
            .filter(|(id, _)| *id == task_id)
            .map(|(_, status)| *status)
            .collect()
    }

    /// Every attempt of the lineage rooted at `initial_task_id`, in order.
    pub async fn lineage(&self, initial_task_id: TaskId) -> Vec<TaskRecord> {
        let mut attempts: Vec<TaskRecord> = self
            .state
            .lock()
            .await
            .tasks
            .values()
            .filter(|t| t.initial_task_id == initial_task_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|t| t.retry_of_ids.len());
        attempts
    }

    /// The next `n` calls fail with `StoreError::Unavailable`.
    pub async fn fail_next(&self, n: u32) {
        self.state.lock().await.failures = n;
    }

    pub async fn set_health(&self, report: Option<HealthReport>) {
        self.state.lock().await.health = report;
    }

    pub async fn is_available(&self, data: DataId) -> bool {
        self.state.lock().await.available.contains(&data)
    }

    /// Marks `data` as produced. Tasks that waited only for it and are still
    /// `Creating` move to `Submitted`; their ids are returned.
    pub async fn resolve_data(&self, data: DataId, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut state = self.state.lock().await;
        state.available.insert(data);

        let mut submitted = Vec::new();
        for (task_id, unblocked) in state.dependencies.resolve(data) {
            let Some(task) = state.tasks.get_mut(&task_id) else {
                continue;
            };
            task.remaining_data_dependencies.remove(&data);
            if unblocked && task.status == TaskStatus::Creating {
                task.apply(&TaskUpdate::status(TaskStatus::Submitted).with_submitted_date(now));
                submitted.push(task_id);
            }
        }
        for task_id in &submitted {
            state.transitions.push((*task_id, TaskStatus::Submitted));
        }
        submitted
    }

    pub async fn is_aborted(&self, data: DataId) -> bool {
        self.state.lock().await.aborted.contains(&data)
    }

    /// Marks `data` as never to be produced. Tasks still waiting for it in
    /// `Creating` or `Pending` end in `Error`; their ids are returned.
    pub async fn abort_data(&self, data: DataId, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut state = self.state.lock().await;
        state.aborted.insert(data);

        let mut failed = Vec::new();
        for task_id in state.dependencies.abort(data) {
            let Some(task) = state.tasks.get_mut(&task_id) else {
                continue;
            };
            if matches!(task.status, TaskStatus::Creating | TaskStatus::Pending) {
                let output = Output::error(format!("input data {data} was aborted"));
                task.apply(&TaskUpdate::finish(TaskStatus::Error, output, now));
                failed.push(task_id);
            }
        }
        for task_id in &failed {
            state.transitions.push((*task_id, TaskStatus::Error));
        }
        failed
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn check(&self, _tag: HealthCheckTag) -> HealthReport {
        self.state
            .lock()
            .await
            .health
            .clone()
            .unwrap_or_else(HealthReport::healthy)
    }

    async fn read(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn conditional_update(
        &self,
        task_id: TaskId,
        expected: &Expected,
        update: TaskUpdate,
    ) -> Result<TaskRecord, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        if !expected.matches(task) {
            return Err(CasFailure {
                status: task.status,
                owner: task.owner_pod_id.clone(),
            }
            .into());
        }

        task.apply(&update);
        let updated = task.clone();
        state.transitions.push((task_id, updated.status));
        Ok(updated)
    }

    async fn create_successor(
        &self,
        parent: &TaskRecord,
        successor: TaskRecord,
    ) -> Result<TaskRecord, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        if let Some(existing) = state
            .successors
            .get(&parent.task_id)
            .and_then(|id| state.tasks.get(id))
        {
            return Ok(existing.clone());
        }

        state.successors.insert(parent.task_id, successor.task_id);
        state.insert(successor.clone());
        Ok(successor)
    }

    async fn find_successor(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        Ok(state
            .successors
            .get(&task_id)
            .and_then(|id| state.tasks.get(id))
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: SessionRecord) {
        self.sessions
            .lock()
            .await
            .insert(session.session_id, session);
    }

    pub async fn set_status(&self, session_id: SessionId, status: SessionStatus) {
        if let Some(session) = self.sessions.lock().await.get_mut(&session_id) {
            session.status = status;
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn read(&self, session_id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.lock().await.get(&session_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PodId, TaskOptions};

    fn submitted() -> TaskRecord {
        TaskRecord::new(
            TaskId::random(),
            SessionId::random(),
            DataId::random(),
            TaskOptions::default(),
            Utc::now(),
        )
        .with_status(TaskStatus::Submitted)
    }

    #[tokio::test]
    async fn conditional_update_applies_only_on_match() {
        let store = InMemoryTaskStore::new();
        let task = submitted();
        store.insert(task.clone()).await;
        let pod = PodId::new("pod-a");

        let claim = Expected::status(TaskStatus::Submitted).unowned();
        let updated = store
            .conditional_update(task.task_id, &claim, TaskUpdate::dispatch(&pod, "a", Utc::now()))
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Dispatched);
        assert!(updated.is_owned_by(&pod));

        let err = store
            .conditional_update(task.task_id, &claim, TaskUpdate::dispatch(&pod, "a", Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(
            err.as_conflict(),
            Some(&CasFailure {
                status: TaskStatus::Dispatched,
                owner: Some(pod),
            })
        );
        assert_eq!(
            store.transitions_of(task.task_id).await,
            vec![TaskStatus::Submitted, TaskStatus::Dispatched]
        );
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let store = InMemoryTaskStore::new();
        let err = store
            .conditional_update(
                TaskId::random(),
                &Expected::status(TaskStatus::Submitted),
                TaskUpdate::status(TaskStatus::Dispatched),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn successor_creation_is_keyed_by_parent() {
        let store = InMemoryTaskStore::new();
        let parent = submitted();
        store.insert(parent.clone()).await;

        let first = crate::domain::retry_chain::successor(&parent, TaskId::random(), Utc::now());
        let second = crate::domain::retry_chain::successor(&parent, TaskId::random(), Utc::now());

        let created = store.create_successor(&parent, first.clone()).await.unwrap();
        let again = store.create_successor(&parent, second).await.unwrap();

        assert_eq!(created.task_id, first.task_id);
        assert_eq!(again.task_id, first.task_id);
        assert_eq!(
            store.find_successor(parent.task_id).await.unwrap().map(|t| t.task_id),
            Some(first.task_id)
        );
        assert_eq!(store.lineage(parent.task_id).await.len(), 2);
    }

    #[tokio::test]
    async fn resolving_data_submits_waiting_tasks() {
        let store = InMemoryTaskStore::new();
        let (a, b) = (DataId::random(), DataId::random());
        let task = submitted()
            .with_status(TaskStatus::Creating)
            .with_dependencies([a, b]);
        store.insert(task.clone()).await;

        assert!(store.resolve_data(a, Utc::now()).await.is_empty());
        assert_eq!(store.resolve_data(b, Utc::now()).await, vec![task.task_id]);

        let task = store.get(task.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Submitted);
        assert!(task.remaining_data_dependencies.is_empty());
        assert!(task.submitted_date.is_some());
    }

    #[tokio::test]
    async fn aborting_data_fails_tasks_waiting_for_it() {
        let store = InMemoryTaskStore::new();
        let (a, b) = (DataId::random(), DataId::random());
        let waiting = submitted()
            .with_status(TaskStatus::Creating)
            .with_dependencies([a, b]);
        store.insert(waiting.clone()).await;

        assert_eq!(store.abort_data(a, Utc::now()).await, vec![waiting.task_id]);
        assert!(store.is_aborted(a).await);

        let waiting = store.get(waiting.task_id).await.unwrap();
        assert_eq!(waiting.status, TaskStatus::Error);
        assert!(waiting.output.unwrap().error.unwrap().contains("aborted"));
        assert!(store.resolve_data(b, Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = InMemoryTaskStore::new();
        store.fail_next(1).await;

        assert!(matches!(
            store.read(TaskId::random()).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.read(TaskId::random()).await.unwrap().is_none());
    }
}

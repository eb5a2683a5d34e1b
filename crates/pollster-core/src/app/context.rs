//! AgentContext - ループと全タスクハンドラが共有する協調相手・設定・ヘルス

use std::sync::Arc;

use crate::app::health::HealthMonitor;
use crate::config::AgentConfig;
use crate::domain::{
    HealthCheckTag, HealthReport, PollsterError, SessionId, SessionRecord, StoreError, TaskId,
    TaskRecord, TaskUpdate,
};
use crate::ports::{
    Clock, Expected, IdGenerator, ObjectStorage, ProcessingChecker, PullQueue, PushQueue,
    ResultFinalizer, SessionStore, TaskStore, WorkerConnector,
};

pub struct AgentContext {
    pub tasks: Arc<dyn TaskStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub checker: Arc<dyn ProcessingChecker>,
    pub pull_queue: Arc<dyn PullQueue>,
    pub push_queue: Arc<dyn PushQueue>,
    pub storage: Arc<dyn ObjectStorage>,
    pub worker: Arc<dyn WorkerConnector>,
    pub finalizer: Arc<dyn ResultFinalizer>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub config: AgentConfig,
    pub health: HealthMonitor,
}

impl AgentContext {
    /// Initializes every collaborator, then marks the agent started.
    pub async fn init(&self) -> Result<(), PollsterError> {
        self.tasks.init().await?;
        self.sessions.init().await?;
        self.pull_queue.init().await?;
        self.storage.init().await?;
        self.worker.init().await?;
        self.health.mark_initialized();
        tracing::info!(pod_id = %self.config.pod_id(), "agent initialized");
        Ok(())
    }

    /// Startup: initialized. Readiness: every dependency reachable.
    /// Liveness: readiness plus the error budget; an unhealthy liveness
    /// result latches.
    pub async fn check(&self, tag: HealthCheckTag) -> HealthReport {
        match tag {
            HealthCheckTag::Startup => {
                if self.health.is_initialized() {
                    HealthReport::healthy()
                } else {
                    HealthReport::unhealthy("agent not initialized")
                }
            }
            HealthCheckTag::Readiness => self.dependencies(tag).await,
            HealthCheckTag::Liveness => {
                if self.health.is_failed() {
                    return HealthReport::unhealthy("agent latched unhealthy");
                }
                let report = self.dependencies(tag).await;
                if report.status == crate::domain::HealthStatus::Unhealthy {
                    self.health
                        .latch(report.description.as_deref().unwrap_or("dependency unhealthy"));
                }
                report
            }
        }
    }

    async fn dependencies(&self, tag: HealthCheckTag) -> HealthReport {
        HealthReport::healthy()
            .combine(self.tasks.check(tag).await)
            .combine(self.sessions.check(tag).await)
            .combine(self.pull_queue.check(tag).await)
            .combine(self.storage.check(tag).await)
            .combine(self.worker.check(tag).await)
    }

    /// Aborts the results of a task that ended without producing them.
    /// Failures are logged; the task's own outcome stands.
    pub(crate) async fn abort_results(&self, task_id: TaskId) {
        if let Err(e) = self.finalizer.abort(task_id).await {
            tracing::warn!(%task_id, error = %e, "failed to abort task results");
        }
    }

    pub(crate) async fn read_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let tasks = &self.tasks;
        self.config
            .infra_retry()
            .retry("read task", move || tasks.read(task_id))
            .await
    }

    pub(crate) async fn read_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let sessions = &self.sessions;
        self.config
            .infra_retry()
            .retry("read session", move || sessions.read(session_id))
            .await
    }

    pub(crate) async fn update_task(
        &self,
        task_id: TaskId,
        expected: &Expected,
        update: TaskUpdate,
    ) -> Result<TaskRecord, StoreError> {
        let tasks = &self.tasks;
        let update = &update;
        self.config
            .infra_retry()
            .retry("update task", move || {
                tasks.conditional_update(task_id, expected, update.clone())
            })
            .await
    }
}

//! AgentBuilder - エージェントの構築とワイヤリング
//!
//! `build()` は足りない協調相手をまとめて報告し、エージェントを作る前に
//! 設定を検証します。

use std::sync::Arc;

use crate::app::agent::Agent;
use crate::app::context::AgentContext;
use crate::app::health::HealthMonitor;
use crate::config::{AgentConfig, ConfigError};
use crate::ports::{
    Clock, IdGenerator, ObjectStorage, ProcessingChecker, PullQueue, PushQueue, ResultFinalizer,
    SessionStore, SystemClock, TaskStore, UlidGenerator, WorkerConnector,
};

/// Builds an [`Agent`].
///
/// # Example
/// ```ignore
/// let agent = AgentBuilder::new(config)
///     .task_store(tasks)
///     .session_store(sessions)
///     .processing_checker(checker)
///     .queues(queue.clone(), queue)
///     .object_storage(storage)
///     .worker(worker)
///     .result_finalizer(finalizer)
///     .build()?;
/// ```
///
/// The clock defaults to the system clock and ids to ULIDs drawn from it.
pub struct AgentBuilder {
    config: AgentConfig,
    tasks: Option<Arc<dyn TaskStore>>,
    sessions: Option<Arc<dyn SessionStore>>,
    checker: Option<Arc<dyn ProcessingChecker>>,
    pull_queue: Option<Arc<dyn PullQueue>>,
    push_queue: Option<Arc<dyn PushQueue>>,
    storage: Option<Arc<dyn ObjectStorage>>,
    worker: Option<Arc<dyn WorkerConnector>>,
    finalizer: Option<Arc<dyn ResultFinalizer>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing collaborators: {0:?}")]
    MissingCollaborators(Vec<&'static str>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            tasks: None,
            sessions: None,
            checker: None,
            pull_queue: None,
            push_queue: None,
            storage: None,
            worker: None,
            finalizer: None,
            clock: None,
            ids: None,
        }
    }

    pub fn task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn processing_checker(mut self, checker: Arc<dyn ProcessingChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Both sides of the task queue; often the same adapter.
    pub fn queues(mut self, pull: Arc<dyn PullQueue>, push: Arc<dyn PushQueue>) -> Self {
        self.pull_queue = Some(pull);
        self.push_queue = Some(push);
        self
    }

    pub fn object_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn worker(mut self, worker: Arc<dyn WorkerConnector>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn result_finalizer(mut self, finalizer: Arc<dyn ResultFinalizer>) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<Agent, BuildError> {
        self.config.validate()?;

        let mut missing = Vec::new();
        if self.tasks.is_none() {
            missing.push("task_store");
        }
        if self.sessions.is_none() {
            missing.push("session_store");
        }
        if self.checker.is_none() {
            missing.push("processing_checker");
        }
        if self.pull_queue.is_none() || self.push_queue.is_none() {
            missing.push("queues");
        }
        if self.storage.is_none() {
            missing.push("object_storage");
        }
        if self.worker.is_none() {
            missing.push("worker");
        }
        if self.finalizer.is_none() {
            missing.push("result_finalizer");
        }

        let (
            Some(tasks),
            Some(sessions),
            Some(checker),
            Some(pull_queue),
            Some(push_queue),
            Some(storage),
            Some(worker),
            Some(finalizer),
        ) = (
            self.tasks,
            self.sessions,
            self.checker,
            self.pull_queue,
            self.push_queue,
            self.storage,
            self.worker,
            self.finalizer,
        )
        else {
            return Err(BuildError::MissingCollaborators(missing));
        };

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())) as Arc<dyn IdGenerator>);
        let health = HealthMonitor::new(self.config.max_error_allowed());

        Ok(Agent::new(AgentContext {
            tasks,
            sessions,
            checker,
            pull_queue,
            push_queue,
            storage,
            worker,
            finalizer,
            clock,
            ids,
            config: self.config,
            health,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{
        InMemoryObjectStorage, InMemoryQueue, InMemoryResultFinalizer, InMemorySessionStore,
        InMemoryTaskStore, SimulatedWorker, StaticProcessingChecker, WorkerBehavior,
    };

    fn config() -> AgentConfig {
        AgentConfig::builder().build().unwrap()
    }

    fn full(config: AgentConfig) -> AgentBuilder {
        let tasks = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let finalizer =
            InMemoryResultFinalizer::new(tasks.clone(), queue.clone(), Arc::new(SystemClock));
        AgentBuilder::new(config)
            .task_store(tasks)
            .session_store(Arc::new(InMemorySessionStore::new()))
            .processing_checker(Arc::new(StaticProcessingChecker::new()))
            .queues(queue.clone(), queue)
            .object_storage(Arc::new(InMemoryObjectStorage::new()))
            .worker(Arc::new(SimulatedWorker::new(WorkerBehavior::Succeed)))
            .result_finalizer(Arc::new(finalizer))
    }

    #[test]
    fn test_build_success() {
        let agent = full(config()).build();
        assert!(agent.is_ok());
    }

    #[test]
    fn test_build_reports_every_missing_collaborator() {
        let result = AgentBuilder::new(config())
            .session_store(Arc::new(InMemorySessionStore::new()))
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingCollaborators(missing)) if missing == vec![
                "task_store",
                "processing_checker",
                "queues",
                "object_storage",
                "worker",
                "result_finalizer",
            ]
        ));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config: AgentConfig = toml::from_str("slots = 0").unwrap();
        let result = full(config).build();
        assert!(matches!(result, Err(BuildError::Config(ConfigError::ZeroValue { .. }))));
    }
}

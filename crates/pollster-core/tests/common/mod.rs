//! Shared wiring for the integration tests: one set of in-memory adapters,
//! any number of agents on top of it.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pollster_core::app::{Agent, AgentBuilder, RetryPolicy};
use pollster_core::config::{AgentConfig, AgentConfigBuilder};
use pollster_core::domain::{
    DataId, PodId, SessionId, SessionRecord, TaskId, TaskOptions, TaskRecord, TaskStatus,
};
use pollster_core::impls::{
    InMemoryObjectStorage, InMemoryQueue, InMemoryResultFinalizer, InMemorySessionStore,
    InMemoryTaskStore, SimulatedWorker, StaticProcessingChecker, WorkerBehavior,
};
use pollster_core::ports::{Clock, ManualClock};
use tempfile::TempDir;

pub struct Harness {
    pub tasks: Arc<InMemoryTaskStore>,
    pub sessions: Arc<InMemorySessionStore>,
    pub checker: Arc<StaticProcessingChecker>,
    pub queue: Arc<InMemoryQueue>,
    pub storage: Arc<InMemoryObjectStorage>,
    pub worker: Arc<SimulatedWorker>,
    pub clock: Arc<ManualClock>,
    pub session_id: SessionId,
    pub scratch: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let harness = Self {
            tasks: Arc::new(InMemoryTaskStore::new()),
            sessions: Arc::new(InMemorySessionStore::new()),
            checker: Arc::new(StaticProcessingChecker::new()),
            queue: Arc::new(
                InMemoryQueue::new()
                    .with_poll_timeout(Duration::from_millis(10))
                    .with_redelivery_delay(Duration::from_millis(50)),
            ),
            storage: Arc::new(InMemoryObjectStorage::new()),
            worker: Arc::new(SimulatedWorker::new(WorkerBehavior::Succeed)),
            clock: Arc::new(ManualClock::new(Utc::now())),
            session_id: SessionId::random(),
            scratch: TempDir::new().unwrap(),
        };
        harness
            .sessions
            .insert(SessionRecord::running(harness.session_id))
            .await;
        harness
    }

    /// Test defaults: short delays, no infra backoff wait.
    pub fn config(&self, pod: &str) -> AgentConfigBuilder {
        AgentConfig::builder()
            .pod_id(PodId::new(pod))
            .pull_idle_backoff(Duration::from_millis(5))
            .grace_delay(Duration::from_millis(50))
            .cancellation_poll_interval(Duration::from_millis(5))
            .infra_retry(RetryPolicy {
                base_delay: Duration::from_millis(1),
                multiplier: 1.0,
                max_attempts: 3,
            })
            .scratch_root(self.scratch.path())
    }

    pub fn agent(&self, pod: &str) -> Agent {
        self.agent_with(self.config(pod))
    }

    pub fn agent_with(&self, config: AgentConfigBuilder) -> Agent {
        self.builder(config).build().unwrap()
    }

    /// Fully wired builder; tests override single collaborators on it.
    pub fn builder(&self, config: AgentConfigBuilder) -> AgentBuilder {
        let clock: Arc<dyn Clock> = self.clock.clone();
        let finalizer =
            InMemoryResultFinalizer::new(self.tasks.clone(), self.queue.clone(), clock.clone());
        AgentBuilder::new(config.build().unwrap())
            .task_store(self.tasks.clone())
            .session_store(self.sessions.clone())
            .processing_checker(self.checker.clone())
            .queues(self.queue.clone(), self.queue.clone())
            .object_storage(self.storage.clone())
            .worker(self.worker.clone())
            .result_finalizer(Arc::new(finalizer))
            .clock(clock)
    }

    /// A `Submitted` task with its payload stored.
    pub async fn submitted(&self, options: TaskOptions) -> TaskRecord {
        let task = self.task(options).await.with_status(TaskStatus::Submitted);
        self.tasks.insert(task.clone()).await;
        task
    }

    /// A `Creating` task record with its payload stored; not inserted.
    pub async fn task(&self, options: TaskOptions) -> TaskRecord {
        let payload = DataId::random();
        self.storage.put(payload, b"payload".to_vec()).await;
        TaskRecord::new(
            TaskId::random(),
            self.session_id,
            payload,
            options,
            self.clock.now(),
        )
    }

    pub async fn status_of(&self, task_id: TaskId) -> TaskStatus {
        self.tasks.get(task_id).await.unwrap().status
    }
}

pub fn retries(max_retries: u32) -> TaskOptions {
    TaskOptions {
        max_retries: Some(max_retries),
        ..TaskOptions::default()
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pollster_core::AgentBuilder;
use pollster_core::config::AgentConfig;
use pollster_core::domain::{
    DataId, HealthCheckTag, Output, SessionId, SessionRecord, TaskId, TaskOptions, TaskRecord,
    TaskStatus, WorkerError,
};
use pollster_core::impls::{
    InMemoryObjectStorage, InMemoryQueue, InMemoryResultFinalizer, InMemorySessionStore,
    InMemoryTaskStore, StaticProcessingChecker,
};
use pollster_core::ports::{
    Clock, ComputeRequest, PushQueue, SystemClock, WorkerConnector, WorkerStream,
};

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
}

/// Worker that reads a JSON payload from the prefetched file and greets.
/// The first `remaining_failures` calls report an error.
struct HelloWorker {
    remaining_failures: Arc<AtomicU32>,
}

#[async_trait]
impl WorkerConnector for HelloWorker {
    async fn connect(
        &self,
        task_id: TaskId,
        _abort: CancellationToken,
        _deadline: Option<DateTime<Utc>>,
    ) -> Result<Box<dyn WorkerStream>, WorkerError> {
        Ok(Box::new(HelloStream {
            task_id,
            payload_id: None,
            payload: None,
            remaining_failures: self.remaining_failures.clone(),
        }))
    }
}

struct HelloStream {
    task_id: TaskId,
    payload_id: Option<DataId>,
    payload: Option<PathBuf>,
    remaining_failures: Arc<AtomicU32>,
}

#[async_trait]
impl WorkerStream for HelloStream {
    async fn send(&mut self, request: ComputeRequest) -> Result<(), WorkerError> {
        match request {
            ComputeRequest::Init { payload_id, .. } => self.payload_id = Some(payload_id),
            ComputeRequest::Data { data_id, path } if Some(data_id) == self.payload_id => {
                self.payload = Some(path)
            }
            ComputeRequest::Data { .. } => {}
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn reply(&mut self) -> Result<Output, WorkerError> {
        let Some(path) = self.payload.take() else {
            return Err(WorkerError::Fault("no payload received".into()));
        };
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| WorkerError::Fault(format!("read payload: {e}")))?;
        let payload: HelloPayload = match serde_json::from_slice(&bytes) {
            Ok(payload) => payload,
            Err(e) => return Ok(Output::error(format!("json decode: {e}"))),
        };

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Ok(Output::error(format!("intentional failure (left={left})")));
        }

        println!("Hello, {}! (task {})", payload.name, self.task_id);
        Ok(Output::success())
    }
}

async fn hello_task(
    storage: &InMemoryObjectStorage,
    session_id: SessionId,
    name: &str,
    now: DateTime<Utc>,
) -> Result<TaskRecord, serde_json::Error> {
    let payload_id = DataId::random();
    storage
        .put(payload_id, serde_json::to_vec(&serde_json::json!({ "name": name }))?)
        .await;
    let options = TaskOptions {
        max_retries: Some(2),
        ..TaskOptions::default()
    };
    Ok(TaskRecord::new(TaskId::random(), session_id, payload_id, options, now))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // (A) configuration: TOML file as first argument, defaults otherwise
    let config = match std::env::args().nth(1) {
        Some(path) => AgentConfig::from_toml_str(&tokio::fs::read_to_string(path).await?)?,
        None => AgentConfig::builder().slots(2).build()?,
    };

    // (B) in-memory platform
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tasks = Arc::new(InMemoryTaskStore::new());
    let sessions = Arc::new(InMemorySessionStore::new());
    let storage = Arc::new(InMemoryObjectStorage::new());
    let queue = Arc::new(InMemoryQueue::new().with_redelivery_delay(Duration::from_millis(200)));
    let finalizer = InMemoryResultFinalizer::new(tasks.clone(), queue.clone(), clock.clone());

    let agent = Arc::new(
        AgentBuilder::new(config)
            .task_store(tasks.clone())
            .session_store(sessions.clone())
            .processing_checker(Arc::new(StaticProcessingChecker::new()))
            .queues(queue.clone(), queue.clone())
            .object_storage(storage.clone())
            .worker(Arc::new(HelloWorker {
                remaining_failures: Arc::new(AtomicU32::new(2)),
            }))
            .result_finalizer(Arc::new(finalizer))
            .clock(clock.clone())
            .build()?,
    );

    // (C) one session, three greetings, and a farewell that waits on the first one
    let session_id = SessionId::random();
    sessions.insert(SessionRecord::running(session_id)).await;

    let greeting_output = DataId::random();
    storage.put(greeting_output, b"greeting".to_vec()).await;

    let mut submitted = Vec::new();
    for (i, name) in ["pollster", "armonik", "rust"].into_iter().enumerate() {
        let mut task = hello_task(&storage, session_id, name, clock.now()).await?;
        task = task.with_status(TaskStatus::Submitted);
        if i == 0 {
            task = task.with_expected_outputs([greeting_output]);
        }
        tasks.insert(task.clone()).await;
        submitted.push(task.task_id);
    }
    let farewell = hello_task(&storage, session_id, "farewell", clock.now())
        .await?
        .with_dependencies([greeting_output]);
    tasks.insert(farewell).await;

    queue.push(&submitted).await?;
    tracing::info!(count = submitted.len(), %session_id, "tasks submitted");

    // (D) run until every task is terminal or ctrl-c
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let agent = agent.clone();
        let shutdown = shutdown.clone();
        async move { agent.run(shutdown).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::warn!("interrupted, shutting down"),
        _ = async {
            while !tasks.all().await.iter().all(|t| t.status.is_terminal()) {
                sleep(Duration::from_millis(50)).await;
            }
        } => {}
    }
    shutdown.cancel();
    let exit = running.await??;

    // (E) report
    let mut all = tasks.all().await;
    all.sort_by_key(|t| (t.initial_task_id.to_string(), t.retry_of_ids.len()));
    for task in &all {
        let line = serde_json::json!({
            "task_id": task.task_id.to_string(),
            "initial_task_id": task.initial_task_id.to_string(),
            "attempt": task.retry_of_ids.len() + 1,
            "status": task.status.to_string(),
            "error": task.output.as_ref().and_then(|o| o.error.clone()),
        });
        println!("{line}");
    }
    println!(
        "handled={} acquired={} budget_exhausted={} liveness={:?}",
        exit.handled,
        exit.acquired,
        exit.budget_exhausted,
        agent.check(HealthCheckTag::Liveness).await.status
    );
    Ok(())
}

//! SimulatedWorker - 外部ワーカーの台本付き代役
//!
//! `connect` ごとに台本（なければデフォルト）の次の振る舞いを取り出し、
//! ストリーム上で再現します。テストとデモバイナリで使います。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::{HealthCheckTag, HealthReport, Output, TaskId, WorkerError};
use crate::ports::{ComputeRequest, WorkerConnector, WorkerStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerBehavior {
    /// Replies `Success` immediately.
    Succeed,
    /// Works for a while, then replies `Success`; bounded by the deadline.
    Work(Duration),
    /// Replies an application `Error`.
    Fail(String),
    /// Replies `Timeout`.
    TimeOut,
    /// Refuses the connection.
    Unreachable,
    /// Breaks the stream while executing.
    Crash(String),
    /// Never answers; only the hard abort ends the call.
    HangUntilAborted,
}

/// What the worker received for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCall {
    pub task_id: TaskId,
    pub requests: Vec<ComputeRequest>,
}

struct Counters {
    active: AtomicUsize,
    max_active: AtomicUsize,
}

pub struct SimulatedWorker {
    script: Mutex<VecDeque<WorkerBehavior>>,
    default: WorkerBehavior,
    calls: Arc<Mutex<Vec<WorkerCall>>>,
    counters: Arc<Counters>,
    health: Mutex<Option<HealthReport>>,
}

impl SimulatedWorker {
    pub fn new(default: WorkerBehavior) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default,
            calls: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(Counters {
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }),
            health: Mutex::new(None),
        }
    }

    /// Behaviors for the next connections, in order.
    pub async fn script(&self, behaviors: impl IntoIterator<Item = WorkerBehavior>) {
        self.script.lock().await.extend(behaviors);
    }

    pub async fn set_health(&self, report: Option<HealthReport>) {
        *self.health.lock().await = report;
    }

    /// Calls that reached `reply`.
    pub async fn calls(&self) -> Vec<WorkerCall> {
        self.calls.lock().await.clone()
    }

    /// Highest number of streams open at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedWorker {
    fn default() -> Self {
        Self::new(WorkerBehavior::Succeed)
    }
}

#[async_trait]
impl WorkerConnector for SimulatedWorker {
    async fn check(&self, _tag: HealthCheckTag) -> HealthReport {
        self.health
            .lock()
            .await
            .clone()
            .unwrap_or_else(HealthReport::healthy)
    }

    async fn connect(
        &self,
        task_id: TaskId,
        abort: CancellationToken,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Box<dyn WorkerStream>, WorkerError> {
        let behavior = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        if behavior == WorkerBehavior::Unreachable {
            return Err(WorkerError::Unavailable("connection refused".into()));
        }

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_active.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(SimulatedStream {
            task_id,
            behavior,
            abort,
            deadline,
            requests: Vec::new(),
            calls: self.calls.clone(),
            counters: self.counters.clone(),
        }))
    }
}

struct SimulatedStream {
    task_id: TaskId,
    behavior: WorkerBehavior,
    abort: CancellationToken,
    deadline: Option<DateTime<Utc>>,
    requests: Vec<ComputeRequest>,
    calls: Arc<Mutex<Vec<WorkerCall>>>,
    counters: Arc<Counters>,
}

impl Drop for SimulatedStream {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerStream for SimulatedStream {
    async fn send(&mut self, request: ComputeRequest) -> Result<(), WorkerError> {
        if self.abort.is_cancelled() {
            return Err(WorkerError::Aborted);
        }
        self.requests.push(request);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn reply(&mut self) -> Result<Output, WorkerError> {
        self.calls.lock().await.push(WorkerCall {
            task_id: self.task_id,
            requests: std::mem::take(&mut self.requests),
        });

        match &self.behavior {
            WorkerBehavior::Succeed => Ok(Output::success()),
            WorkerBehavior::Work(duration) => {
                let budget = self
                    .deadline
                    .map(|d| (d - Utc::now()).to_std().unwrap_or(Duration::ZERO));
                let (wait, timed_out) = match budget {
                    Some(budget) if budget < *duration => (budget, true),
                    _ => (*duration, false),
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        if timed_out {
                            Ok(Output::timeout("max duration exceeded"))
                        } else {
                            Ok(Output::success())
                        }
                    }
                    _ = self.abort.cancelled() => Err(WorkerError::Aborted),
                }
            }
            WorkerBehavior::Fail(message) => Ok(Output::error(message.clone())),
            WorkerBehavior::TimeOut => Ok(Output::timeout("max duration exceeded")),
            WorkerBehavior::Crash(message) => Err(WorkerError::Fault(message.clone())),
            WorkerBehavior::HangUntilAborted => {
                self.abort.cancelled().await;
                Err(WorkerError::Aborted)
            }
            WorkerBehavior::Unreachable => Err(WorkerError::Unavailable("connection lost".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DataId, OutputStatus};
    use std::path::PathBuf;

    #[tokio::test]
    async fn scripted_behaviors_are_played_in_order() {
        let worker = SimulatedWorker::new(WorkerBehavior::Succeed);
        worker
            .script([
                WorkerBehavior::Unreachable,
                WorkerBehavior::Fail("bad input".into()),
            ])
            .await;
        let task_id = TaskId::random();

        assert!(matches!(
            worker.connect(task_id, CancellationToken::new(), None).await,
            Err(WorkerError::Unavailable(_))
        ));

        let mut stream = worker
            .connect(task_id, CancellationToken::new(), None)
            .await
            .unwrap();
        let data_id = DataId::random();
        stream
            .send(ComputeRequest::Data {
                data_id,
                path: PathBuf::from("/tmp/x"),
            })
            .await
            .unwrap();
        stream.finish().await.unwrap();
        assert_eq!(stream.reply().await.unwrap(), Output::error("bad input"));

        let mut stream = worker
            .connect(task_id, CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(stream.reply().await.unwrap().status, OutputStatus::Success);

        let calls = worker.calls().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].requests.len(), 1);
    }

    #[tokio::test]
    async fn hanging_worker_stops_on_abort() {
        let worker = SimulatedWorker::new(WorkerBehavior::HangUntilAborted);
        let abort = CancellationToken::new();
        let mut stream = worker
            .connect(TaskId::random(), abort.clone(), None)
            .await
            .unwrap();

        let reply = tokio::spawn(async move { stream.reply().await });
        abort.cancel();

        assert_eq!(reply.await.unwrap(), Err(WorkerError::Aborted));
    }

    #[tokio::test]
    async fn work_past_the_deadline_times_out() {
        let worker = SimulatedWorker::new(WorkerBehavior::Work(Duration::from_secs(60)));
        let deadline = Utc::now() + chrono::Duration::milliseconds(20);
        let mut stream = worker
            .connect(TaskId::random(), CancellationToken::new(), Some(deadline))
            .await
            .unwrap();

        assert_eq!(
            stream.reply().await.unwrap().status,
            OutputStatus::Timeout
        );
    }

    #[tokio::test]
    async fn concurrency_is_tracked_per_open_stream() {
        let worker = SimulatedWorker::default();
        let a = worker
            .connect(TaskId::random(), CancellationToken::new(), None)
            .await
            .unwrap();
        let b = worker
            .connect(TaskId::random(), CancellationToken::new(), None)
            .await
            .unwrap();
        drop(a);
        drop(b);
        let _c = worker
            .connect(TaskId::random(), CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(worker.max_concurrency(), 2);
    }
}

//! TaskHandler - 配信メッセージ 1 件を獲得から決着まで処理する
//!
//! 流れ: acquisition -> prefetch -> ワーカー呼び出し -> 結果の記録。
//! メッセージの処分は途中で決まり、何が起きても決着（settle）は 1 回だけです。
//!
//! キャンセルは 2 段階です。ソフトトークンはシャットダウン時か、ストア上で
//! タスクがキャンセルされたときに発火します。猶予時間の後にハードアボートの
//! トークンが発火し、ワーカー呼び出しを打ち切ります。

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::app::acquisition::acquire;
use crate::app::context::AgentContext;
use crate::app::prefetch::{self, scratch_dir};
use crate::app::retry_chain;
use crate::domain::{
    AcquisitionOutcome, CasFailure, HealthCheckTag, Output, OutputStatus, PodId, PollsterError,
    QueueMessageStatus, StorageError, StoreError, TaskId, TaskRecord, TaskStatus, TaskUpdate,
    WorkerError,
};
use crate::ports::{ComputeRequest, Expected, QueueMessage, TaskStore, WorkerStream};

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerReport {
    pub task_id: TaskId,
    pub outcome: AcquisitionOutcome,
    pub status: Option<TaskStatus>,
    pub disposition: QueueMessageStatus,
    /// Set when the attempt failed in a way that counts against the error
    /// budget.
    pub fault: Option<String>,
}

/// Cancellation handle of an executing task.
pub struct TaskCancellation {
    task_id: TaskId,
    pod_id: PodId,
    tasks: Arc<dyn TaskStore>,
    requested: AtomicBool,
    cancel: CancellationToken,
}

impl TaskCancellation {
    fn new(
        task_id: TaskId,
        pod_id: PodId,
        tasks: Arc<dyn TaskStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            pod_id,
            tasks,
            requested: AtomicBool::new(false),
            cancel,
        }
    }

    /// Marks the task `Cancelling` and fires its cancellation.
    ///
    /// Only the first call does anything and returns `true`.
    pub async fn stop_cancelled_task(&self) -> Result<bool, PollsterError> {
        if self.requested.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let expected = Expected::any_of(&[TaskStatus::Dispatched, TaskStatus::Processing])
            .owned_by(&self.pod_id);
        let result = self
            .tasks
            .conditional_update(
                self.task_id,
                &expected,
                TaskUpdate::status(TaskStatus::Cancelling),
            )
            .await;
        self.cancel.cancel();

        match result {
            Ok(_) => tracing::info!(task_id = %self.task_id, "task marked cancelling"),
            Err(StoreError::Conflict(lost)) if lost.status.is_cancellation() => {
                tracing::info!(task_id = %self.task_id, status = %lost.status, "task already cancelling");
            }
            Err(StoreError::Conflict(lost)) => {
                tracing::warn!(
                    task_id = %self.task_id,
                    status = %lost.status,
                    "task no longer held by this agent, stopping local execution only"
                );
            }
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Tasks currently executing on this agent.
#[derive(Default)]
pub struct RunningTasks {
    tasks: Mutex<HashMap<TaskId, Arc<TaskCancellation>>>,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ids(&self) -> Vec<TaskId> {
        self.tasks.lock().await.keys().copied().collect()
    }

    pub async fn get(&self, task_id: TaskId) -> Option<Arc<TaskCancellation>> {
        self.tasks.lock().await.get(&task_id).cloned()
    }

    /// Registers `cancellation` unless its task already runs here.
    async fn try_insert(&self, cancellation: &Arc<TaskCancellation>) -> bool {
        match self.tasks.lock().await.entry(cancellation.task_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(cancellation.clone());
                true
            }
        }
    }

    /// Drops the registration, only if it is still `cancellation`.
    async fn remove(&self, cancellation: &Arc<TaskCancellation>) {
        let mut tasks = self.tasks.lock().await;
        let owned = tasks
            .get(&cancellation.task_id)
            .is_some_and(|registered| Arc::ptr_eq(registered, cancellation));
        if owned {
            tasks.remove(&cancellation.task_id);
        }
    }
}

/// End state of an executed attempt.
struct Resolution {
    status: TaskStatus,
    disposition: QueueMessageStatus,
    fault: Option<String>,
}

impl Resolution {
    fn new(status: TaskStatus, disposition: QueueMessageStatus) -> Self {
        Self {
            status,
            disposition,
            fault: None,
        }
    }

    fn with_fault(mut self, fault: impl ToString) -> Self {
        self.fault = Some(fault.to_string());
        self
    }
}

/// Handles one message and settles it.
pub async fn handle_message(
    ctx: Arc<AgentContext>,
    running: Arc<RunningTasks>,
    message: Box<dyn QueueMessage>,
    shutdown: CancellationToken,
) -> Result<HandlerReport, PollsterError> {
    let task_id = message.task_id();
    let span = tracing::info_span!(
        "message",
        message_id = %message.message_id(),
        %task_id,
        pod_id = %ctx.config.pod_id(),
    );

    async move {
        let handler = TaskHandler {
            ctx,
            running,
            shutdown,
            task_id,
        };
        let result = handler.process(message.as_ref()).await;
        let disposition = message.status();
        let settled = message.settle().await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, ?disposition, "message handling failed");
                if let Err(settle_error) = settled {
                    tracing::error!(error = %settle_error, "failed to settle message");
                }
                return Err(e);
            }
        };
        settled?;
        tracing::debug!(?disposition, status = ?report.status, "message settled");
        Ok(report)
    }
    .instrument(span)
    .await
}

struct TaskHandler {
    ctx: Arc<AgentContext>,
    running: Arc<RunningTasks>,
    shutdown: CancellationToken,
    task_id: TaskId,
}

impl TaskHandler {
    async fn process(&self, message: &dyn QueueMessage) -> Result<HandlerReport, PollsterError> {
        let acquisition = acquire(&self.ctx, self.task_id, &self.shutdown).await?;
        tracing::info!(
            outcome = %acquisition.outcome,
            status = ?acquisition.status,
            disposition = ?acquisition.disposition,
            "acquisition finished"
        );

        let mut report = HandlerReport {
            task_id: self.task_id,
            outcome: acquisition.outcome,
            status: acquisition.status,
            disposition: acquisition.disposition,
            fault: None,
        };

        let task = match acquisition.task {
            Some(task) if acquisition.outcome.is_acquired() => task,
            _ => {
                message.set_status(acquisition.disposition)?;
                return Ok(report);
            }
        };

        let cancellation = Arc::new(TaskCancellation::new(
            self.task_id,
            self.ctx.config.pod_id().clone(),
            self.ctx.tasks.clone(),
            self.shutdown.child_token(),
        ));
        if !self.running.try_insert(&cancellation).await {
            // Redelivered while an earlier message of the same task is
            // still executing on this agent.
            tracing::info!("task already executing on this agent, postponing duplicate");
            message.set_status(QueueMessageStatus::Postponed)?;
            report.outcome = AcquisitionOutcome::TaskIsProcessingHere;
            report.disposition = QueueMessageStatus::Postponed;
            return Ok(report);
        }

        let result = self.execute(task, &cancellation).await;

        self.running.remove(&cancellation).await;
        prefetch::cleanup(&scratch_dir(self.ctx.config.scratch_root(), self.task_id)).await;

        let resolution = result?;
        message.set_status(resolution.disposition)?;
        tracing::info!(
            status = %resolution.status,
            disposition = ?resolution.disposition,
            fault = resolution.fault.as_deref(),
            "task handled"
        );

        report.status = Some(resolution.status);
        report.disposition = resolution.disposition;
        report.fault = resolution.fault;
        Ok(report)
    }

    async fn execute(
        &self,
        task: TaskRecord,
        cancellation: &Arc<TaskCancellation>,
    ) -> Result<Resolution, PollsterError> {
        let pod_id = self.ctx.config.pod_id();
        let dispatched = Expected::status(TaskStatus::Dispatched).owned_by(pod_id);

        if self.shutdown.is_cancelled() {
            return self.release("shutdown requested after acquisition").await;
        }

        let prefetched = match prefetch::prefetch(&self.ctx, &task).await {
            Ok(prefetched) => prefetched,
            Err(StorageError::NotFound(data_id)) => {
                let reason = format!("data {data_id} not found");
                tracing::error!(%data_id, "task data missing, task cannot run");
                let update =
                    TaskUpdate::finish(TaskStatus::Error, Output::error(reason), self.ctx.clock.now());
                return match self.transition(&dispatched, update).await? {
                    Ok(_) => {
                        self.ctx.abort_results(self.task_id).await;
                        Ok(Resolution::new(TaskStatus::Error, QueueMessageStatus::Processed))
                    }
                    Err(lost) => self.on_lost_race(lost).await,
                };
            }
            Err(e) => {
                tracing::error!(error = %e, "prefetch failed");
                return self
                    .retry(&task, &dispatched, &e.to_string(), QueueMessageStatus::Cancelled)
                    .await
                    .map(|r| r.with_fault(e));
            }
        };

        self.run_worker(task, prefetched.requests, cancellation).await
    }

    async fn run_worker(
        &self,
        task: TaskRecord,
        requests: Vec<ComputeRequest>,
        cancellation: &Arc<TaskCancellation>,
    ) -> Result<Resolution, PollsterError> {
        if self.shutdown.is_cancelled() && !cancellation.is_requested() {
            return self.release("shutdown requested before the worker call").await;
        }

        let pod_id = self.ctx.config.pod_id();
        let abort = CancellationToken::new();
        let done = CancellationToken::new();
        let _done = done.clone().drop_guard();

        tokio::spawn(
            escalate(
                cancellation.cancel.clone(),
                abort.clone(),
                done.clone(),
                self.ctx.config.grace_delay(),
            )
            .in_current_span(),
        );
        tokio::spawn(
            watch_store(
                self.ctx.clone(),
                cancellation.clone(),
                done.clone(),
                self.ctx.config.cancellation_poll_interval(),
            )
            .in_current_span(),
        );

        let now = self.ctx.clock.now();
        let deadline = task
            .options
            .max_duration()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);

        let mut stream = match self.ctx.worker.connect(task.task_id, abort.clone(), deadline).await {
            Ok(stream) => stream,
            Err(WorkerError::Unavailable(reason)) if !cancellation.is_requested() => {
                tracing::warn!(reason = %reason, "worker unreachable");
                return self.release("worker unreachable").await;
            }
            Err(e) => return self.on_worker_failure(&task, e, cancellation).await,
        };

        let started = Expected::status(TaskStatus::Dispatched).owned_by(pod_id);
        let update = TaskUpdate::status(TaskStatus::Processing).with_start_date(self.ctx.clock.now());
        let task = match self.transition(&started, update).await? {
            // The stored options do not carry the session defaults.
            Ok(record) => TaskRecord {
                options: task.options,
                ..record
            },
            Err(lost) => return self.on_lost_race(lost).await,
        };
        tracing::info!("task processing");

        let reply = exchange(stream.as_mut(), requests, &abort).await;
        drop(stream);

        match reply {
            Ok(output) => self.record_output(&task, output, cancellation).await,
            Err(e) => self.on_worker_failure(&task, e, cancellation).await,
        }
    }

    async fn record_output(
        &self,
        task: &TaskRecord,
        output: Output,
        cancellation: &TaskCancellation,
    ) -> Result<Resolution, PollsterError> {
        let processing = Expected::status(TaskStatus::Processing).owned_by(self.ctx.config.pod_id());
        let now = self.ctx.clock.now();

        match output.status {
            OutputStatus::Success => {
                let update = TaskUpdate::finish(TaskStatus::Completed, output, now);
                if let Err(lost) = self.transition(&processing, update).await? {
                    return self.on_lost_race(lost).await;
                }
                let resolution = Resolution::new(TaskStatus::Completed, QueueMessageStatus::Processed);
                match self.ctx.finalizer.finalize(task.task_id).await {
                    Ok(()) => Ok(resolution),
                    Err(e) => {
                        tracing::error!(error = %e, "result finalization failed");
                        Ok(resolution.with_fault(e))
                    }
                }
            }
            OutputStatus::Timeout => {
                tracing::warn!(error = output.error.as_deref(), "task timed out");
                let update = TaskUpdate::finish(TaskStatus::Timeout, output, now);
                match self.transition(&processing, update).await? {
                    Ok(_) => {
                        self.ctx.abort_results(self.task_id).await;
                        Ok(Resolution::new(TaskStatus::Timeout, QueueMessageStatus::Processed))
                    }
                    Err(lost) => self.on_lost_race(lost).await,
                }
            }
            OutputStatus::Error => {
                if cancellation.is_requested() {
                    return self.finish_cancellation().await;
                }
                let reason = output.error.unwrap_or_else(|| "worker reported an error".into());
                tracing::warn!(reason = %reason, "task failed");
                self.retry(task, &processing, &reason, QueueMessageStatus::Processed)
                    .await
            }
        }
    }

    /// Classifies a failed worker call.
    async fn on_worker_failure(
        &self,
        task: &TaskRecord,
        error: WorkerError,
        cancellation: &TaskCancellation,
    ) -> Result<Resolution, PollsterError> {
        if cancellation.is_requested() {
            tracing::info!(error = %error, "worker stopped after task cancellation");
            return self.finish_cancellation().await;
        }

        let held = Expected::any_of(&[TaskStatus::Dispatched, TaskStatus::Processing])
            .owned_by(self.ctx.config.pod_id());

        if self.shutdown.is_cancelled() {
            let liveness = self.ctx.check(HealthCheckTag::Liveness).await;
            if liveness.is_healthy() {
                tracing::warn!(error = %error, "worker stopped during shutdown, releasing task");
                let update = TaskUpdate::release(self.ctx.clock.now());
                return match self.transition(&held, update).await? {
                    Ok(_) => Ok(Resolution::new(TaskStatus::Submitted, QueueMessageStatus::Postponed)),
                    Err(lost) => self.on_lost_race(lost).await,
                };
            }
            tracing::error!(
                error = %error,
                liveness = ?liveness.description,
                "worker failed during shutdown on an unhealthy agent"
            );
        } else {
            tracing::error!(error = %error, "worker failed");
        }

        self.retry(task, &held, &error.to_string(), QueueMessageStatus::Cancelled)
            .await
            .map(|r| r.with_fault(error))
    }

    async fn retry(
        &self,
        task: &TaskRecord,
        expected: &Expected,
        reason: &str,
        disposition: QueueMessageStatus,
    ) -> Result<Resolution, PollsterError> {
        match retry_chain::retry_task(&self.ctx, task, expected, reason).await {
            Ok(updated) => Ok(Resolution::new(updated.status, disposition)),
            Err(PollsterError::Store(StoreError::Conflict(lost))) => self.on_lost_race(lost).await,
            Err(e) => Err(e),
        }
    }

    async fn finish_cancellation(&self) -> Result<Resolution, PollsterError> {
        let expected = Expected::any_of(&[
            TaskStatus::Dispatched,
            TaskStatus::Processing,
            TaskStatus::Cancelling,
        ]);
        let update = TaskUpdate::status(TaskStatus::Cancelled).with_end_date(self.ctx.clock.now());
        match self.transition(&expected, update).await? {
            Ok(_) => {}
            Err(lost) if lost.status == TaskStatus::Cancelled => {}
            Err(lost) => {
                tracing::warn!(status = %lost.status, "cancelled task finished in another state");
                return Ok(Resolution::new(lost.status, QueueMessageStatus::Cancelled));
            }
        }
        self.ctx.abort_results(self.task_id).await;
        Ok(Resolution::new(TaskStatus::Cancelled, QueueMessageStatus::Cancelled))
    }

    /// Hands a task this agent holds back to the queue: `Submitted`, no owner.
    async fn release(&self, reason: &str) -> Result<Resolution, PollsterError> {
        tracing::info!(reason, "releasing task");
        let held = Expected::status(TaskStatus::Dispatched).owned_by(self.ctx.config.pod_id());
        match self.transition(&held, TaskUpdate::release(self.ctx.clock.now())).await? {
            Ok(_) => Ok(Resolution::new(TaskStatus::Submitted, QueueMessageStatus::Postponed)),
            Err(lost) => self.on_lost_race(lost).await,
        }
    }

    /// Someone else changed the record while we were executing.
    async fn on_lost_race(&self, lost: CasFailure) -> Result<Resolution, PollsterError> {
        match lost.status {
            TaskStatus::Cancelling | TaskStatus::Cancelled => self.finish_cancellation().await,
            status => {
                tracing::warn!(
                    %status,
                    owner_pod_id = ?lost.owner,
                    "task record changed under us, abandoning attempt"
                );
                Ok(Resolution::new(status, QueueMessageStatus::Postponed))
            }
        }
    }

    /// Conditional update with the lost race split out.
    async fn transition(
        &self,
        expected: &Expected,
        update: TaskUpdate,
    ) -> Result<Result<TaskRecord, CasFailure>, PollsterError> {
        match self.ctx.update_task(self.task_id, expected, update).await {
            Ok(task) => Ok(Ok(task)),
            Err(StoreError::Conflict(lost)) => Ok(Err(lost)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sends everything, half-closes and waits for the reply; gives up when the
/// hard abort fires.
async fn exchange(
    stream: &mut dyn WorkerStream,
    requests: Vec<ComputeRequest>,
    abort: &CancellationToken,
) -> Result<Output, WorkerError> {
    tokio::select! {
        reply = call(stream, requests) => reply,
        _ = abort.cancelled() => Err(WorkerError::Aborted),
    }
}

async fn call(
    stream: &mut dyn WorkerStream,
    requests: Vec<ComputeRequest>,
) -> Result<Output, WorkerError> {
    for request in requests {
        stream.send(request).await?;
    }
    stream.finish().await?;
    stream.reply().await
}

/// Fires `abort` once `grace` has elapsed after `cancel`, unless the call
/// ended in the meantime.
async fn escalate(
    cancel: CancellationToken,
    abort: CancellationToken,
    done: CancellationToken,
    grace: Duration,
) {
    tokio::select! {
        _ = done.cancelled() => return,
        _ = cancel.cancelled() => {}
    }
    tracing::info!(grace_ms = grace.as_millis() as u64, "cancellation requested");

    tokio::select! {
        _ = done.cancelled() => {}
        _ = tokio::time::sleep(grace) => {
            tracing::warn!("grace delay elapsed, aborting worker call");
            abort.cancel();
        }
    }
}

/// Polls the store and stops the task once it is marked for cancellation.
async fn watch_store(
    ctx: Arc<AgentContext>,
    cancellation: Arc<TaskCancellation>,
    done: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match ctx.tasks.read(cancellation.task_id).await {
            Ok(Some(task)) if task.status.is_cancellation() => {
                tracing::info!(status = %task.status, "task cancelled in store");
                if let Err(e) = cancellation.stop_cancelled_task().await {
                    tracing::warn!(error = %e, "failed to stop cancelled task");
                }
                return;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "cancellation poll failed"),
        }
    }
}

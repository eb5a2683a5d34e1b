//! Agent - ポーリングループ
//!
//! スロットが空いている間メッセージを取得し、それぞれを専用の tokio タスクで
//! タスクハンドラに渡し、エラーバジェットを管理します。
//! シャットダウン要求かバジェット切れでループは終わり、どちらの場合も
//! 実行中のハンドラを待ってから [`Agent::run`] が返ります。

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::app::context::AgentContext;
use crate::app::handler::{handle_message, HandlerReport, RunningTasks};
use crate::domain::{HealthCheckTag, HealthReport, PollsterError, TaskId};
use crate::ports::QueueMessage;

/// Summary of one [`Agent::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentExit {
    /// Messages that went through a handler.
    pub handled: u64,
    /// Of those, messages whose task this agent acquired.
    pub acquired: u64,
    /// The loop stopped because of the error budget.
    pub budget_exhausted: bool,
}

pub struct Agent {
    ctx: Arc<AgentContext>,
    running: Arc<RunningTasks>,
    slots: Arc<Semaphore>,
}

impl Agent {
    pub fn new(ctx: AgentContext) -> Self {
        let slots = Arc::new(Semaphore::new(ctx.config.slots()));
        Self {
            ctx: Arc::new(ctx),
            running: Arc::new(RunningTasks::new()),
            slots,
        }
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    pub async fn init(&self) -> Result<(), PollsterError> {
        self.ctx.init().await
    }

    pub async fn check(&self, tag: HealthCheckTag) -> HealthReport {
        self.ctx.check(tag).await
    }

    /// Ids of the tasks this agent is executing right now.
    pub async fn running_tasks(&self) -> Vec<TaskId> {
        self.running.ids().await
    }

    /// Stops a task executing on this agent.
    ///
    /// Returns `false` when the task is not running here or was already
    /// being stopped.
    pub async fn stop_cancelled_task(&self, task_id: TaskId) -> Result<bool, PollsterError> {
        match self.running.get(task_id).await {
            Some(cancellation) => cancellation.stop_cancelled_task().await,
            None => Ok(false),
        }
    }

    /// Runs the loop until `shutdown` fires or the error budget is exhausted.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<AgentExit, PollsterError> {
        if !self.ctx.health.is_initialized() {
            self.init().await?;
        }

        let stop = shutdown.child_token();
        let mut handlers: JoinSet<Result<HandlerReport, PollsterError>> = JoinSet::new();
        let mut exit = AgentExit::default();

        tracing::info!(
            pod_id = %self.ctx.config.pod_id(),
            slots = self.ctx.config.slots(),
            "agent loop started"
        );

        while !stop.is_cancelled() {
            while let Some(joined) = handlers.try_join_next() {
                self.reap(joined, &stop, &mut exit);
            }

            let pulled = tokio::select! {
                _ = stop.cancelled() => break,
                pulled = self.ctx.pull_queue.pull(self.ctx.config.pull_batch_size(), &stop) => pulled,
            };

            let messages = match pulled {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::error!(error = %e, "pull failed");
                    if self.ctx.health.record_error(&e) {
                        exit.budget_exhausted = true;
                        stop.cancel();
                        break;
                    }
                    self.idle(&stop).await;
                    continue;
                }
            };

            if messages.is_empty() {
                self.idle(&stop).await;
                continue;
            }
            tracing::debug!(count = messages.len(), "messages pulled");

            let mut messages = messages.into_iter();
            while let Some(message) = messages.next() {
                let permit = tokio::select! {
                    biased;
                    _ = stop.cancelled() => None,
                    permit = self.slots.clone().acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    // Not started: hand the rest back untouched.
                    hand_back(std::iter::once(message).chain(messages.by_ref())).await;
                    break;
                };

                let ctx = self.ctx.clone();
                let running = self.running.clone();
                let shutdown = shutdown.clone();
                let stop = stop.clone();
                handlers.spawn(async move {
                    let report = handle_message(ctx.clone(), running, message, shutdown).await;
                    // Before the slot frees up, so the next pull sees the budget.
                    if record(&ctx, &report) {
                        stop.cancel();
                    }
                    drop(permit);
                    report
                });
            }
        }

        tracing::info!(in_flight = handlers.len(), "agent loop stopping, waiting for handlers");
        while let Some(joined) = handlers.join_next().await {
            self.reap(joined, &stop, &mut exit);
        }
        exit.budget_exhausted |= self.ctx.health.is_failed();

        tracing::info!(
            handled = exit.handled,
            acquired = exit.acquired,
            budget_exhausted = exit.budget_exhausted,
            "agent loop stopped"
        );
        Ok(exit)
    }

    fn reap(
        &self,
        joined: Result<Result<HandlerReport, PollsterError>, tokio::task::JoinError>,
        stop: &CancellationToken,
        exit: &mut AgentExit,
    ) {
        exit.handled += 1;
        match joined {
            Ok(Ok(report)) if report.outcome.is_acquired() => exit.acquired += 1,
            Ok(_) => {}
            Err(e) => {
                let e = PollsterError::Join(e.to_string());
                tracing::error!(error = %e, "task handler panicked");
                if self.ctx.health.record_error(&e) {
                    stop.cancel();
                }
            }
        }
        exit.budget_exhausted |= self.ctx.health.is_failed();
    }

    async fn idle(&self, stop: &CancellationToken) {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(self.ctx.config.pull_idle_backoff()) => {}
        }
    }
}

/// Feeds one handler result into the error budget. Returns `true` when it
/// exhausted the budget.
fn record(ctx: &AgentContext, report: &Result<HandlerReport, PollsterError>) -> bool {
    match report {
        Ok(HandlerReport { fault: None, .. }) => {
            ctx.health.record_success();
            false
        }
        Ok(HandlerReport {
            fault: Some(fault), ..
        }) => ctx.health.record_error(fault),
        Err(e) => ctx.health.record_error(e),
    }
}

/// Settles messages that were pulled but never handled; their disposition is
/// still `Waiting`, so the transport makes them visible again.
async fn hand_back(messages: impl Iterator<Item = Box<dyn QueueMessage>>) {
    for message in messages {
        let task_id = message.task_id();
        if let Err(e) = message.settle().await {
            tracing::warn!(%task_id, error = %e, "failed to hand back message");
        }
    }
}

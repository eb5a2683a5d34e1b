//! Acquisition - 配信メッセージをタスクの所有権かメッセージの処分に変える
//!
//! タスクとセッションを読み、純粋な判定を実行し、必要なら processing checker に
//! 問い合わせ、要求された遷移を条件付き更新として適用します。
//! 更新に負けたら別のエージェントが先に動いたということなので、
//! 読み直して判定し直します（回数には上限があります）。

use tokio_util::sync::CancellationToken;

use crate::app::context::AgentContext;
use crate::app::retry_chain;
use crate::domain::{
    decide, AcquisitionInput, AcquisitionOutcome, CasFailure, Decision, PollsterError,
    QueueMessageStatus, RetryState, SessionRecord, StoreError, TaskId, TaskRecord, TaskStatus,
    TaskUpdate, Transition, Verdict,
};
use crate::ports::Expected;

/// Result of the protocol for one message.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub outcome: AcquisitionOutcome,
    pub status: Option<TaskStatus>,
    pub disposition: QueueMessageStatus,
    /// The record as left by the protocol; `None` when the task does not exist.
    pub task: Option<TaskRecord>,
}

impl Acquisition {
    pub fn is_acquired(&self) -> bool {
        self.outcome.is_acquired()
    }
}

pub async fn acquire(
    ctx: &AgentContext,
    task_id: TaskId,
    shutdown: &CancellationToken,
) -> Result<Acquisition, PollsterError> {
    let max_rounds = ctx.config.max_acquisition_rounds();
    let mut round = 0;

    loop {
        round += 1;

        let task = ctx.read_task(task_id).await?;
        let session = match &task {
            Some(task) => ctx.read_session(task.session_id).await?,
            None => None,
        };
        let task = task.map(|task| with_session_defaults(task, session.as_ref()));

        let mut input = AcquisitionInput {
            task: task.as_ref(),
            session: session.as_ref(),
            pod_id: ctx.config.pod_id(),
            now: ctx.clock.now(),
            dispatch_timeout: ctx.config.dispatch_timeout(),
            shutdown_requested: shutdown.is_cancelled(),
            owner_alive: None,
        };

        let decision = match decide(&input) {
            Verdict::Decided(decision) => decision,
            Verdict::NeedsLiveness { owner } => {
                let Some(record) = task.as_ref() else {
                    return Err(PollsterError::Inconsistent {
                        task_id,
                        reason: "liveness requested for a missing task".into(),
                    });
                };
                let checker = &ctx.checker;
                let owner_ref = &owner;
                let (session_id, task_id) = (record.session_id, record.task_id);
                let alive = ctx
                    .config
                    .infra_retry()
                    .retry("processing check", move || {
                        checker.is_alive(session_id, task_id, owner_ref)
                    })
                    .await?;
                tracing::debug!(%task_id, owner_pod_id = %owner, alive, "owner liveness checked");

                input.owner_alive = Some(alive);
                match decide(&input) {
                    Verdict::Decided(decision) => decision,
                    Verdict::NeedsLiveness { .. } => {
                        return Err(PollsterError::Inconsistent {
                            task_id,
                            reason: "decision still needs liveness".into(),
                        });
                    }
                }
            }
        };

        let Some(task) = task else {
            return Ok(unchanged(decision, None));
        };

        match apply(ctx, &task, decision).await {
            Ok(acquisition) => return Ok(acquisition),
            Err(PollsterError::Store(StoreError::Conflict(lost))) if round < max_rounds => {
                tracing::debug!(
                    %task_id,
                    round,
                    status = %lost.status,
                    "lost the race on the task record, deciding again"
                );
            }
            Err(PollsterError::Store(StoreError::Conflict(lost))) => {
                return Ok(gave_up(task, lost));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Unset task options fall back to the session defaults.
fn with_session_defaults(task: TaskRecord, session: Option<&SessionRecord>) -> TaskRecord {
    match session {
        Some(session) => TaskRecord {
            options: task.options.merged_with(&session.default_options),
            ..task
        },
        None => task,
    }
}

fn unchanged(decision: Decision, task: Option<TaskRecord>) -> Acquisition {
    Acquisition {
        outcome: decision.outcome,
        status: decision.status,
        disposition: decision.disposition,
        task,
    }
}

/// Still losing after the last round: someone else is driving the task.
fn gave_up(task: TaskRecord, lost: CasFailure) -> Acquisition {
    tracing::info!(
        task_id = %task.task_id,
        status = %lost.status,
        "task keeps moving under us, postponing"
    );
    Acquisition {
        outcome: AcquisitionOutcome::AcquisitionFailedMessageDuplicated,
        status: Some(lost.status),
        disposition: QueueMessageStatus::Postponed,
        task: None,
    }
}

async fn apply(
    ctx: &AgentContext,
    task: &TaskRecord,
    decision: Decision,
) -> Result<Acquisition, PollsterError> {
    let now = ctx.clock.now();
    let pod_id = ctx.config.pod_id();

    let updated = match &decision.transition {
        Transition::None => {
            if let AcquisitionOutcome::TaskIsRetried(_) = decision.outcome {
                let state = repair_lineage(ctx, task).await?;
                return Ok(Acquisition {
                    outcome: AcquisitionOutcome::TaskIsRetried(state),
                    ..unchanged(decision, Some(task.clone()))
                });
            }
            if decision.outcome == AcquisitionOutcome::PodIdEmptyAfterAcquisition {
                tracing::warn!(
                    task_id = %task.task_id,
                    "task dispatched without owner, leaving it alone"
                );
            }
            return Ok(unchanged(decision, Some(task.clone())));
        }
        Transition::Claim => {
            ctx.update_task(
                task.task_id,
                &Expected::status(TaskStatus::Submitted).unowned(),
                TaskUpdate::dispatch(pod_id, ctx.config.pod_name(), now),
            )
            .await?
        }
        Transition::ResetToSubmitted { owner } => {
            tracing::warn!(
                task_id = %task.task_id,
                owner_pod_id = %owner,
                "dispatched owner is gone, resubmitting"
            );
            ctx.update_task(
                task.task_id,
                &Expected::status(TaskStatus::Dispatched).owned_by(owner),
                TaskUpdate::release(now),
            )
            .await?
        }
        Transition::RetryAbandoned { owner } => {
            let expected = match owner {
                Some(owner) => Expected::status(TaskStatus::Processing).owned_by(owner),
                None => Expected::status(TaskStatus::Processing).unowned(),
            };
            let reason = match owner {
                Some(owner) => format!("owner {owner} stopped while processing"),
                None => "processing without owner".to_owned(),
            };
            tracing::warn!(task_id = %task.task_id, reason = %reason, "recovering abandoned task");
            retry_chain::retry_task(ctx, task, &expected, &reason).await?
        }
        Transition::FinishCancellation => {
            let cancelled = ctx
                .update_task(
                    task.task_id,
                    &Expected::status(TaskStatus::Cancelling),
                    TaskUpdate::status(TaskStatus::Cancelled).with_end_date(now),
                )
                .await?;
            ctx.abort_results(task.task_id).await;
            cancelled
        }
    };
    let updated = TaskRecord {
        options: task.options.clone(),
        ..updated
    };

    Ok(Acquisition {
        status: Some(updated.status),
        ..unchanged(decision, Some(updated))
    })
}

/// Reads the successor of a `Retried` task and finishes its creation if an
/// agent stopped halfway.
async fn repair_lineage(
    ctx: &AgentContext,
    task: &TaskRecord,
) -> Result<Option<RetryState>, PollsterError> {
    let tasks = &ctx.tasks;
    let task_id = task.task_id;
    let successor = ctx
        .config
        .infra_retry()
        .retry("find successor", move || tasks.find_successor(task_id))
        .await?;

    let state = match successor {
        None => {
            tracing::warn!(%task_id, "retried task has no successor, creating it");
            retry_chain::ensure_successor(ctx, task).await?;
            Some(RetryState::RetryIsNotFound)
        }
        Some(successor) => match successor.status {
            TaskStatus::Creating => {
                tracing::warn!(
                    %task_id,
                    successor_id = %successor.task_id,
                    "successor stuck in creation, submitting it"
                );
                retry_chain::submit_successor(ctx, successor).await?;
                Some(RetryState::RetryIsCreating)
            }
            TaskStatus::Pending => Some(RetryState::RetryIsPending),
            TaskStatus::Submitted => Some(RetryState::RetryIsSubmitted),
            _ => None,
        },
    };
    Ok(state)
}

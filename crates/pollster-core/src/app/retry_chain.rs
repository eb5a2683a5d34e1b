//! Retry chain - records a failed attempt and continues its lineage.

use crate::app::context::AgentContext;
use crate::domain::retry_chain::{successor, RetryPlan};
use crate::domain::{Output, PollsterError, StoreError, TaskRecord, TaskStatus, TaskUpdate};
use crate::ports::Expected;

/// Moves `task` to `Retried` (or `Error` once the lineage is out of retries)
/// and submits its successor. Returns the updated record.
///
/// The store write is conditional on `expected`; a lost race comes back as
/// `StoreError::Conflict`. The options of `task` are the effective ones and
/// pass on to the successor.
pub(crate) async fn retry_task(
    ctx: &AgentContext,
    task: &TaskRecord,
    expected: &Expected,
    reason: &str,
) -> Result<TaskRecord, PollsterError> {
    let plan = RetryPlan::for_task(task);
    let update = TaskUpdate::finish(plan.failed_status(), Output::error(reason), ctx.clock.now());
    let updated = TaskRecord {
        options: task.options.clone(),
        ..ctx.update_task(task.task_id, expected, update).await?
    };

    match plan {
        RetryPlan::Exhausted => {
            tracing::warn!(
                task_id = %task.task_id,
                retries = task.retry_of_ids.len(),
                reason,
                "retry budget exhausted, task ends in error"
            );
            ctx.abort_results(task.task_id).await;
        }
        RetryPlan::Retry => {
            let next = ensure_successor(ctx, &updated).await?;
            tracing::info!(
                task_id = %task.task_id,
                successor_id = %next.task_id,
                attempt = next.retry_of_ids.len() + 1,
                reason,
                "task retried"
            );
        }
    }
    Ok(updated)
}

/// Creates the successor of `parent` unless it exists, then submits it.
pub(crate) async fn ensure_successor(
    ctx: &AgentContext,
    parent: &TaskRecord,
) -> Result<TaskRecord, PollsterError> {
    let candidate = successor(parent, ctx.ids.generate_task_id(), ctx.clock.now());
    let tasks = &ctx.tasks;
    let candidate = &candidate;
    let created = ctx
        .config
        .infra_retry()
        .retry("create successor", move || {
            tasks.create_successor(parent, candidate.clone())
        })
        .await?;
    submit_successor(ctx, created).await
}

/// Promotes a `Creating` successor to `Submitted` and pushes it.
/// Successors in any other status are returned untouched.
pub(crate) async fn submit_successor(
    ctx: &AgentContext,
    successor: TaskRecord,
) -> Result<TaskRecord, PollsterError> {
    if successor.status != TaskStatus::Creating {
        return Ok(successor);
    }

    let update = TaskUpdate::status(TaskStatus::Submitted).with_submitted_date(ctx.clock.now());
    let submitted = match ctx
        .update_task(successor.task_id, &Expected::status(TaskStatus::Creating), update)
        .await
    {
        Ok(task) => task,
        Err(StoreError::Conflict(lost)) => {
            tracing::debug!(
                task_id = %successor.task_id,
                status = %lost.status,
                "successor already promoted"
            );
            return Ok(successor);
        }
        Err(e) => return Err(e.into()),
    };

    let push_queue = &ctx.push_queue;
    let ids = [submitted.task_id];
    let ids = &ids;
    ctx.config
        .infra_retry()
        .retry("push successor", move || push_queue.push(ids))
        .await?;
    Ok(submitted)
}

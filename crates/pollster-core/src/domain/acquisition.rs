//! Acquisition decision - what to do with a delivered message, given the
//! current task record.
//!
//! `decide` is pure: it never touches the store. When the answer depends on
//! whether another pod is still alive it returns [`Verdict::NeedsLiveness`]
//! and the caller re-runs it with `owner_alive` filled in. The state change it
//! asks for ([`Transition`]) is applied by the caller as a conditional update.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use super::ids::PodId;
use super::session::SessionRecord;
use super::status::{QueueMessageStatus, SessionStatus, TaskStatus};
use super::task::TaskRecord;

/// State of the successor of a `Retried` task, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    RetryIsCreating,
    RetryIsSubmitted,
    RetryIsPending,
    RetryIsNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionOutcome {
    Acquired,
    TaskNotFound,
    CancelledAfterFirstRead,
    SessionNotExecutable,
    SessionPaused,
    TaskIsCreating,
    TaskIsPending,
    TaskIsPaused,
    TaskIsProcessed,
    TaskIsError,
    TaskIsTimeout,
    TaskIsCancelled,
    TaskIsCancelling,
    TaskIsRetried(Option<RetryState>),
    AcquisitionFailedProcessingHere,
    AcquisitionFailedMessageDuplicated,
    AcquisitionFailedTimeoutNotExceeded,
    AcquisitionFailedDispatchedCrashed,
    PodIdEmptyAfterAcquisition,
    TaskIsProcessingHere,
    TaskIsProcessingPodIdEmpty,
    TaskIsProcessingElsewhere,
    TaskIsProcessingButSeemsCrashed,
}

impl AcquisitionOutcome {
    pub fn is_acquired(self) -> bool {
        self == AcquisitionOutcome::Acquired
    }
}

impl fmt::Display for AcquisitionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionOutcome::TaskIsRetried(Some(state)) => write!(f, "TaskIsRetried{state:?}"),
            AcquisitionOutcome::TaskIsRetried(None) => f.write_str("TaskIsRetried"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Store mutation requested by a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    None,
    /// Submitted(empty) -> Dispatched(self).
    Claim,
    /// Dispatched(dead owner) -> Submitted(empty).
    ResetToSubmitted { owner: PodId },
    /// Processing(empty or dead owner) -> Retried, plus a successor.
    RetryAbandoned { owner: Option<PodId> },
    /// Cancelling -> Cancelled.
    FinishCancellation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub outcome: AcquisitionOutcome,
    /// Task status once the transition is applied; `None` if there is no task.
    pub status: Option<TaskStatus>,
    pub disposition: QueueMessageStatus,
    pub transition: Transition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Ask the processing checker whether `owner` still runs the task.
    NeedsLiveness { owner: PodId },
    Decided(Decision),
}

/// Everything `decide` looks at.
#[derive(Debug, Clone, Copy)]
pub struct AcquisitionInput<'a> {
    pub task: Option<&'a TaskRecord>,
    pub session: Option<&'a SessionRecord>,
    pub pod_id: &'a PodId,
    pub now: DateTime<Utc>,
    pub dispatch_timeout: Duration,
    pub shutdown_requested: bool,
    /// Checker answer for the current owner, once asked.
    pub owner_alive: Option<bool>,
}

enum Owner<'a> {
    Empty,
    Mine,
    Other(&'a PodId),
}

fn owner_of<'a>(task: &'a TaskRecord, pod_id: &PodId) -> Owner<'a> {
    match &task.owner_pod_id {
        None => Owner::Empty,
        Some(owner) if owner == pod_id => Owner::Mine,
        Some(owner) => Owner::Other(owner),
    }
}

/// `elapsed == timeout` counts as elapsed. A missing acquisition date too.
fn dispatch_timeout_elapsed(task: &TaskRecord, now: DateTime<Utc>, timeout: Duration) -> bool {
    match task.acquisition_date {
        None => true,
        Some(acquired) => (now - acquired).to_std().unwrap_or(Duration::ZERO) >= timeout,
    }
}

fn decided(
    outcome: AcquisitionOutcome,
    status: Option<TaskStatus>,
    disposition: QueueMessageStatus,
    transition: Transition,
) -> Verdict {
    Verdict::Decided(Decision {
        outcome,
        status,
        disposition,
        transition,
    })
}

pub fn decide(input: &AcquisitionInput<'_>) -> Verdict {
    use AcquisitionOutcome as O;
    use QueueMessageStatus as Q;
    use TaskStatus as S;

    let Some(task) = input.task else {
        return decided(O::TaskNotFound, None, Q::Postponed, Transition::None);
    };
    let current = Some(task.status);

    if input.shutdown_requested {
        return decided(O::CancelledAfterFirstRead, current, Q::Waiting, Transition::None);
    }

    match input.session.map(|s| s.status) {
        None => {
            return decided(O::SessionNotExecutable, current, Q::Postponed, Transition::None);
        }
        Some(status) if status.is_terminated() => {
            return decided(O::SessionNotExecutable, current, Q::Postponed, Transition::None);
        }
        Some(SessionStatus::Paused) => {
            return decided(O::SessionPaused, current, Q::Postponed, Transition::None);
        }
        Some(_) => {}
    }

    let stays = |outcome, disposition| decided(outcome, current, disposition, Transition::None);

    match (task.status, owner_of(task, input.pod_id)) {
        (S::Creating, _) => stays(O::TaskIsCreating, Q::Postponed),
        (S::Pending, _) => stays(O::TaskIsPending, Q::Postponed),
        (S::Paused, _) => stays(O::TaskIsPaused, Q::Processed),
        (S::Completed, _) => stays(O::TaskIsProcessed, Q::Processed),
        (S::Error, _) => stays(O::TaskIsError, Q::Cancelled),
        (S::Timeout, _) => stays(O::TaskIsTimeout, Q::Processed),
        (S::Cancelled, _) => stays(O::TaskIsCancelled, Q::Cancelled),
        (S::Retried, _) => stays(O::TaskIsRetried(None), Q::Poisonous),
        (S::Cancelling, _) => decided(
            O::TaskIsCancelling,
            Some(S::Cancelled),
            Q::Cancelled,
            Transition::FinishCancellation,
        ),

        (S::Submitted, Owner::Empty) => decided(
            O::Acquired,
            Some(S::Dispatched),
            Q::Waiting,
            Transition::Claim,
        ),
        (S::Submitted, Owner::Mine) => stays(O::AcquisitionFailedProcessingHere, Q::Postponed),
        (S::Submitted, Owner::Other(_)) => {
            stays(O::AcquisitionFailedMessageDuplicated, Q::Postponed)
        }

        (S::Dispatched, Owner::Mine) => stays(O::Acquired, Q::Waiting),
        (S::Dispatched, Owner::Empty) => stays(O::PodIdEmptyAfterAcquisition, Q::Postponed),
        (S::Dispatched, Owner::Other(owner)) => {
            if !dispatch_timeout_elapsed(task, input.now, input.dispatch_timeout) {
                return stays(O::AcquisitionFailedTimeoutNotExceeded, Q::Postponed);
            }
            match input.owner_alive {
                None => Verdict::NeedsLiveness {
                    owner: owner.clone(),
                },
                Some(true) => stays(O::AcquisitionFailedMessageDuplicated, Q::Postponed),
                Some(false) => decided(
                    O::AcquisitionFailedDispatchedCrashed,
                    Some(S::Submitted),
                    Q::Postponed,
                    Transition::ResetToSubmitted {
                        owner: owner.clone(),
                    },
                ),
            }
        }

        (S::Processing, Owner::Mine) => stays(O::TaskIsProcessingHere, Q::Postponed),
        (S::Processing, Owner::Empty) => decided(
            O::TaskIsProcessingPodIdEmpty,
            Some(S::Retried),
            Q::Cancelled,
            Transition::RetryAbandoned { owner: None },
        ),
        (S::Processing, Owner::Other(owner)) => match input.owner_alive {
            None => Verdict::NeedsLiveness {
                owner: owner.clone(),
            },
            Some(true) => stays(O::TaskIsProcessingElsewhere, Q::Postponed),
            Some(false) => decided(
                O::TaskIsProcessingButSeemsCrashed,
                Some(S::Retried),
                Q::Processed,
                Transition::RetryAbandoned {
                    owner: Some(owner.clone()),
                },
            ),
        },
    }
}

//! Task record - the authoritative per-task document kept in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::ids::{DataId, PodId, SessionId, TaskId};
use super::status::TaskStatus;

/// Execution options of a task.
///
/// `None` fields fall back to the session defaults (see [`TaskOptions::merged_with`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Upper bound on the worker call, in milliseconds.
    pub max_duration_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub priority: i32,
    pub partition_id: Option<String>,
    pub application_name: Option<String>,
    /// Free-form options forwarded to the worker.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl TaskOptions {
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }

    /// Retries allowed for the lineage; no retry when unset.
    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(0)
    }

    /// Union with `defaults`; values set on the task win.
    pub fn merged_with(&self, defaults: &TaskOptions) -> TaskOptions {
        let mut options = defaults.options.clone();
        options.extend(self.options.iter().map(|(k, v)| (k.clone(), v.clone())));

        TaskOptions {
            max_duration_ms: self.max_duration_ms.or(defaults.max_duration_ms),
            max_retries: self.max_retries.or(defaults.max_retries),
            priority: self.priority,
            partition_id: self
                .partition_id
                .clone()
                .or_else(|| defaults.partition_id.clone()),
            application_name: self
                .application_name
                .clone()
                .or_else(|| defaults.application_name.clone()),
            options,
        }
    }
}

/// Status reported by the worker for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStatus {
    Success,
    Error,
    Timeout,
}

/// Output of an execution, as stored on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub status: OutputStatus,
    pub error: Option<String>,
}

impl Output {
    pub fn success() -> Self {
        Self {
            status: OutputStatus::Success,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Error,
            error: Some(message.into()),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Timeout,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub session_id: SessionId,
    /// Root of the retry lineage; equals `task_id` for a first attempt.
    pub initial_task_id: TaskId,
    /// Ancestors in the lineage, oldest first.
    pub retry_of_ids: Vec<TaskId>,

    pub status: TaskStatus,
    pub owner_pod_id: Option<PodId>,
    pub owner_pod_name: Option<String>,
    pub acquisition_date: Option<DateTime<Utc>>,

    pub payload_id: DataId,
    pub data_dependencies: BTreeSet<DataId>,
    pub remaining_data_dependencies: BTreeSet<DataId>,
    pub expected_output_ids: Vec<DataId>,
    pub options: TaskOptions,

    pub creation_date: DateTime<Utc>,
    pub submitted_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub creation_to_end_duration: Option<Duration>,
    pub processing_to_end_duration: Option<Duration>,

    pub output: Option<Output>,
}

impl TaskRecord {
    /// First attempt of a lineage, in `Creating`.
    pub fn new(
        task_id: TaskId,
        session_id: SessionId,
        payload_id: DataId,
        options: TaskOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            session_id,
            initial_task_id: task_id,
            retry_of_ids: Vec::new(),
            status: TaskStatus::Creating,
            owner_pod_id: None,
            owner_pod_name: None,
            acquisition_date: None,
            payload_id,
            data_dependencies: BTreeSet::new(),
            remaining_data_dependencies: BTreeSet::new(),
            expected_output_ids: Vec::new(),
            options,
            creation_date: now,
            submitted_date: None,
            start_date: None,
            end_date: None,
            creation_to_end_duration: None,
            processing_to_end_duration: None,
            output: None,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_owner(mut self, pod_id: PodId, acquired_at: DateTime<Utc>) -> Self {
        self.owner_pod_name = Some(pod_id.as_str().to_owned());
        self.owner_pod_id = Some(pod_id);
        self.acquisition_date = Some(acquired_at);
        self
    }

    /// Data the task waits for; all still unresolved.
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = DataId>) -> Self {
        self.data_dependencies = deps.into_iter().collect();
        self.remaining_data_dependencies = self.data_dependencies.clone();
        self
    }

    pub fn with_expected_outputs(mut self, outputs: impl IntoIterator<Item = DataId>) -> Self {
        self.expected_output_ids = outputs.into_iter().collect();
        self
    }

    pub fn is_owned_by(&self, pod_id: &PodId) -> bool {
        self.owner_pod_id.as_ref() == Some(pod_id)
    }

    /// Applies a store update in place and derives the durations once
    /// an end date is known.
    pub fn apply(&mut self, update: &TaskUpdate) {
        self.status = update.status;

        match &update.owner {
            OwnerChange::Keep => {}
            OwnerChange::Assign { pod_id, pod_name } => {
                self.owner_pod_id = Some(pod_id.clone());
                self.owner_pod_name = Some(pod_name.clone());
            }
            OwnerChange::Clear => {
                self.owner_pod_id = None;
                self.owner_pod_name = None;
                self.acquisition_date = None;
            }
        }

        if let Some(at) = update.acquisition_date {
            self.acquisition_date = Some(at);
        }
        if let Some(at) = update.submitted_date {
            self.submitted_date = Some(at);
        }
        if let Some(at) = update.start_date {
            self.start_date = Some(at);
        }
        if let Some(output) = &update.output {
            self.output = Some(output.clone());
        }
        if let Some(end) = update.end_date {
            self.end_date = Some(end);
            self.creation_to_end_duration = (end - self.creation_date).to_std().ok();
            self.processing_to_end_duration = self
                .start_date
                .and_then(|start| (end - start).to_std().ok());
        }
    }
}

/// Owner field change carried by a [`TaskUpdate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OwnerChange {
    #[default]
    Keep,
    Assign {
        pod_id: PodId,
        pod_name: String,
    },
    Clear,
}

/// Mutation applied by a conditional update. Every update sets a status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub owner: OwnerChange,
    pub acquisition_date: Option<DateTime<Utc>>,
    pub submitted_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub output: Option<Output>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            owner: OwnerChange::Keep,
            acquisition_date: None,
            submitted_date: None,
            start_date: None,
            end_date: None,
            output: None,
        }
    }

    /// Submitted(empty) -> Dispatched(pod).
    pub fn dispatch(pod_id: &PodId, pod_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            owner: OwnerChange::Assign {
                pod_id: pod_id.clone(),
                pod_name: pod_name.to_owned(),
            },
            acquisition_date: Some(now),
            ..Self::status(TaskStatus::Dispatched)
        }
    }

    /// Back to the queue without an owner.
    pub fn release(now: DateTime<Utc>) -> Self {
        Self {
            owner: OwnerChange::Clear,
            submitted_date: Some(now),
            ..Self::status(TaskStatus::Submitted)
        }
    }

    /// Terminal transition with an output and an end date.
    pub fn finish(status: TaskStatus, output: Output, now: DateTime<Utc>) -> Self {
        Self {
            output: Some(output),
            end_date: Some(now),
            ..Self::status(status)
        }
    }

    pub fn with_start_date(mut self, at: DateTime<Utc>) -> Self {
        self.start_date = Some(at);
        self
    }

    pub fn with_submitted_date(mut self, at: DateTime<Utc>) -> Self {
        self.submitted_date = Some(at);
        self
    }

    pub fn with_end_date(mut self, at: DateTime<Utc>) -> Self {
        self.end_date = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::random(),
            SessionId::random(),
            DataId::random(),
            TaskOptions::default(),
            at(0),
        )
    }

    #[test]
    fn first_attempt_is_its_own_lineage_root() {
        let task = record();
        assert_eq!(task.initial_task_id, task.task_id);
        assert!(task.retry_of_ids.is_empty());
        assert_eq!(task.status, TaskStatus::Creating);
    }

    #[test]
    fn finishing_derives_durations() {
        let mut task = record().with_status(TaskStatus::Processing);
        task.apply(&TaskUpdate::status(TaskStatus::Processing).with_start_date(at(10)));
        task.apply(&TaskUpdate::finish(
            TaskStatus::Completed,
            Output::success(),
            at(25),
        ));

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.creation_to_end_duration, Some(Duration::from_secs(25)));
        assert_eq!(task.processing_to_end_duration, Some(Duration::from_secs(15)));
    }

    #[test]
    fn release_clears_owner_and_acquisition() {
        let pod = PodId::new("pod-a");
        let mut task = record()
            .with_status(TaskStatus::Dispatched)
            .with_owner(pod, at(1));

        task.apply(&TaskUpdate::release(at(2)));

        assert_eq!(task.status, TaskStatus::Submitted);
        assert_eq!(task.owner_pod_id, None);
        assert_eq!(task.owner_pod_name, None);
        assert_eq!(task.acquisition_date, None);
    }

    #[test]
    fn task_options_win_over_session_defaults() {
        let mut defaults = TaskOptions {
            max_duration_ms: Some(60_000),
            max_retries: Some(3),
            partition_id: Some("default".into()),
            ..TaskOptions::default()
        };
        defaults.options.insert("a".into(), "session".into());
        defaults.options.insert("b".into(), "session".into());

        let mut task = TaskOptions {
            max_retries: Some(5),
            priority: 2,
            ..TaskOptions::default()
        };
        task.options.insert("a".into(), "task".into());

        let merged = task.merged_with(&defaults);

        assert_eq!(merged.max_retries(), 5);
        assert_eq!(merged.max_duration(), Some(Duration::from_secs(60)));
        assert_eq!(merged.partition_id.as_deref(), Some("default"));
        assert_eq!(merged.priority, 2);
        assert_eq!(merged.options.get("a").map(String::as_str), Some("task"));
        assert_eq!(merged.options.get("b").map(String::as_str), Some("session"));
    }
}

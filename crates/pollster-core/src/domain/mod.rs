//! Domain model (ids, records, statuses, the acquisition decision, errors).
//!
//! Everything here is pure: no I/O, no clock, no async.

pub mod acquisition;
pub mod errors;
pub mod health;
pub mod ids;
pub mod retry_chain;
pub mod session;
pub mod status;
pub mod task;

pub use acquisition::{
    decide, AcquisitionInput, AcquisitionOutcome, Decision, RetryState, Transition, Verdict,
};
pub use errors::{
    CasFailure, CheckerError, PollsterError, QueueError, StorageError, StoreError, Transient,
    WorkerError,
};
pub use health::{HealthCheckTag, HealthReport, HealthStatus};
pub use ids::{DataId, MessageId, PodId, SessionId, TaskId};
pub use retry_chain::RetryPlan;
pub use session::SessionRecord;
pub use status::{QueueMessageStatus, SessionStatus, Settlement, TaskStatus};
pub use task::{Output, OutputStatus, OwnerChange, TaskOptions, TaskRecord, TaskUpdate};

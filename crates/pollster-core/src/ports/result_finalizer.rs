//! ResultFinalizer port - 結果の確定と依存タスクの解放
//!
//! タスクの終了後に呼ばれます。成功時は結果を確定し、失敗時は結果を
//! 中止扱いにして、それを待つタスクを終わらせます。

use async_trait::async_trait;

use crate::domain::{PollsterError, TaskId};

#[async_trait]
pub trait ResultFinalizer: Send + Sync {
    /// The task succeeded: persists its results and submits the dependents
    /// that were only waiting on them.
    async fn finalize(&self, task_id: TaskId) -> Result<(), PollsterError>;

    /// The task ended in `Error`, `Timeout` or `Cancelled`: its results will
    /// never exist. Dependents waiting on them end in `Error`.
    async fn abort(&self, task_id: TaskId) -> Result<(), PollsterError>;
}

//! InMemoryResultFinalizer - 開発用の結果確定
//!
//! 成功したタスクの出力を確定し、それだけを待っていたタスクを投入します。
//! 失敗したタスクの出力は中止扱いにし、待っていたタスクを連鎖的に
//! `Error` にします。

use std::sync::Arc;

use async_trait::async_trait;

use super::memory_store::InMemoryTaskStore;
use crate::domain::{PollsterError, TaskId};
use crate::ports::{Clock, PushQueue, ResultFinalizer, TaskStore};

pub struct InMemoryResultFinalizer {
    store: Arc<InMemoryTaskStore>,
    push_queue: Arc<dyn PushQueue>,
    clock: Arc<dyn Clock>,
}

impl InMemoryResultFinalizer {
    pub fn new(
        store: Arc<InMemoryTaskStore>,
        push_queue: Arc<dyn PushQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            push_queue,
            clock,
        }
    }
}

#[async_trait]
impl ResultFinalizer for InMemoryResultFinalizer {
    async fn finalize(&self, task_id: TaskId) -> Result<(), PollsterError> {
        let Some(task) = self.store.read(task_id).await? else {
            return Ok(());
        };

        let mut ready = Vec::new();
        for output in &task.expected_output_ids {
            ready.extend(self.store.resolve_data(*output, self.clock.now()).await);
        }

        if !ready.is_empty() {
            tracing::debug!(%task_id, dependents = ready.len(), "submitting unblocked dependents");
            self.push_queue.push(&ready).await?;
        }
        Ok(())
    }

    async fn abort(&self, task_id: TaskId) -> Result<(), PollsterError> {
        // Failed dependents abort their own outputs in turn.
        let mut aborting = vec![task_id];
        while let Some(task_id) = aborting.pop() {
            let Some(task) = self.store.read(task_id).await? else {
                continue;
            };
            for output in &task.expected_output_ids {
                let failed = self.store.abort_data(*output, self.clock.now()).await;
                if !failed.is_empty() {
                    tracing::info!(
                        %task_id,
                        data_id = %output,
                        dependents = failed.len(),
                        "result aborted, failing dependents"
                    );
                }
                aborting.extend(failed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DataId, SessionId, TaskOptions, TaskRecord, TaskStatus};
    use crate::impls::InMemoryQueue;
    use crate::ports::SystemClock;
    use chrono::Utc;

    #[tokio::test]
    async fn dependents_are_submitted_once_all_inputs_exist() {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let finalizer =
            InMemoryResultFinalizer::new(store.clone(), queue.clone(), Arc::new(SystemClock));
        let session = SessionId::random();
        let (out_a, out_b) = (DataId::random(), DataId::random());

        let producer_a = TaskRecord::new(TaskId::random(), session, DataId::random(), TaskOptions::default(), Utc::now())
            .with_status(TaskStatus::Completed)
            .with_expected_outputs([out_a]);
        let producer_b = TaskRecord::new(TaskId::random(), session, DataId::random(), TaskOptions::default(), Utc::now())
            .with_status(TaskStatus::Completed)
            .with_expected_outputs([out_b]);
        let consumer = TaskRecord::new(TaskId::random(), session, DataId::random(), TaskOptions::default(), Utc::now())
            .with_dependencies([out_a, out_b]);
        for task in [&producer_a, &producer_b, &consumer] {
            store.insert(task.clone()).await;
        }

        finalizer.finalize(producer_a.task_id).await.unwrap();
        assert!(queue.pending().await.is_empty());
        assert_eq!(store.get(consumer.task_id).await.unwrap().status, TaskStatus::Creating);

        finalizer.finalize(producer_b.task_id).await.unwrap();
        assert_eq!(queue.pending().await, vec![consumer.task_id]);
        assert_eq!(store.get(consumer.task_id).await.unwrap().status, TaskStatus::Submitted);
        assert!(store.is_available(out_a).await);
    }

    #[tokio::test]
    async fn aborted_results_fail_dependents_transitively() {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let finalizer =
            InMemoryResultFinalizer::new(store.clone(), queue.clone(), Arc::new(SystemClock));
        let session = SessionId::random();
        let (out_a, out_b) = (DataId::random(), DataId::random());

        let failed = TaskRecord::new(TaskId::random(), session, DataId::random(), TaskOptions::default(), Utc::now())
            .with_status(TaskStatus::Error)
            .with_expected_outputs([out_a]);
        let middle = TaskRecord::new(TaskId::random(), session, DataId::random(), TaskOptions::default(), Utc::now())
            .with_dependencies([out_a])
            .with_expected_outputs([out_b]);
        let last = TaskRecord::new(TaskId::random(), session, DataId::random(), TaskOptions::default(), Utc::now())
            .with_dependencies([out_b]);
        for task in [&failed, &middle, &last] {
            store.insert(task.clone()).await;
        }

        finalizer.abort(failed.task_id).await.unwrap();

        assert_eq!(store.get(middle.task_id).await.unwrap().status, TaskStatus::Error);
        assert_eq!(store.get(last.task_id).await.unwrap().status, TaskStatus::Error);
        assert!(store.is_aborted(out_a).await);
        assert!(store.is_aborted(out_b).await);
        assert!(queue.pending().await.is_empty());
    }
}

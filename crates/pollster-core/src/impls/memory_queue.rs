//! InMemoryQueue - 開発用の at-least-once キュー
//!
//! - 配信待ちの `VecDeque<TaskId>` を tokio の `Mutex` で保護
//! - push / release で `Notify` が取得側を起こす
//! - 決着したメッセージは処分に応じて ack・再配信・デッドレターのいずれか

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::domain::{
    HealthCheckTag, HealthReport, MessageId, QueueError, QueueMessageStatus, Settlement, TaskId,
};
use crate::ports::{IdGenerator, PullQueue, PushQueue, QueueMessage, SystemClock, UlidGenerator};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<TaskId>,
    in_flight: usize,
    acked: Vec<TaskId>,
    dead_letters: Vec<TaskId>,
    settlements: Vec<(TaskId, QueueMessageStatus)>,
    /// Remaining pulls that fail with `Unavailable`.
    failures: u32,
    health: Option<HealthReport>,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    redelivery_delay: Duration,
}

impl Shared {
    async fn enqueue(&self, task_ids: &[TaskId]) {
        let mut state = self.state.lock().await;
        state.ready.extend(task_ids.iter().copied());
        drop(state);
        for _ in task_ids {
            self.notify.notify_one();
        }
    }
}

pub struct InMemoryQueue {
    shared: Arc<Shared>,
    ids: UlidGenerator<SystemClock>,
    poll_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                redelivery_delay: Duration::ZERO,
            }),
            ids: UlidGenerator::new(SystemClock),
            poll_timeout: Duration::from_millis(100),
        }
    }

    /// How long an empty pull waits for a delivery before returning nothing.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Released messages become visible again after `delay`.
    pub fn with_redelivery_delay(self, delay: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            redelivery_delay: delay,
        });
        Self { shared, ..self }
    }

    pub async fn pending(&self) -> Vec<TaskId> {
        self.shared.state.lock().await.ready.iter().copied().collect()
    }

    pub async fn in_flight(&self) -> usize {
        self.shared.state.lock().await.in_flight
    }

    pub async fn acked(&self) -> Vec<TaskId> {
        self.shared.state.lock().await.acked.clone()
    }

    pub async fn dead_letters(&self) -> Vec<TaskId> {
        self.shared.state.lock().await.dead_letters.clone()
    }

    /// Dispositions of settled messages, in settlement order.
    pub async fn settlements(&self) -> Vec<(TaskId, QueueMessageStatus)> {
        self.shared.state.lock().await.settlements.clone()
    }

    /// The next `n` pulls fail with `QueueError::Unavailable`.
    pub async fn fail_pulls(&self, n: u32) {
        self.shared.state.lock().await.failures = n;
    }

    pub async fn set_health(&self, report: Option<HealthReport>) {
        self.shared.state.lock().await.health = report;
    }

    /// Builds a delivery of `task_id` without going through the queue.
    pub async fn deliver(&self, task_id: TaskId) -> Box<dyn QueueMessage> {
        self.shared.state.lock().await.in_flight += 1;
        self.message(task_id)
    }

    fn message(&self, task_id: TaskId) -> Box<dyn QueueMessage> {
        Box::new(InMemoryMessage {
            message_id: self.ids.generate_message_id(),
            task_id,
            status: OnceLock::new(),
            shared: self.shared.clone(),
        })
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PullQueue for InMemoryQueue {
    async fn check(&self, _tag: HealthCheckTag) -> HealthReport {
        self.shared
            .state
            .lock()
            .await
            .health
            .clone()
            .unwrap_or_else(HealthReport::healthy)
    }

    async fn pull(
        &self,
        max: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Box<dyn QueueMessage>>, QueueError> {
        loop {
            {
                let mut state = self.shared.state.lock().await;
                if state.failures > 0 {
                    state.failures -= 1;
                    return Err(QueueError::Unavailable("injected failure".into()));
                }
                if !state.ready.is_empty() {
                    let n = max.min(state.ready.len());
                    let task_ids: Vec<TaskId> = state.ready.drain(..n).collect();
                    state.in_flight += task_ids.len();
                    drop(state);
                    return Ok(task_ids.into_iter().map(|id| self.message(id)).collect());
                }
            }

            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_timeout) => return Ok(Vec::new()),
                _ = cancel.cancelled() => return Ok(Vec::new()),
            }
        }
    }
}

#[async_trait]
impl PushQueue for InMemoryQueue {
    async fn push(&self, task_ids: &[TaskId]) -> Result<(), QueueError> {
        self.shared.enqueue(task_ids).await;
        Ok(())
    }
}

struct InMemoryMessage {
    message_id: MessageId,
    task_id: TaskId,
    status: OnceLock<QueueMessageStatus>,
    shared: Arc<Shared>,
}

#[async_trait]
impl QueueMessage for InMemoryMessage {
    fn message_id(&self) -> MessageId {
        self.message_id
    }

    fn task_id(&self) -> TaskId {
        self.task_id
    }

    fn status(&self) -> QueueMessageStatus {
        self.status
            .get()
            .copied()
            .unwrap_or(QueueMessageStatus::Waiting)
    }

    fn set_status(&self, status: QueueMessageStatus) -> Result<(), QueueError> {
        if status == QueueMessageStatus::Waiting && self.status.get().is_none() {
            return Ok(());
        }
        self.status
            .set(status)
            .map_err(|_| QueueError::AlreadySettled(self.message_id.to_string()))
    }

    async fn settle(self: Box<Self>) -> Result<(), QueueError> {
        let status = self.status();
        let mut state = self.shared.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        state.settlements.push((self.task_id, status));

        match status.settlement() {
            Settlement::Ack => state.acked.push(self.task_id),
            Settlement::Reject => state.dead_letters.push(self.task_id),
            Settlement::Release => {
                drop(state);
                let delay = self.shared.redelivery_delay;
                if delay.is_zero() {
                    self.shared.enqueue(&[self.task_id]).await;
                } else {
                    let shared = self.shared.clone();
                    let task_id = self.task_id;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        shared.enqueue(&[task_id]).await;
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn pushed_ids_are_pulled_in_order() {
        let queue = InMemoryQueue::new();
        let (a, b, c) = (TaskId::random(), TaskId::random(), TaskId::random());
        queue.push(&[a, b, c]).await.unwrap();

        let messages = queue.pull(2, &CancellationToken::new()).await.unwrap();

        let ids: Vec<TaskId> = messages.iter().map(|m| m.task_id()).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(queue.in_flight().await, 2);
        assert_eq!(queue.pending().await, vec![c]);
    }

    #[tokio::test]
    async fn empty_pull_times_out() {
        let queue = InMemoryQueue::new().with_poll_timeout(Duration::from_millis(50));
        let start = Instant::now();

        let messages = queue.pull(1, &CancellationToken::new()).await.unwrap();

        assert!(messages.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn cancelled_pull_returns_nothing() {
        let queue = InMemoryQueue::new().with_poll_timeout(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(queue.pull(1, &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disposition_is_set_once() {
        let queue = InMemoryQueue::new();
        let message = queue.deliver(TaskId::random()).await;

        assert_eq!(message.status(), QueueMessageStatus::Waiting);
        message.set_status(QueueMessageStatus::Waiting).unwrap();
        message.set_status(QueueMessageStatus::Postponed).unwrap();
        assert!(matches!(
            message.set_status(QueueMessageStatus::Processed),
            Err(QueueError::AlreadySettled(_))
        ));
        assert_eq!(message.status(), QueueMessageStatus::Postponed);
    }

    #[tokio::test]
    async fn settlement_follows_disposition() {
        let queue = InMemoryQueue::new();
        let (done, later, poison, untouched) = (
            TaskId::random(),
            TaskId::random(),
            TaskId::random(),
            TaskId::random(),
        );

        for (task_id, status) in [
            (done, Some(QueueMessageStatus::Processed)),
            (later, Some(QueueMessageStatus::Postponed)),
            (poison, Some(QueueMessageStatus::Poisonous)),
            (untouched, None),
        ] {
            let message = queue.deliver(task_id).await;
            if let Some(status) = status {
                message.set_status(status).unwrap();
            }
            message.settle().await.unwrap();
        }

        assert_eq!(queue.acked().await, vec![done]);
        assert_eq!(queue.dead_letters().await, vec![poison]);
        assert_eq!(queue.pending().await, vec![later, untouched]);
        assert_eq!(queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn released_message_is_redelivered_after_delay() {
        let queue = InMemoryQueue::new().with_redelivery_delay(Duration::from_millis(30));
        let task_id = TaskId::random();
        let message = queue.deliver(task_id).await;
        message.set_status(QueueMessageStatus::Postponed).unwrap();
        message.settle().await.unwrap();

        assert!(queue.pending().await.is_empty());

        let redelivered = queue.pull(1, &CancellationToken::new()).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].task_id(), task_id);
    }

    #[tokio::test]
    async fn injected_pull_failure() {
        let queue = InMemoryQueue::new();
        queue.fail_pulls(1).await;

        assert!(matches!(
            queue.pull(1, &CancellationToken::new()).await,
            Err(QueueError::Unavailable(_))
        ));
    }
}

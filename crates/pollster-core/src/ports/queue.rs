//! Queue port - 配信メッセージの取得と投入
//!
//! 配信は at-least-once です。同じ task_id が複数回、同時に、
//! 別々のエージェントへ届くことがあります。

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    HealthCheckTag, HealthReport, MessageId, QueueError, QueueMessageStatus, TaskId,
};

/// One delivery of a task id.
///
/// The disposition starts `Waiting` and can be set once; the transport acts on
/// it when the message is settled.
#[async_trait]
pub trait QueueMessage: Send + Sync {
    fn message_id(&self) -> MessageId;

    fn task_id(&self) -> TaskId;

    fn status(&self) -> QueueMessageStatus;

    /// Sets the disposition. Fails once a non-`Waiting` disposition is set.
    fn set_status(&self, status: QueueMessageStatus) -> Result<(), QueueError>;

    /// Hands the message back to the transport (ack, release or reject).
    async fn settle(self: Box<Self>) -> Result<(), QueueError>;
}

#[async_trait]
pub trait PullQueue: Send + Sync {
    async fn init(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn check(&self, _tag: HealthCheckTag) -> HealthReport {
        HealthReport::healthy()
    }

    /// Up to `max` messages. May return fewer, or none when `cancel` fires.
    async fn pull(
        &self,
        max: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Box<dyn QueueMessage>>, QueueError>;
}

#[async_trait]
pub trait PushQueue: Send + Sync {
    async fn push(&self, task_ids: &[TaskId]) -> Result<(), QueueError>;
}

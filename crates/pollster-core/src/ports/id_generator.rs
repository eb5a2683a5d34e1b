//! IdGenerator port - エージェント自身が作るレコードの ID 生成
//!
//! エージェントが ID を発行するのはリトライ後継タスクと、インメモリキューの
//! 配信メッセージだけです。それ以外の ID は外から渡されます。

use crate::domain::ids::{MessageId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_message_id(&self) -> MessageId;
}

/// ULID generator stamped with the injected clock.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_message_id(&self) -> MessageId {
        MessageId::from(self.next_ulid())
    }
}

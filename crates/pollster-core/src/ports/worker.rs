//! Worker port - 外部ワーカープロセスとの双方向ストリーム
//!
//! タスクごとにストリームを開き、タスクのヘッダとデータのローカルパスを送り、
//! 送信側を閉じてから単一の応答を待ちます。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    DataId, HealthCheckTag, HealthReport, Output, SessionId, TaskId, TaskOptions, WorkerError,
};

/// Messages sent to the worker over the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeRequest {
    Init {
        task_id: TaskId,
        session_id: SessionId,
        payload_id: DataId,
        expected_output_ids: Vec<DataId>,
        options: TaskOptions,
    },
    /// Fetched data, available at `path`.
    Data { data_id: DataId, path: PathBuf },
}

#[async_trait]
pub trait WorkerConnector: Send + Sync {
    async fn init(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn check(&self, _tag: HealthCheckTag) -> HealthReport {
        HealthReport::healthy()
    }

    /// Opens a stream for `task_id`.
    ///
    /// `abort` is the hard-abort signal; `deadline` bounds the whole call.
    /// `WorkerError::Unavailable` here means nothing was started.
    async fn connect(
        &self,
        task_id: TaskId,
        abort: CancellationToken,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Box<dyn WorkerStream>, WorkerError>;
}

#[async_trait]
pub trait WorkerStream: Send {
    async fn send(&mut self, request: ComputeRequest) -> Result<(), WorkerError>;

    /// Half-close: no more requests.
    async fn finish(&mut self) -> Result<(), WorkerError>;

    async fn reply(&mut self) -> Result<Output, WorkerError>;
}

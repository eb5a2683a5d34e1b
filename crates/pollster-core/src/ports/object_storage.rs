use async_trait::async_trait;

use crate::domain::{DataId, HealthCheckTag, HealthReport, StorageError};

/// Byte-level access to payloads and results.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn init(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn check(&self, _tag: HealthCheckTag) -> HealthReport {
        HealthReport::healthy()
    }

    /// `StorageError::NotFound` when the object does not exist.
    async fn get(&self, data_id: DataId) -> Result<Vec<u8>, StorageError>;
}

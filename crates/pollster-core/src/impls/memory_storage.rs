use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{DataId, HealthCheckTag, HealthReport, StorageError};
use crate::ports::ObjectStorage;

/// Object storage backed by a `HashMap`.
#[derive(Default)]
pub struct InMemoryObjectStorage {
    objects: Mutex<HashMap<DataId, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, data_id: DataId, bytes: impl Into<Vec<u8>>) {
        self.objects.lock().await.insert(data_id, bytes.into());
    }

    /// While set, every `get` fails with `StorageError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn check(&self, _tag: HealthCheckTag) -> HealthReport {
        if self.unavailable.load(Ordering::SeqCst) {
            HealthReport::unhealthy("object storage unavailable")
        } else {
            HealthReport::healthy()
        }
    }

    async fn get(&self, data_id: DataId) -> Result<Vec<u8>, StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected failure".into()));
        }
        self.objects
            .lock()
            .await
            .get(&data_id)
            .cloned()
            .ok_or(StorageError::NotFound(data_id))
    }
}

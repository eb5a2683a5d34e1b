use async_trait::async_trait;

use crate::domain::{HealthCheckTag, HealthReport, SessionId, SessionRecord, StoreError};

/// Read-only view of sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn check(&self, _tag: HealthCheckTag) -> HealthReport {
        HealthReport::healthy()
    }

    async fn read(&self, session_id: SessionId) -> Result<Option<SessionRecord>, StoreError>;
}

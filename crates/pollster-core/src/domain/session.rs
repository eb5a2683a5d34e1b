use serde::{Deserialize, Serialize};

use super::ids::SessionId;
use super::status::SessionStatus;
use super::task::TaskOptions;

/// Session as seen by the agent (read-only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub partition_ids: Vec<String>,
    pub default_options: TaskOptions,
}

impl SessionRecord {
    pub fn running(session_id: SessionId) -> Self {
        Self {
            session_id,
            status: SessionStatus::Running,
            partition_ids: Vec::new(),
            default_options: TaskOptions::default(),
        }
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_default_options(mut self, options: TaskOptions) -> Self {
        self.default_options = options;
        self
    }
}

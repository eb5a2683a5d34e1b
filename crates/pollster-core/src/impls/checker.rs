use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{CheckerError, PodId, SessionId, TaskId};
use crate::ports::ProcessingChecker;

/// Processing checker driven by an explicit list of dead pods.
/// Every other pod is reported alive.
#[derive(Default)]
pub struct StaticProcessingChecker {
    dead: Mutex<HashSet<PodId>>,
    calls: AtomicUsize,
}

impl StaticProcessingChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mark_dead(&self, pod_id: PodId) {
        self.dead.lock().await.insert(pod_id);
    }

    pub async fn mark_alive(&self, pod_id: &PodId) {
        self.dead.lock().await.remove(pod_id);
    }

    /// Number of `is_alive` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessingChecker for StaticProcessingChecker {
    async fn is_alive(
        &self,
        _session_id: SessionId,
        _task_id: TaskId,
        owner: &PodId,
    ) -> Result<bool, CheckerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(!self.dead.lock().await.contains(owner))
    }
}

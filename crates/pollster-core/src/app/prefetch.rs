//! Data prefetch - copies a task's payload and data dependencies into its
//! scratch directory before the worker is called.
//!
//! Layout: `<scratch_root>/<task_id>/<data_id>`.

use std::path::{Path, PathBuf};

use crate::app::context::AgentContext;
use crate::domain::{StorageError, TaskId, TaskRecord};
use crate::ports::ComputeRequest;

#[derive(Debug)]
pub struct Prefetched {
    pub dir: PathBuf,
    /// Task header first, then one entry per fetched object.
    pub requests: Vec<ComputeRequest>,
}

pub fn scratch_dir(root: &Path, task_id: TaskId) -> PathBuf {
    root.join(task_id.to_string())
}

pub async fn prefetch(ctx: &AgentContext, task: &TaskRecord) -> Result<Prefetched, StorageError> {
    let dir = scratch_dir(ctx.config.scratch_root(), task.task_id);
    tokio::fs::create_dir_all(&dir).await?;

    let mut requests = vec![ComputeRequest::Init {
        task_id: task.task_id,
        session_id: task.session_id,
        payload_id: task.payload_id,
        expected_output_ids: task.expected_output_ids.clone(),
        options: task.options.clone(),
    }];

    let policy = ctx.config.infra_retry();
    let storage = &ctx.storage;
    let wanted = std::iter::once(task.payload_id).chain(task.data_dependencies.iter().copied());
    for data_id in wanted {
        let bytes = policy
            .retry("fetch data", move || storage.get(data_id))
            .await?;
        let path = dir.join(data_id.to_string());
        tokio::fs::write(&path, &bytes).await?;
        tracing::trace!(%data_id, size = bytes.len(), "data fetched");
        requests.push(ComputeRequest::Data { data_id, path });
    }

    Ok(Prefetched { dir, requests })
}

/// Removes a scratch directory; a missing one is fine.
pub async fn cleanup(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "failed to remove scratch directory"),
    }
}

//! Snapshot retention, locally and in the object store.

use crate::layout::{ProjectLayout, SNAPSHOT_NAME_LEN};
use crate::log_buffer::LogBuffer;
use crate::sync::DifferentialSync;
use crate::utils::errors::{BackupError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Names beyond the newest `keep`, newest first.
pub fn select_excess(mut names: Vec<String>, keep: usize) -> Vec<String> {
    names.sort();
    names.reverse();
    names.into_iter().skip(keep).collect()
}

/// Snapshot directories under `backup_root` that exceed `keep`.
///
/// Only immediate subdirectories whose name is exactly as long as a snapshot
/// date are considered. A missing `backup_root` has nothing to prune.
pub async fn compute_deletions(backup_root: &Path, keep: usize) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(backup_root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.len() == SNAPSHOT_NAME_LEN {
            names.push(name);
        }
    }

    Ok(select_excess(names, keep)
        .into_iter()
        .map(|name| backup_root.join(name))
        .collect())
}

/// Prunes one server's projects. Cloud deletion happens only when the server
/// mirrors to an object store.
pub struct RetentionManager {
    local_root: PathBuf,
    sync: Option<Arc<DifferentialSync>>,
}

impl RetentionManager {
    pub fn new(local_root: impl Into<PathBuf>, sync: Option<Arc<DifferentialSync>>) -> Self {
        Self {
            local_root: local_root.into(),
            sync,
        }
    }

    /// Remove the project's excess snapshots and return how many local
    /// directories went away.
    ///
    /// The snapshot being written by this run is never removed. A failed
    /// local removal is logged and the next one is still attempted; the cloud
    /// deletion is a single batch whose failure is logged once.
    pub async fn prune(&self, layout: &ProjectLayout, keep: usize, log: &LogBuffer) -> Result<usize> {
        let deletions: Vec<PathBuf> = compute_deletions(&layout.backup_root, keep)
            .await
            .map_err(|e| BackupError::local_io(&layout.backup_root, e))?
            .into_iter()
            .filter(|path| *path != layout.snapshot_dir)
            .collect();

        if deletions.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        for path in &deletions {
            match tokio::fs::remove_dir_all(path).await {
                Ok(()) => {
                    log.add_header(format!("Removed old snapshot {}", path.display()));
                    removed += 1;
                }
                Err(e) => log.add_header(format!("Cannot remove {}: {}", path.display(), e)),
            }
        }

        if let Some(sync) = &self.sync {
            match sync.delete_snapshots(&self.local_root, &deletions).await {
                Ok(keys) => log.add_header(format!(
                    "Removed {} objects of {} old snapshots from {}",
                    keys,
                    deletions.len(),
                    sync.bucket()
                )),
                Err(e) => log.add_header(format!("Cloud retention failed: {}", e)),
            }
        }

        Ok(removed)
    }
}

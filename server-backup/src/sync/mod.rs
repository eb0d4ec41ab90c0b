//! Size-based mirroring of a server's local backup tree to an object store.
//!
//! A local file is uploaded when its key is missing from the bucket or the
//! stored size differs. Equal sizes count as unchanged; content is never
//! hashed.

pub mod s3;

use crate::config::S3Config;
use crate::fs::{slash_path, walk_files};
use crate::log_buffer::LogBuffer;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One entry of a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: i64,
}

/// Object-store capability the sync runs against.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Every object in `bucket`.
    async fn list(&self, bucket: &str) -> Result<Vec<ObjectEntry>>;

    /// Stream `file` to `key`. The file is dropped when the call returns.
    async fn put(&self, bucket: &str, key: &str, file: tokio::fs::File) -> Result<()>;

    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<()>;
}

/// Opens a store client for one server's `[s3]` table.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn open(&self, config: &S3Config) -> Result<Arc<dyn RemoteStore>>;
}

/// A local file and the key it mirrors to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct UploadPlan {
    pub uploads: Vec<LocalFile>,
    pub unchanged: Vec<LocalFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes: u64,
}

/// Key to size, leaving out directory placeholders (size < 1).
pub fn remote_sizes(entries: &[ObjectEntry]) -> HashMap<String, i64> {
    entries
        .iter()
        .filter(|entry| entry.size >= 1)
        .map(|entry| (entry.key.clone(), entry.size))
        .collect()
}

/// Split local files into uploads (new or size changed) and unchanged ones.
pub fn plan_uploads(local: Vec<LocalFile>, remote: &HashMap<String, i64>) -> UploadPlan {
    let mut plan = UploadPlan::default();
    for file in local {
        match remote.get(&file.key) {
            Some(&size) if u64::try_from(size).ok() == Some(file.size) => plan.unchanged.push(file),
            _ => plan.uploads.push(file),
        }
    }
    plan
}

pub fn object_key(prefix: &str, relative: &str) -> String {
    format!("{}{}", prefix, relative)
}

pub struct DifferentialSync {
    store: Arc<dyn RemoteStore>,
    bucket: String,
    prefix: String,
}

impl DifferentialSync {
    pub fn new(store: Arc<dyn RemoteStore>, config: &S3Config) -> Self {
        Self {
            store,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Mirror `local_root` into the bucket.
    ///
    /// A missing bucket, a failed listing or a failed walk aborts the sync.
    /// A single file that cannot be opened or uploaded is logged and counted,
    /// and the remaining files still go up.
    pub async fn upload_changed_or_new(&self, local_root: &Path, log: &LogBuffer) -> Result<SyncReport> {
        if !self.store.bucket_exists(&self.bucket).await? {
            return Err(BackupError::Sync(format!("bucket {} does not exist", self.bucket)));
        }

        let listing = self
            .store
            .list(&self.bucket)
            .await
            .map_err(|e| BackupError::Sync(format!("listing bucket {}: {}", self.bucket, e)))?;
        let remote = remote_sizes(&listing);

        let local = self.local_files(local_root).await?;
        let plan = plan_uploads(local, &remote);

        let mut report = SyncReport {
            skipped: plan.unchanged.len(),
            ..Default::default()
        };

        for file in &plan.unchanged {
            log.add_header(format!("Skipping {} (unchanged, {} bytes)", file.key, file.size));
        }

        for file in plan.uploads {
            let handle = match tokio::fs::File::open(&file.path).await {
                Ok(handle) => handle,
                Err(e) => {
                    log.add_header(format!("Cannot open {}: {}", file.path.display(), e));
                    report.failed += 1;
                    continue;
                }
            };

            match self.store.put(&self.bucket, &file.key, handle).await {
                Ok(()) => {
                    log.add_header(format!("Uploaded {} ({} bytes)", file.key, file.size));
                    report.uploaded += 1;
                    report.bytes += file.size;
                }
                Err(e) => {
                    log.add_header(format!("Upload of {} failed: {}", file.key, e));
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            bucket = %self.bucket,
            uploaded = report.uploaded,
            skipped = report.skipped,
            failed = report.failed,
            "Sync finished"
        );
        Ok(report)
    }

    /// Delete every object stored under the given snapshot directories, with
    /// one listing and one batched delete. Returns the number of keys removed.
    pub async fn delete_snapshots(&self, local_root: &Path, snapshots: &[PathBuf]) -> Result<usize> {
        let prefixes: Vec<String> = snapshots
            .iter()
            .filter_map(|dir| dir.strip_prefix(local_root).ok())
            .map(|relative| format!("{}/", object_key(&self.prefix, &slash_path(relative))))
            .collect();
        if prefixes.is_empty() {
            return Ok(0);
        }

        let listing = self
            .store
            .list(&self.bucket)
            .await
            .map_err(|e| BackupError::Sync(format!("listing bucket {}: {}", self.bucket, e)))?;

        let keys: Vec<String> = listing
            .into_iter()
            .map(|entry| entry.key)
            .filter(|key| prefixes.iter().any(|prefix| key.starts_with(prefix.as_str())))
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        self.store.delete_many(&self.bucket, &keys).await?;
        Ok(keys.len())
    }

    async fn local_files(&self, local_root: &Path) -> Result<Vec<LocalFile>> {
        let root = local_root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || walk_files(&root))
            .await
            .map_err(|e| BackupError::Sync(e.to_string()))?
            .map_err(|e| BackupError::Sync(format!("walking {}: {}", local_root.display(), e)))?;

        Ok(files
            .into_iter()
            .map(|file| LocalFile {
                key: object_key(&self.prefix, &file.slash_path()),
                path: file.path,
                size: file.size,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use std::fs;
    use tempfile::TempDir;

    fn local(key: &str, size: u64) -> LocalFile {
        LocalFile {
            path: PathBuf::from(key),
            key: key.to_string(),
            size,
        }
    }

    fn entry(key: &str, size: i64) -> ObjectEntry {
        ObjectEntry {
            key: key.to_string(),
            size,
        }
    }

    fn s3(prefix: &str) -> S3Config {
        S3Config {
            bucket: "backups".into(),
            profile: None,
            region: None,
            endpoint: None,
            prefix: prefix.into(),
        }
    }

    #[test]
    fn test_plan_new_changed_and_unchanged() {
        let remote = remote_sizes(&[entry("b.txt", 200), entry("c.txt", 40)]);
        let plan = plan_uploads(
            vec![local("a.txt", 100), local("b.txt", 200), local("c.txt", 50)],
            &remote,
        );

        let uploads: Vec<&str> = plan.uploads.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(uploads, vec!["a.txt", "c.txt"]);
        assert_eq!(plan.unchanged, vec![local("b.txt", 200)]);
    }

    #[test]
    fn test_placeholders_are_ignored() {
        let remote = remote_sizes(&[entry("app/", 0), entry("app/x.zip", 10)]);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote.get("app/x.zip"), Some(&10));
    }

    #[tokio::test]
    async fn test_upload_changed_or_new() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.txt"), vec![b'a'; 100]).unwrap();
        fs::write(root.join("b.txt"), vec![b'b'; 200]).unwrap();
        fs::create_dir_all(root.join("app/2024-01-05")).unwrap();
        fs::write(root.join("app/2024-01-05/c.txt"), vec![b'c'; 50]).unwrap();

        let store = Arc::new(MemoryStore::new("backups"));
        store.insert("web/b.txt", vec![0; 200]);
        store.insert("web/app/2024-01-05/c.txt", vec![0; 40]);

        let sync = DifferentialSync::new(store.clone(), &s3("web/"));
        let log = LogBuffer::new("sync", false);
        let report = sync.upload_changed_or_new(root, &log).await.unwrap();

        assert_eq!(report.uploaded, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.bytes, 150);
        assert_eq!(store.object("web/a.txt").unwrap().len(), 100);
        assert_eq!(store.object("web/app/2024-01-05/c.txt").unwrap().len(), 50);
        assert_eq!(store.puts(), 2);
        assert!(log.contents().contains("Skipping web/b.txt"));
    }

    #[tokio::test]
    async fn test_single_upload_failure_does_not_abort() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"one").unwrap();
        fs::write(temp_dir.path().join("b.txt"), b"two").unwrap();

        let store = Arc::new(MemoryStore::new("backups").fail_put("a.txt"));
        let sync = DifferentialSync::new(store.clone(), &s3(""));
        let log = LogBuffer::new("sync", false);
        let report = sync.upload_changed_or_new(temp_dir.path(), &log).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.uploaded, 1);
        assert!(store.object("b.txt").is_some());
        assert!(log.contents().contains("Upload of a.txt failed"));
    }

    #[tokio::test]
    async fn test_listing_failure_aborts() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"one").unwrap();

        let store = Arc::new(MemoryStore::new("backups").fail_list());
        let sync = DifferentialSync::new(store.clone(), &s3(""));
        let log = LogBuffer::new("sync", false);

        let err = sync.upload_changed_or_new(temp_dir.path(), &log).await.unwrap_err();
        assert!(matches!(err, BackupError::Sync(_)));
        assert_eq!(store.puts(), 0);
    }

    #[tokio::test]
    async fn test_missing_bucket_aborts() {
        let store = Arc::new(MemoryStore::new("other"));
        let sync = DifferentialSync::new(store, &s3(""));
        let log = LogBuffer::new("sync", false);

        let err = sync.upload_changed_or_new(Path::new("."), &log).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_delete_snapshots_batches_keys() {
        let store = Arc::new(MemoryStore::new("backups"));
        store.insert("web/app/2024-01-01/2024-01-01_app.zip", vec![1]);
        store.insert("web/app/2024-01-01/2024-01-01.log", vec![1]);
        store.insert("web/app/2024-01-02/2024-01-02_app.zip", vec![1]);
        store.insert("web/app/2024-01-05/2024-01-05_app.zip", vec![1]);
        store.insert("web/app/2024-01-010/stray", vec![1]);

        let sync = DifferentialSync::new(store.clone(), &s3("web/"));
        let root = Path::new("/backups/web");
        let removed = sync
            .delete_snapshots(
                root,
                &[root.join("app/2024-01-01"), root.join("app/2024-01-02")],
            )
            .await
            .unwrap();

        assert_eq!(removed, 3);
        assert_eq!(store.delete_calls(), 1);
        assert!(store.object("web/app/2024-01-05/2024-01-05_app.zip").is_some());
        assert!(store.object("web/app/2024-01-010/stray").is_some());
    }
}

//! One project on one server: archive and dump side by side, then retention.

use super::report::{ProjectReport, StepOutcome};
use crate::config::{ProjectConfig, ServerConfig, DEFAULT_KEEP};
use crate::credentials::{merge_env, parse_env, DbCredentials};
use crate::layout::{ProjectLayout, RunDate};
use crate::log_buffer::LogBuffer;
use crate::remote::RemoteCommandRunner;
use crate::retention::RetentionManager;
use std::path::Path;
use std::sync::Arc;

pub struct ProjectUnit {
    server: Arc<ServerConfig>,
    project: ProjectConfig,
    layout: ProjectLayout,
    runner: RemoteCommandRunner,
    retention: Arc<RetentionManager>,
    log: Arc<LogBuffer>,
}

impl ProjectUnit {
    pub fn new(
        server: Arc<ServerConfig>,
        project: ProjectConfig,
        date: RunDate,
        runner: RemoteCommandRunner,
        retention: Arc<RetentionManager>,
        verbose: bool,
    ) -> Self {
        let layout = ProjectLayout::resolve(&server, &project, date);
        let log = Arc::new(LogBuffer::new(
            format!("{}/{}", server.name, project.path),
            verbose,
        ));
        Self {
            server,
            project,
            layout,
            runner,
            retention,
            log,
        }
    }

    /// Never fails; every problem ends up in the project log and the report.
    pub async fn run(self) -> ProjectReport {
        let mut report = ProjectReport {
            path: self.project.path.clone(),
            archive: StepOutcome::Skipped("not started".into()),
            database: StepOutcome::Skipped("not started".into()),
            pruned: 0,
            error: None,
        };

        tracing::info!(server = %self.server.name, project = %self.project.path, "Project started");
        self.log.add_header(format!(
            "Backing up {}:{} into {}",
            self.runner.remote_addr(),
            self.layout.source_path,
            self.layout.snapshot_dir.display()
        ));

        if let Err(e) = tokio::fs::create_dir_all(&self.layout.snapshot_dir).await {
            let message = format!("Cannot create {}: {}", self.layout.snapshot_dir.display(), e);
            self.log.add_header(&message);
            report.error = Some(message);
            self.finish(&mut report).await;
            return report;
        }

        let log = self.log.as_ref();
        let (archive, database) = tokio::join!(self.archive_and_fetch(log), self.dump_and_fetch(log));
        report.archive = archive;
        report.database = database;

        let keep = if self.project.keep == 0 { DEFAULT_KEEP } else { self.project.keep };
        match self.retention.prune(&self.layout, keep, log).await {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => log.add_header(format!("Retention failed: {}", e)),
        }

        log.add_header(format!(
            "Finished: archive {}, database {}",
            report.archive, report.database
        ));
        self.finish(&mut report).await;
        report
    }

    async fn archive_and_fetch(&self, log: &LogBuffer) -> StepOutcome {
        let remote = &self.layout.remote_archive;

        if let Err(e) = self.runner.archive(&self.layout, &self.project.exclude, log).await {
            log.add_header(format!("Archive failed: {}", e));
            self.remove_remote(remote, log).await;
            return StepOutcome::Failed(e.to_string());
        }

        self.fetch(remote, &self.layout.local_archive, log).await
    }

    async fn dump_and_fetch(&self, log: &LogBuffer) -> StepOutcome {
        let creds = match self.credentials(log).await {
            Some(creds) => creds,
            None => return StepOutcome::Skipped("database credentials incomplete".into()),
        };

        let (remote, local) = self.layout.dump_paths(&creds.name);
        if let Err(e) = self.runner.dump_database(&self.layout, &creds, &remote, log).await {
            log.add_header(format!("Database dump failed: {}", e));
            self.remove_remote(&remote, log).await;
            return StepOutcome::Failed(e.to_string());
        }

        self.fetch(&remote, &local, log).await
    }

    /// Explicit config overlaid with the env file, if one is configured and
    /// readable. `None` means skip the dump.
    async fn credentials(&self, log: &LogBuffer) -> Option<DbCredentials> {
        let mut info = self.project.database.clone();

        if let Some(env_file) = &self.project.env_file {
            let path = self.layout.remote_file(&env_file.path);
            match self.runner.read_file(&path).await {
                Ok(content) => info = merge_env(&info, env_file, &parse_env(&content)),
                Err(e) => log.add_header(format!("Cannot read env file {}: {}", path, e)),
            }
        }

        match DbCredentials::from_info(&info) {
            Ok(creds) => Some(creds),
            Err(e) => {
                log.add_header(format!("Database backup skipped: {}", e));
                None
            }
        }
    }

    /// Pull `remote` to `local`, then remove `remote` whatever the pull did.
    async fn fetch(&self, remote: &str, local: &Path, log: &LogBuffer) -> StepOutcome {
        let outcome = match self.runner.pull(remote, local).await {
            Ok(bytes) => {
                log.add_header(format!("Fetched {} to {} ({} bytes)", remote, local.display(), bytes));
                StepOutcome::Completed
            }
            Err(e) => {
                log.add_header(format!("Fetch failed: {}", e));
                StepOutcome::Failed(e.to_string())
            }
        };

        self.remove_remote(remote, log).await;
        outcome
    }

    async fn remove_remote(&self, path: &str, log: &LogBuffer) {
        if let Err(e) = self.runner.delete_path(path).await {
            log.add_header(format!("Cannot remove remote {}: {}", path, e));
        }
    }

    /// Flush the project log, once.
    async fn finish(&self, report: &mut ProjectReport) {
        let log = Arc::clone(&self.log);
        let path = self.layout.log_file.clone();

        let flushed = tokio::task::spawn_blocking(move || log.flush(&path))
            .await
            .map_err(std::io::Error::other)
            .and_then(|result| result);

        if let Err(e) = flushed {
            tracing::error!(
                server = %self.server.name,
                project = %self.project.path,
                error = %e,
                "Cannot write project log"
            );
            report.error.get_or_insert_with(|| format!("cannot write project log: {}", e));
        }

        if report.failed() {
            tracing::warn!(server = %self.server.name, project = %self.project.path, "Project failed");
        } else {
            tracing::info!(server = %self.server.name, project = %self.project.path, "Project finished");
        }
    }
}

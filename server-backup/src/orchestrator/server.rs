//! One server: connect, fan out over projects, join, sync, disconnect.

use super::project::ProjectUnit;
use super::report::{ProjectReport, ServerReport, StepOutcome};
use crate::config::ServerConfig;
use crate::layout::RunDate;
use crate::log_buffer::LogBuffer;
use crate::remote::{Connector, RemoteCommandRunner, RemoteSession};
use crate::retention::RetentionManager;
use crate::sync::{DifferentialSync, StoreConnector};
use std::sync::Arc;
use tokio::task::JoinSet;

pub struct ServerUnit {
    pub server: Arc<ServerConfig>,
    pub connector: Arc<dyn Connector>,
    pub stores: Option<Arc<dyn StoreConnector>>,
    pub date: RunDate,
    pub verbose: bool,
    /// Shared run-level log; receives the server's start/finish/fail lines
    pub run_log: Arc<LogBuffer>,
}

impl ServerUnit {
    pub async fn run(self) -> ServerReport {
        let name = self.server.name.clone();
        let addr = self.server.address();
        let mut report = ServerReport {
            name: name.clone(),
            addr: addr.clone(),
            error: None,
            projects: Vec::new(),
            sync: None,
            sync_error: None,
        };

        self.run_log.add_header(format!(
            "Server {} ({}): connecting, {} projects",
            name,
            addr,
            self.server.projects.len()
        ));

        let session = match self.connector.connect(&self.server).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(server = %name, error = %e, "Connection failed, skipping server");
                self.run_log
                    .add_header(format!("Server {}: connection failed, skipped: {}", name, e));
                report.error = Some(e.to_string());
                return report;
            }
        };

        let sync = self.open_sync().await;
        let retention = Arc::new(RetentionManager::new(&self.server.dest_path, sync.clone()));
        let runner = RemoteCommandRunner::new(Arc::clone(&session));

        report.projects = self.run_projects(&runner, &retention).await;

        if let Some(sync) = sync {
            self.run_log.add_header(format!(
                "Server {}: syncing {} to {}",
                name,
                self.server.dest_path.display(),
                sync.bucket()
            ));
            match sync.upload_changed_or_new(&self.server.dest_path, &self.run_log).await {
                Ok(synced) => report.sync = Some(synced),
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "Sync failed");
                    self.run_log.add_header(format!("Server {}: sync failed: {}", name, e));
                    report.sync_error = Some(e.to_string());
                }
            }
        }

        close_session(session.as_ref(), &name).await;

        self.run_log.add_header(format!(
            "Server {}: finished, {} of {} projects failed",
            name,
            report.failed_projects(),
            report.projects.len()
        ));
        report
    }

    async fn run_projects(
        &self,
        runner: &RemoteCommandRunner,
        retention: &Arc<RetentionManager>,
    ) -> Vec<ProjectReport> {
        let mut units = JoinSet::new();
        for (index, project) in self.server.projects.iter().enumerate() {
            self.run_log
                .add_header(format!("Server {}: project {} started", self.server.name, project.path));
            let unit = ProjectUnit::new(
                Arc::clone(&self.server),
                project.clone(),
                self.date,
                runner.clone(),
                Arc::clone(retention),
                self.verbose,
            );
            units.spawn(async move { (index, unit.run().await) });
        }

        let mut finished = Vec::with_capacity(units.len());
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((index, project)) => {
                    self.run_log.add_header(format!(
                        "Server {}: project {} {}",
                        self.server.name,
                        project.path,
                        if project.failed() { "failed" } else { "finished" }
                    ));
                    finished.push((index, project));
                }
                Err(e) => {
                    tracing::error!(server = %self.server.name, error = %e, "Project worker panicked");
                    self.run_log
                        .add_header(format!("Server {}: project worker panicked: {}", self.server.name, e));
                }
            }
        }

        // Workers that panicked still get a row.
        finished.sort_by_key(|(index, _)| *index);
        let mut reports = Vec::with_capacity(self.server.projects.len());
        let mut done = finished.into_iter().peekable();
        for (index, project) in self.server.projects.iter().enumerate() {
            match done.next_if(|(i, _)| *i == index) {
                Some((_, report)) => reports.push(report),
                None => reports.push(ProjectReport {
                    path: project.path.clone(),
                    archive: StepOutcome::Skipped("worker panicked".into()),
                    database: StepOutcome::Skipped("worker panicked".into()),
                    pruned: 0,
                    error: Some("project worker panicked".into()),
                }),
            }
        }
        reports
    }

    async fn open_sync(&self) -> Option<Arc<DifferentialSync>> {
        let (s3, stores) = match (&self.server.s3, &self.stores) {
            (Some(s3), Some(stores)) => (s3, stores),
            _ => return None,
        };

        match stores.open(s3).await {
            Ok(store) => Some(Arc::new(DifferentialSync::new(store, s3))),
            Err(e) => {
                tracing::error!(server = %self.server.name, bucket = %s3.bucket, error = %e, "Object store unavailable");
                self.run_log.add_header(format!(
                    "Server {}: object store unavailable, cloud retention and sync disabled: {}",
                    self.server.name, e
                ));
                None
            }
        }
    }
}

async fn close_session(session: &dyn RemoteSession, name: &str) {
    if let Err(e) = session.close().await {
        tracing::warn!(server = %name, error = %e, "Closing session failed");
    }
}

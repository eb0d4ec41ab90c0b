//! Run driver.
//!
//! A run fans out over servers, each server over its projects, each project
//! over its archive and dump steps. Every level joins before its parent moves
//! on, and failures stay inside the smallest unit they hit: a refused
//! connection skips one server, a failed step fails one project. Only failing
//! to write the run log ends the run with an error.

mod project;
mod report;
mod server;

pub use report::{ProjectReport, RunReport, ServerReport, StepOutcome};

use crate::config::Config;
use crate::layout::{run_log_path, RunDate};
use crate::log_buffer::LogBuffer;
use crate::remote::Connector;
use crate::sync::StoreConnector;
use crate::utils::errors::{BackupError, Result};
use server::ServerUnit;
use std::sync::Arc;
use tokio::task::JoinSet;

pub struct Orchestrator {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    stores: Option<Arc<dyn StoreConnector>>,
    date: RunDate,
}

impl Orchestrator {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            stores: None,
            date: RunDate::today(),
        }
    }

    /// Enable cloud retention and sync for servers with an `[s3]` table.
    pub fn with_store_connector(mut self, stores: Arc<dyn StoreConnector>) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn with_date(mut self, date: RunDate) -> Self {
        self.date = date;
        self
    }

    pub async fn run(&self) -> Result<RunReport> {
        let run_log = Arc::new(LogBuffer::new("run", self.config.verbose));
        run_log.add_header(format!(
            "Backup run {} started: {} servers",
            self.date,
            self.config.servers.len()
        ));
        tracing::info!(date = %self.date, servers = self.config.servers.len(), "Backup run started");

        let mut units = JoinSet::new();
        for (index, server) in self.config.servers.iter().enumerate() {
            let unit = ServerUnit {
                server: Arc::new(server.clone()),
                connector: Arc::clone(&self.connector),
                stores: self.stores.clone(),
                date: self.date,
                verbose: self.config.verbose,
                run_log: Arc::clone(&run_log),
            };
            units.spawn(async move { (index, unit.run().await) });
        }

        let mut servers = Vec::with_capacity(units.len());
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(done) => servers.push(done),
                Err(e) => {
                    tracing::error!(error = %e, "Server worker panicked");
                    run_log.add_header(format!("Server worker panicked: {}", e));
                }
            }
        }
        servers.sort_by_key(|(index, _)| *index);

        let report = RunReport {
            date: self.date,
            servers: servers.into_iter().map(|(_, server)| server).collect(),
            log_file: run_log_path(&self.config.log_dir, self.date),
        };

        run_log.add_header(format!(
            "Backup run {} finished: {} servers unreachable, {} projects failed",
            self.date,
            report.unreachable_servers(),
            report.failed_projects()
        ));

        let path = report.log_file.clone();
        let log = Arc::clone(&run_log);
        tokio::task::spawn_blocking(move || log.flush(&path))
            .await
            .map_err(|e| BackupError::local_io(&report.log_file, std::io::Error::other(e)))?
            .map_err(|e| BackupError::local_io(&report.log_file, e))?;

        tracing::info!(
            log_file = %report.log_file.display(),
            unreachable = report.unreachable_servers(),
            failed_projects = report.failed_projects(),
            "Backup run finished"
        );
        Ok(report)
    }
}

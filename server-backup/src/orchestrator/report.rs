//! What a run did, per server and per project.

use crate::layout::RunDate;
use crate::sync::SyncReport;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// Not attempted; not a failure
    Skipped(String),
    Failed(String),
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Completed => write!(f, "completed"),
            StepOutcome::Skipped(reason) => write!(f, "skipped ({})", reason),
            StepOutcome::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectReport {
    pub path: String,
    pub archive: StepOutcome,
    pub database: StepOutcome,
    /// Local snapshots removed by retention
    pub pruned: usize,
    /// Project-level failure outside the two steps
    pub error: Option<String>,
}

impl ProjectReport {
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.archive.is_failed() || self.database.is_failed()
    }
}

#[derive(Debug, Clone)]
pub struct ServerReport {
    pub name: String,
    pub addr: String,
    /// Set when the server could not be reached; no project ran
    pub error: Option<String>,
    pub projects: Vec<ProjectReport>,
    pub sync: Option<SyncReport>,
    pub sync_error: Option<String>,
}

impl ServerReport {
    pub fn connected(&self) -> bool {
        self.error.is_none()
    }

    pub fn failed_projects(&self) -> usize {
        self.projects.iter().filter(|p| p.failed()).count()
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub date: RunDate,
    pub servers: Vec<ServerReport>,
    pub log_file: PathBuf,
}

impl RunReport {
    pub fn unreachable_servers(&self) -> usize {
        self.servers.iter().filter(|s| !s.connected()).count()
    }

    pub fn failed_projects(&self) -> usize {
        self.servers.iter().map(ServerReport::failed_projects).sum()
    }
}

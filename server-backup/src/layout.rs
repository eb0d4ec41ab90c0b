//! Run date and the paths derived from it.
//!
//! Every path embeds the run's date, so repeated runs on one day land in the
//! same snapshot directory and overwrite instead of duplicating.

use crate::config::{ProjectConfig, ServerConfig};
use chrono::{Local, NaiveDate};
use std::fmt;
use std::path::{Path, PathBuf};

/// `YYYY-MM-DD`; lexicographic order on it is chronological.
pub const SNAPSHOT_FORMAT: &str = "%Y-%m-%d";

/// Length of a snapshot directory name.
pub const SNAPSHOT_NAME_LEN: usize = 10;

/// Date captured once at the start of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunDate(NaiveDate);

impl RunDate {
    pub fn today() -> Self {
        RunDate(Local::now().date_naive())
    }

    pub fn new(date: NaiveDate) -> Self {
        RunDate(date)
    }
}

impl fmt::Display for RunDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(SNAPSHOT_FORMAT))
    }
}

/// Every remote and local path one project-unit touches.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    /// `<project_root>/<path>` on the remote host
    pub source_path: String,
    /// Parent of `source_path`; archive and dump commands run from here
    pub source_parent: String,
    /// Last component of `source_path`; archive entries are rooted at it
    pub base_name: String,
    /// File-name-safe form of the project path
    pub slug: String,
    pub remote_archive: String,
    pub local_archive: PathBuf,
    /// `<dest>/<path>`, parent of every snapshot of this project
    pub backup_root: PathBuf,
    /// Name of today's snapshot directory
    pub snapshot_name: String,
    /// `<backup_root>/<date>`
    pub snapshot_dir: PathBuf,
    pub log_file: PathBuf,
    remote_dir: String,
}

impl ProjectLayout {
    pub fn resolve(server: &ServerConfig, project: &ProjectConfig, date: RunDate) -> Self {
        let remote_dir = server.project_root.trim_end_matches('/').to_string();
        let rel = project.path.trim().trim_matches('/');
        let source_path = format!("{}/{}", remote_dir, rel);

        let (source_parent, base_name) = match source_path.rsplit_once('/') {
            Some(("", base)) => ("/".to_string(), base.to_string()),
            Some((parent, base)) => (parent.to_string(), base.to_string()),
            None => (".".to_string(), source_path.clone()),
        };

        let slug = project_slug(rel);
        let snapshot_name = date.to_string();
        let backup_root = server.dest_path.join(rel);
        let snapshot_dir = backup_root.join(&snapshot_name);

        let archive_name = format!("{}_{}.zip", snapshot_name, slug);
        let remote_archive = format!("{}/{}", remote_dir, archive_name);
        let local_archive = snapshot_dir.join(&archive_name);
        let log_file = snapshot_dir.join(format!("{}.log", snapshot_name));

        Self {
            source_path,
            source_parent,
            base_name,
            slug,
            remote_archive,
            local_archive,
            backup_root,
            snapshot_name,
            snapshot_dir,
            log_file,
            remote_dir,
        }
    }

    /// Remote and local paths of the compressed dump of `db_name`.
    ///
    /// The remote name carries only the slug, so it is unique wherever the
    /// archive name is; the local copy also names the database.
    pub fn dump_paths(&self, db_name: &str) -> (String, PathBuf) {
        let remote = format!("{}/{}_{}.sql.gz", self.remote_dir, self.snapshot_name, self.slug);
        let local = format!("{}_{}_{}.sql.gz", self.snapshot_name, self.slug, slugify(db_name));
        (remote, self.snapshot_dir.join(local))
    }

    /// Remote path of a file given relative to the project directory.
    pub fn remote_file(&self, relative: &str) -> String {
        format!("{}/{}", self.source_path, relative.trim_start_matches('/'))
    }
}

/// Run-level log file inside `log_dir`.
pub fn run_log_path(log_dir: &Path, date: RunDate) -> PathBuf {
    log_dir.join(format!("{}_run.log", date))
}

/// File-name-safe form of a project path; names the remote artifacts.
pub fn project_slug(path: &str) -> String {
    slugify(path.trim().trim_matches('/'))
}

fn slugify(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' => '-',
            c => c,
        })
        .collect()
}

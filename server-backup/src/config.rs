//! Configuration management for the backup runner.
//!
//! Loads the server/project tree from a TOML file. The tree is immutable once a
//! run starts; derived paths live in [`crate::layout`].

use crate::layout::project_slug;
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Retention count used when neither the project nor the file sets one.
pub const DEFAULT_KEEP: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of all local backups
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Directory for run-level logs (default: `<backup_dir>/logs`)
    #[serde(default)]
    pub log_dir: PathBuf,

    /// Snapshots to keep per project unless the project overrides it
    #[serde(default = "default_keep")]
    pub keep: usize,

    /// Mirror every log header line to the console
    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Display name used in logs (default: host)
    #[serde(default)]
    pub name: String,

    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub user: String,

    /// Password for password auth, also tried as the key passphrase
    #[serde(default)]
    pub password: Option<String>,

    /// Private key used for public-key auth
    #[serde(default)]
    pub private_key: Option<PathBuf>,

    /// Remote directory holding every project
    pub project_root: String,

    /// Local destination root (default: `<backup_dir>/<host>`)
    #[serde(default)]
    pub dest_path: PathBuf,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Object-store mirror of `dest_path`
    #[serde(default)]
    pub s3: Option<S3Config>,

    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,

    /// Shared-config profile providing the credentials
    #[serde(default)]
    pub profile: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible stores
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Prepended verbatim to every object key
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project directory relative to the server's `project_root`
    pub path: String,

    /// Globs relative to the project directory, left out of the archive
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Snapshots to keep (0 = use the global default)
    #[serde(default)]
    pub keep: usize,

    #[serde(default)]
    pub env_file: Option<EnvFileInfo>,

    /// Explicit credentials, overridden field by field by the env file
    #[serde(default)]
    pub database: DbInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvFileInfo {
    /// Env file path relative to the project directory
    pub path: String,

    #[serde(default = "default_host_key")]
    pub host_key: String,

    #[serde(default = "default_port_key")]
    pub port_key: String,

    #[serde(default = "default_user_key")]
    pub user_key: String,

    #[serde(default = "default_pass_key")]
    pub pass_key: String,

    #[serde(default = "default_name_key")]
    pub name_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbInfo {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

// Default values
fn default_backup_dir() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_keep() -> usize {
    DEFAULT_KEEP
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_host_key() -> String {
    "DB_HOST".to_string()
}

fn default_port_key() -> String {
    "DB_PORT".to_string()
}

fn default_user_key() -> String {
    "DB_USERNAME".to_string()
}

fn default_pass_key() -> String {
    "DB_PASSWORD".to_string()
}

fn default_name_key() -> String {
    "DB_DATABASE".to_string()
}

impl Config {
    /// Load, normalize and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| BackupError::local_io(path, e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fill defaults that depend on other fields.
    fn normalize(&mut self) {
        if self.keep == 0 {
            self.keep = DEFAULT_KEEP;
        }
        if self.log_dir.as_os_str().is_empty() {
            self.log_dir = self.backup_dir.join("logs");
        }
        for server in &mut self.servers {
            if server.name.is_empty() {
                server.name = server.host.clone();
            }
            if server.dest_path.as_os_str().is_empty() {
                server.dest_path = self.backup_dir.join(&server.host);
            }
            for project in &mut server.projects {
                if project.keep == 0 {
                    project.keep = self.keep;
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(BackupError::Config("no servers configured".into()));
        }

        // dest_path -> server, and (host, project_root, slug) -> project
        let mut destinations: HashMap<&Path, &str> = HashMap::new();
        let mut artifacts: HashMap<(&str, &str, String), &str> = HashMap::new();

        for server in &self.servers {
            if server.host.trim().is_empty() {
                return Err(BackupError::Config(format!(
                    "server '{}' has an empty host",
                    server.name
                )));
            }
            if server.project_root.trim().is_empty() {
                return Err(BackupError::Config(format!(
                    "server '{}' has an empty project_root",
                    server.name
                )));
            }
            if server.private_key.is_none() && server.password.is_none() {
                return Err(BackupError::Config(format!(
                    "server '{}' needs a private_key or a password",
                    server.name
                )));
            }
            if let Some(s3) = &server.s3 {
                if s3.bucket.trim().is_empty() {
                    return Err(BackupError::Config(format!(
                        "server '{}' has an empty s3 bucket",
                        server.name
                    )));
                }
            }
            if let Some(other) = destinations.insert(&server.dest_path, &server.name) {
                return Err(BackupError::Config(format!(
                    "servers '{}' and '{}' share dest_path {}, set dest_path on one of them",
                    other,
                    server.name,
                    server.dest_path.display()
                )));
            }

            let host = server.host.trim();
            let root = server.project_root.trim().trim_end_matches('/');
            let mut seen = HashSet::new();
            for project in &server.projects {
                let path = project.path.trim().trim_matches('/');
                if path.is_empty() {
                    return Err(BackupError::Config(format!(
                        "server '{}' has a project with an empty path",
                        server.name
                    )));
                }
                if !seen.insert(path) {
                    return Err(BackupError::Config(format!(
                        "server '{}' lists project '{}' twice",
                        server.name, path
                    )));
                }
                if let Some(other) = artifacts.insert((host, root, project_slug(path)), path) {
                    return Err(BackupError::Config(format!(
                        "projects '{}' and '{}' under {}:{} would share remote archive names",
                        other, path, host, root
                    )));
                }
            }
        }

        Ok(())
    }
}

impl ServerConfig {
    /// `host:port`, used to tag errors
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Commented starting point written by `init-config`.
pub const SAMPLE_CONFIG: &str = r#"# Local root for every server's backups
backup_dir = "./backups"

# Snapshots kept per project unless a project sets its own `keep`
keep = 3

# Mirror every log line to the console
verbose = false

[log]
level = "info"

[[servers]]
name = "web-1"
host = "192.168.0.100"
port = 22
user = "deploy"
# password doubles as the private key passphrase
password = "change-me"
private_key = "/home/user/.ssh/id_rsa"
project_root = "/var/www/php80"
# dest_path = "./backups/192.168.0.100"

# Remove this table to keep backups local only
[servers.s3]
bucket = "server-backups"
profile = "backup-uploader"
# region = "eu-central-1"
# endpoint = "http://127.0.0.1:9000"
prefix = "web-1/"

[[servers.projects]]
path = "order-online"
exclude = ["api/vendor/*", "api/storage/framework/*", "api/storage/logs/*", "www/vendor/*"]
keep = 3

[servers.projects.env_file]
path = "api/.env"
host_key = "DB_HOST"
port_key = "DB_PORT"
user_key = "DB_USERNAME"
pass_key = "DB_PASSWORD"
name_key = "DB_DATABASE"

[[servers.projects]]
path = "buy-sell"
exclude = ["vendor/*", "storage/logs/*"]
keep = 2

[servers.projects.database]
host = "127.0.0.1"
port = 3306
user = "buysell"
pass = "secret"
name = "buysell"
"#;

/// Write the sample configuration, refusing to overwrite unless `force`.
pub fn write_sample(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(BackupError::Config(format!(
            "{} already exists, pass --force to overwrite",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| BackupError::local_io(parent, e))?;
    }
    std::fs::write(path, SAMPLE_CONFIG).map_err(|e| BackupError::local_io(path, e))?;
    Ok(())
}

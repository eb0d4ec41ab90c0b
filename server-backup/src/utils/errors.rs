//! Error types for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication or network failure while reaching a server.
    #[error("Connection to {addr} failed: {message}")]
    Connection { addr: String, message: String },

    /// Remote command could not be started, streamed, or exited non-zero.
    #[error("Command on {addr} failed ({command}): {message}")]
    Command {
        addr: String,
        command: String,
        message: String,
    },

    #[error("Transfer of {addr}:{path} failed: {message}")]
    Transfer {
        addr: String,
        path: String,
        message: String,
    },

    #[error("I/O error on {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Missing database fields; callers treat this as a skip, not a failure.
    #[error("Database credentials incomplete, missing: {}", missing.join(", "))]
    CredentialsIncomplete { missing: Vec<&'static str> },

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Object store error: {0}")]
    Store(String),
}

impl BackupError {
    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::LocalIo {
            path: path.into(),
            source,
        }
    }

    pub fn command(addr: &str, command: &str, message: impl std::fmt::Display) -> Self {
        BackupError::Command {
            addr: addr.to_string(),
            command: command.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

//! Server Backup Library
//!
//! Pulls dated project archives and database dumps from remote servers over
//! SSH, prunes old snapshots and mirrors the local tree to an object store.

pub mod config;
pub mod credentials;
pub mod fs;
pub mod layout;
pub mod log_buffer;
pub mod orchestrator;
pub mod remote;
pub mod retention;
pub mod sync;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use orchestrator::{Orchestrator, RunReport};
pub use utils::errors::{BackupError, Result};

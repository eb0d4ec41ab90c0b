//! Remote command execution.
//!
//! The engine talks to servers only through [`Connector`], [`RemoteSession`]
//! and [`CommandHandle`]; [`ssh`] provides the libssh2-backed implementation.

pub mod runner;
pub mod ssh;
pub mod task;

pub use runner::RemoteCommandRunner;
pub use task::{LiveCommand, Task};

use crate::config::ServerConfig;
use crate::utils::errors::Result;
use async_trait::async_trait;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Combined stdout/stderr of a running command.
pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// Result of a buffered command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub output: Vec<u8>,
    pub exit_status: i32,
}

/// Opens one session per server-unit.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &ServerConfig) -> Result<Arc<dyn RemoteSession>>;
}

/// An authenticated session with one remote host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// `host:port`, used to tag errors.
    fn remote_addr(&self) -> &str;

    /// Run `command` to completion, buffering its combined output.
    async fn run(&self, command: &str) -> Result<CommandOutput>;

    /// Prepare `command` for streaming execution; nothing runs until
    /// [`CommandHandle::start`].
    async fn open_command(&self, command: &str) -> Result<Box<dyn CommandHandle>>;

    /// Copy a remote file to `local_path`, returning the bytes written.
    async fn pull(&self, remote_path: &str, local_path: &Path) -> Result<u64>;

    /// Tear the session down. Called once, after every project has joined.
    async fn close(&self) -> Result<()>;
}

/// A command opened for live execution.
///
/// Callers go through `start`, drain the output, `wait`, then `close`, and
/// call `close` on every path.
#[async_trait]
pub trait CommandHandle: Send {
    async fn start(&mut self) -> Result<()>;

    /// Output stream; available once after `start`.
    fn take_output(&mut self) -> Option<OutputStream>;

    /// Block until the command exits and return its exit status.
    async fn wait(&mut self) -> Result<i32>;

    async fn close(&mut self);
}

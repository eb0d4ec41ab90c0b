//! A single remote shell command and its two execution modes.

use super::{CommandHandle, OutputStream, RemoteSession};
use crate::log_buffer::LogBuffer;
use crate::utils::errors::{BackupError, Result};

/// How much trailing output a failed buffered command keeps in its error.
const ERROR_TAIL_BYTES: usize = 512;

/// One command, executed once. Never reused for a second command.
#[derive(Debug)]
pub struct Task {
    command: String,
    display: String,
    succeeded: bool,
    error: Option<String>,
}

impl Task {
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            display: command.clone(),
            command,
            succeeded: false,
            error: None,
        }
    }

    /// Hide `secret` wherever the command is logged or reported.
    pub fn redact(mut self, secret: &str) -> Self {
        if !secret.is_empty() {
            self.display = self.display.replace(secret, "****");
        }
        self
    }

    /// Command as it may appear in logs.
    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Run to completion and return the combined output.
    ///
    /// A non-zero exit status is a `Command` error carrying the tail of the
    /// output.
    pub async fn execute(&mut self, session: &dyn RemoteSession) -> Result<Vec<u8>> {
        tracing::debug!(addr = %session.remote_addr(), command = %self.display, "Executing");

        let result = match session.run(&self.command).await {
            Ok(out) if out.exit_status == 0 => Ok(out.output),
            Ok(out) => Err(BackupError::command(
                session.remote_addr(),
                &self.display,
                format!("exit status {}: {}", out.exit_status, output_tail(&out.output)),
            )),
            Err(e) => Err(self.retag(e)),
        };
        self.record(result)
    }

    /// Open the command for streaming. Nothing runs until
    /// [`LiveCommand::start`].
    pub async fn execute_live(&mut self, session: &dyn RemoteSession) -> Result<LiveCommand> {
        tracing::debug!(addr = %session.remote_addr(), command = %self.display, "Opening live command");

        match session.open_command(&self.command).await {
            Ok(handle) => Ok(LiveCommand {
                handle,
                addr: session.remote_addr().to_string(),
                display: self.display.clone(),
            }),
            Err(e) => {
                let e = self.retag(e);
                self.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Full live protocol: start, stream every output line into `log` while
    /// the command runs, wait, then close on every path.
    pub async fn run_live(&mut self, session: &dyn RemoteSession, log: &LogBuffer) -> Result<()> {
        let mut live = self.execute_live(session).await?;
        let result = live.stream_into(log).await;
        live.close().await;
        self.record(result)
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {
                self.succeeded = true;
                self.error = None;
            }
            Err(e) => {
                self.succeeded = false;
                self.error = Some(e.to_string());
            }
        }
        result
    }

    /// Sessions do not know the redacted form; swap it in.
    fn retag(&self, err: BackupError) -> BackupError {
        match err {
            BackupError::Command { addr, message, .. } => BackupError::Command {
                addr,
                command: self.display.clone(),
                message,
            },
            other => other,
        }
    }
}

/// A command opened with [`Task::execute_live`].
pub struct LiveCommand {
    handle: Box<dyn CommandHandle>,
    addr: String,
    display: String,
}

impl LiveCommand {
    pub async fn start(&mut self) -> Result<()> {
        self.handle.start().await.map_err(|e| self.retag(e))
    }

    pub fn output(&mut self) -> Option<OutputStream> {
        self.handle.take_output()
    }

    /// Wait for exit; a non-zero status is a `Command` error.
    pub async fn wait(&mut self) -> Result<()> {
        match self.handle.wait().await {
            Ok(0) => Ok(()),
            Ok(status) => Err(BackupError::command(
                &self.addr,
                &self.display,
                format!("exit status {}", status),
            )),
            Err(e) => Err(self.retag(e)),
        }
    }

    pub async fn close(&mut self) {
        self.handle.close().await;
    }

    /// start, drain into `log`, wait. Does not close.
    pub async fn stream_into(&mut self, log: &LogBuffer) -> Result<()> {
        self.start().await?;

        if let Some(output) = self.output() {
            if let Err(e) = log.read_stream(output).await {
                // Keep waiting so the exit status is still collected.
                log.add_header(format!("Output stream failed: {}", e));
                self.wait().await?;
                return Err(BackupError::command(&self.addr, &self.display, e));
            }
        }

        self.wait().await
    }

    fn retag(&self, err: BackupError) -> BackupError {
        match err {
            BackupError::Command { addr, message, .. } => BackupError::Command {
                addr,
                command: self.display.clone(),
                message,
            },
            other => other,
        }
    }
}

fn output_tail(output: &[u8]) -> String {
    let start = output.len().saturating_sub(ERROR_TAIL_BYTES);
    String::from_utf8_lossy(&output[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;

    #[tokio::test]
    async fn test_execute_success_and_failure() {
        let session = FakeSession::new("10.0.0.1:22")
            .on("cat /srv/app/.env", 0, "DB_HOST=db\n")
            .on("cat /missing", 1, "cat: /missing: No such file or directory");

        let mut ok = Task::new("cat /srv/app/.env");
        let output = ok.execute(&session).await.unwrap();
        assert_eq!(output, b"DB_HOST=db\n");
        assert!(ok.succeeded());

        let mut failed = Task::new("cat /missing");
        let err = failed.execute(&session).await.unwrap_err();
        assert!(!failed.succeeded());
        match err {
            BackupError::Command { addr, command, message } => {
                assert_eq!(addr, "10.0.0.1:22");
                assert_eq!(command, "cat /missing");
                assert!(message.contains("No such file"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(failed.error().unwrap().contains("exit status 1"));
    }

    #[tokio::test]
    async fn test_run_live_streams_into_log_and_closes() {
        let session = FakeSession::new("10.0.0.1:22").on("zip", 0, "  adding: app/a\n  adding: app/b\n");
        let log = LogBuffer::new("test", false);

        let mut task = Task::new("cd /srv && zip -r9 /srv/out.zip app");
        task.run_live(&session, &log).await.unwrap();

        assert!(task.succeeded());
        assert_eq!(log.contents().lines().count(), 2);
        assert_eq!(session.closed_commands(), 1);
    }

    #[tokio::test]
    async fn test_run_live_failure_still_closes_and_redacts() {
        let session = FakeSession::new("10.0.0.1:22").on("mysqldump", 2, "mysqldump: Access denied\n");
        let log = LogBuffer::new("test", false);

        let mut task = Task::new("mysqldump --password='hunter2' shop").redact("hunter2");
        let err = task.run_live(&session, &log).await.unwrap_err();

        assert_eq!(session.closed_commands(), 1);
        assert!(log.contents().contains("Access denied"));
        let message = err.to_string();
        assert!(message.contains("exit status 2"));
        assert!(!message.contains("hunter2"));
        assert!(message.contains("****"));
    }
}

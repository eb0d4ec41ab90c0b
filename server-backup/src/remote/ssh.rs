//! libssh2-backed sessions.
//!
//! libssh2 serializes all channel I/O of one session behind a single lock, so
//! only short buffered commands share the server-unit's control session. Each
//! live command and each file pull dials its own connection.

use super::{CommandHandle, CommandOutput, Connector, OutputStream, RemoteSession};
use crate::config::ServerConfig;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use ssh2::{ExtendedData, Session};
use std::fs::File;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;

const READ_CHUNK: usize = 32 * 1024;
const OUTPUT_CHANNEL_DEPTH: usize = 64;

/// Connection coordinates for one server.
#[derive(Debug, Clone)]
struct SshTarget {
    addr: String,
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    private_key: Option<PathBuf>,
    timeout: Duration,
}

impl SshTarget {
    fn from_config(server: &ServerConfig) -> Self {
        Self {
            addr: server.address(),
            host: server.host.clone(),
            port: server.port,
            user: server.user.clone(),
            password: server.password.clone(),
            private_key: server.private_key.clone(),
            timeout: Duration::from_secs(server.connect_timeout_secs.max(1)),
        }
    }

    fn connection_error(&self, message: impl std::fmt::Display) -> BackupError {
        BackupError::Connection {
            addr: self.addr.clone(),
            message: message.to_string(),
        }
    }

    /// Open and authenticate a new session. Blocking.
    fn dial(&self) -> Result<Session> {
        let socket = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| self.connection_error(e))?
            .next()
            .ok_or_else(|| self.connection_error("host did not resolve"))?;

        let tcp = TcpStream::connect_timeout(&socket, self.timeout)
            .map_err(|e| self.connection_error(e))?;

        let mut sess = Session::new().map_err(|e| self.connection_error(e))?;
        sess.set_tcp_stream(tcp);
        sess.handshake().map_err(|e| self.connection_error(e))?;

        self.authenticate(&sess)?;
        Ok(sess)
    }

    /// Key without passphrase, key with the password as passphrase, then
    /// plain password.
    fn authenticate(&self, sess: &Session) -> Result<()> {
        if let Some(key) = &self.private_key {
            if let Err(e) = sess.userauth_pubkey_file(&self.user, None, key, None) {
                tracing::debug!(addr = %self.addr, error = %e, "Key auth without passphrase failed");
                if let Some(pass) = &self.password {
                    if let Err(e) = sess.userauth_pubkey_file(&self.user, None, key, Some(pass)) {
                        tracing::debug!(addr = %self.addr, error = %e, "Key auth with passphrase failed");
                    }
                }
            }
        }

        if !sess.authenticated() {
            if let Some(pass) = &self.password {
                if let Err(e) = sess.userauth_password(&self.user, pass) {
                    tracing::debug!(addr = %self.addr, error = %e, "Password auth failed");
                }
            }
        }

        if !sess.authenticated() {
            return Err(self.connection_error(format!(
                "authentication failed for user {}",
                self.user
            )));
        }
        Ok(())
    }
}

/// Dials servers over SSH.
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, server: &ServerConfig) -> Result<Arc<dyn RemoteSession>> {
        let target = SshTarget::from_config(server);
        tracing::info!(addr = %target.addr, user = %target.user, "Connecting");

        let control = tokio::task::spawn_blocking({
            let target = target.clone();
            move || target.dial()
        })
        .await
        .map_err(|e| target.connection_error(e))??;

        Ok(Arc::new(SshSession {
            target,
            control: Arc::new(Mutex::new(Some(control))),
        }))
    }
}

pub struct SshSession {
    target: SshTarget,
    control: Arc<Mutex<Option<Session>>>,
}

fn exec_buffered(sess: &Session, addr: &str, command: &str) -> Result<CommandOutput> {
    let err = |e: &dyn std::fmt::Display| BackupError::command(addr, "exec", e);

    let mut channel = sess.channel_session().map_err(|e| err(&e))?;
    channel
        .handle_extended_data(ExtendedData::Merge)
        .map_err(|e| err(&e))?;
    channel.exec(command).map_err(|e| err(&e))?;

    let mut output = Vec::new();
    channel.read_to_end(&mut output).map_err(|e| err(&e))?;
    channel.wait_close().map_err(|e| err(&e))?;
    let exit_status = channel.exit_status().map_err(|e| err(&e))?;

    Ok(CommandOutput {
        output,
        exit_status,
    })
}

#[async_trait]
impl RemoteSession for SshSession {
    fn remote_addr(&self) -> &str {
        &self.target.addr
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let control = Arc::clone(&self.control);
        let addr = self.target.addr.clone();
        let command = command.to_string();

        tokio::task::spawn_blocking(move || {
            let guard = control.lock().unwrap_or_else(PoisonError::into_inner);
            let sess = guard
                .as_ref()
                .ok_or_else(|| BackupError::command(&addr, "exec", "session closed"))?;
            exec_buffered(sess, &addr, &command)
        })
        .await
        .map_err(|e| BackupError::command(&self.target.addr, "exec", e))?
    }

    async fn open_command(&self, command: &str) -> Result<Box<dyn CommandHandle>> {
        Ok(Box::new(SshCommand {
            target: self.target.clone(),
            command: command.to_string(),
            output: None,
            reader: None,
        }))
    }

    async fn pull(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let target = self.target.clone();
        let remote = remote_path.to_string();
        let local = local_path.to_path_buf();

        tokio::task::spawn_blocking(move || scp_pull(&target, &remote, &local))
            .await
            .map_err(|e| BackupError::Transfer {
                addr: self.target.addr.clone(),
                path: remote_path.to_string(),
                message: e.to_string(),
            })?
    }

    async fn close(&self) -> Result<()> {
        let control = Arc::clone(&self.control);
        let addr = self.target.addr.clone();

        tokio::task::spawn_blocking(move || {
            let taken = control.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(sess) = taken {
                if let Err(e) = sess.disconnect(None, "backup finished", None) {
                    tracing::debug!(addr = %addr, error = %e, "Disconnect failed");
                }
            }
        })
        .await
        .map_err(|e| self.target.connection_error(e))?;

        tracing::info!(addr = %self.target.addr, "Disconnected");
        Ok(())
    }
}

fn scp_pull(target: &SshTarget, remote: &str, local: &Path) -> Result<u64> {
    let transfer_error = |message: String| BackupError::Transfer {
        addr: target.addr.clone(),
        path: remote.to_string(),
        message,
    };

    let sess = target.dial()?;
    let (mut channel, stat) = sess
        .scp_recv(Path::new(remote))
        .map_err(|e| transfer_error(e.to_string()))?;

    let mut file = File::create(local).map_err(|e| BackupError::local_io(local, e))?;
    let copied = std::io::copy(&mut channel, &mut file);

    let _ = channel.send_eof();
    let _ = channel.wait_eof();
    let _ = channel.close();
    let _ = channel.wait_close();
    let _ = sess.disconnect(None, "transfer finished", None);

    let file = settle_download(copied, stat.size(), file, local).map_err(transfer_error)?;
    file.sync_all().map_err(|e| BackupError::local_io(local, e))?;
    Ok(stat.size())
}

/// Check a finished copy against the advertised size. A failed or short copy
/// removes the partial file.
fn settle_download(
    copied: std::io::Result<u64>,
    expected: u64,
    file: File,
    local: &Path,
) -> std::result::Result<File, String> {
    let message = match copied {
        Ok(n) if n == expected => return Ok(file),
        Ok(n) => format!("short transfer: {} of {} bytes", n, expected),
        Err(e) => e.to_string(),
    };

    drop(file);
    if let Err(e) = std::fs::remove_file(local) {
        tracing::warn!(path = %local.display(), error = %e, "Cannot remove partial download");
    }
    Err(message)
}

/// A live command on its own connection.
///
/// `start` execs the command and spawns a blocking reader that forwards output
/// chunks over a channel until EOF, then collects the exit status.
struct SshCommand {
    target: SshTarget,
    command: String,
    output: Option<OutputStream>,
    reader: Option<JoinHandle<Result<i32>>>,
}

#[async_trait]
impl CommandHandle for SshCommand {
    async fn start(&mut self) -> Result<()> {
        let target = self.target.clone();
        let command = self.command.clone();

        let (sess, channel) = tokio::task::spawn_blocking(move || {
            let sess = target.dial()?;
            let err = |e: ssh2::Error| BackupError::command(&target.addr, "exec", e);
            let mut channel = sess.channel_session().map_err(err)?;
            channel.handle_extended_data(ExtendedData::Merge).map_err(err)?;
            channel.exec(&command).map_err(err)?;
            Ok::<_, BackupError>((sess, channel))
        })
        .await
        .map_err(|e| BackupError::command(&self.target.addr, "exec", e))??;

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(OUTPUT_CHANNEL_DEPTH);
        let addr = self.target.addr.clone();

        self.reader = Some(tokio::task::spawn_blocking(move || {
            let mut channel = channel;
            let mut buf = vec![0u8; READ_CHUNK];
            let mut forwarding = true;

            loop {
                match channel.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if forwarding && tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                            // Reader went away; keep draining so the command can finish.
                            forwarding = false;
                        }
                    }
                    Err(e) => {
                        let message = e.to_string();
                        let _ = tx.blocking_send(Err(e));
                        return Err(BackupError::command(&addr, "exec", message));
                    }
                }
            }
            drop(tx);

            channel
                .wait_close()
                .map_err(|e| BackupError::command(&addr, "exec", e))?;
            let status = channel
                .exit_status()
                .map_err(|e| BackupError::command(&addr, "exec", e))?;
            let _ = sess.disconnect(None, "command finished", None);
            Ok(status)
        }));

        let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        let output: OutputStream = Box::pin(StreamReader::new(chunks));
        self.output = Some(output);
        Ok(())
    }

    fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<i32> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| BackupError::command(&self.target.addr, "exec", "command not started"))?;
        reader
            .await
            .map_err(|e| BackupError::command(&self.target.addr, "exec", e))?
    }

    async fn close(&mut self) {
        // Dropping the stream lets a still-running reader drain without forwarding.
        self.output = None;
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                tracing::warn!(addr = %self.target.addr, error = %e, "Command reader panicked");
            }
        }
    }
}

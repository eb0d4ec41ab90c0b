//! Scripted sessions and an in-memory store for unit tests.

use crate::config::{S3Config, ServerConfig};
use crate::remote::{CommandHandle, CommandOutput, Connector, OutputStream, RemoteSession};
use crate::sync::{ObjectEntry, RemoteStore, StoreConnector};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;

struct Rule {
    contains: String,
    status: i32,
    output: Vec<u8>,
}

/// A session that answers commands from a script. The first rule whose
/// pattern occurs in the command wins; anything else exits 0 silently.
pub struct FakeSession {
    addr: String,
    rules: Vec<Rule>,
    failing_pulls: Vec<String>,
    commands: Mutex<Vec<String>>,
    pulls: Mutex<Vec<String>>,
    closed_commands: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl FakeSession {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            rules: Vec::new(),
            failing_pulls: Vec::new(),
            commands: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
            closed_commands: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn on(mut self, contains: &str, status: i32, output: &str) -> Self {
        self.rules.push(Rule {
            contains: contains.to_string(),
            status,
            output: output.as_bytes().to_vec(),
        });
        self
    }

    pub fn fail_pull(mut self, contains: &str) -> Self {
        self.failing_pulls.push(contains.to_string());
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.pulls.lock().unwrap().clone()
    }

    pub fn closed_commands(&self) -> usize {
        self.closed_commands.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn answer(&self, command: &str) -> (i32, Vec<u8>) {
        self.commands.lock().unwrap().push(command.to_string());
        self.rules
            .iter()
            .find(|rule| command.contains(&rule.contains))
            .map(|rule| (rule.status, rule.output.clone()))
            .unwrap_or((0, Vec::new()))
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn remote_addr(&self) -> &str {
        &self.addr
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let (exit_status, output) = self.answer(command);
        Ok(CommandOutput {
            output,
            exit_status,
        })
    }

    async fn open_command(&self, command: &str) -> Result<Box<dyn CommandHandle>> {
        let (status, output) = self.answer(command);
        Ok(Box::new(FakeCommand {
            output: Some(output),
            stream: None,
            status,
            closed: Arc::clone(&self.closed_commands),
        }))
    }

    async fn pull(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        self.pulls.lock().unwrap().push(remote_path.to_string());
        if self.failing_pulls.iter().any(|p| remote_path.contains(p.as_str())) {
            return Err(BackupError::Transfer {
                addr: self.addr.clone(),
                path: remote_path.to_string(),
                message: "no such file".into(),
            });
        }
        let payload = format!("contents of {}", remote_path);
        std::fs::write(local_path, &payload).map_err(|e| BackupError::local_io(local_path, e))?;
        Ok(payload.len() as u64)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeCommand {
    output: Option<Vec<u8>>,
    stream: Option<OutputStream>,
    status: i32,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandHandle for FakeCommand {
    async fn start(&mut self) -> Result<()> {
        if let Some(output) = self.output.take() {
            let stream: OutputStream = Box::pin(Cursor::new(output));
            self.stream = Some(stream);
        }
        Ok(())
    }

    fn take_output(&mut self) -> Option<OutputStream> {
        self.stream.take()
    }

    async fn wait(&mut self) -> Result<i32> {
        Ok(self.status)
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out scripted sessions by host. Hosts without one are refused.
#[derive(Default)]
pub struct FakeConnector {
    sessions: HashMap<String, Arc<FakeSession>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, host: &str, session: FakeSession) -> Self {
        self.sessions.insert(host.to_string(), Arc::new(session));
        self
    }

    pub fn session(&self, host: &str) -> Arc<FakeSession> {
        Arc::clone(&self.sessions[host])
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, server: &ServerConfig) -> Result<Arc<dyn RemoteSession>> {
        match self.sessions.get(&server.host) {
            Some(session) => Ok(Arc::clone(session) as Arc<dyn RemoteSession>),
            None => Err(BackupError::Connection {
                addr: server.address(),
                message: "connection refused".into(),
            }),
        }
    }
}

/// One in-memory bucket.
pub struct MemoryStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failing_puts: Vec<String>,
    fail_list: bool,
    puts: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            failing_puts: Vec::new(),
            fail_list: false,
            puts: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_put(mut self, contains: &str) -> Self {
        self.failing_puts.push(contains.to_string());
        self
    }

    pub fn fail_list(mut self) -> Self {
        self.fail_list = true;
        self
    }

    pub fn insert(&self, key: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), data);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn check_bucket(&self, bucket: &str) -> Result<()> {
        if bucket == self.bucket {
            Ok(())
        } else {
            Err(BackupError::Store(format!("no such bucket {}", bucket)))
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(bucket == self.bucket)
    }

    async fn list(&self, bucket: &str) -> Result<Vec<ObjectEntry>> {
        self.check_bucket(bucket)?;
        if self.fail_list {
            return Err(BackupError::Store("listing refused".into()));
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(key, data)| ObjectEntry {
                key: key.clone(),
                size: data.len() as i64,
            })
            .collect())
    }

    async fn put(&self, bucket: &str, key: &str, mut file: tokio::fs::File) -> Result<()> {
        self.check_bucket(bucket)?;
        if self.failing_puts.iter().any(|p| key.contains(p.as_str())) {
            return Err(BackupError::Store(format!("put of {} refused", key)));
        }
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| BackupError::Store(e.to_string()))?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.insert(key, data);
        Ok(())
    }

    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<()> {
        self.check_bucket(bucket)?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }
}

/// Serves the same store for every server.
pub struct MemoryConnector {
    pub store: Arc<MemoryStore>,
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn open(&self, config: &S3Config) -> Result<Arc<dyn RemoteStore>> {
        self.store.check_bucket(&config.bucket)?;
        Ok(Arc::clone(&self.store) as Arc<dyn RemoteStore>)
    }
}

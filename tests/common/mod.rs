//! Scripted in-memory transport shared by the integration tests
//!
//! Every endpoint behaves like a tiny shell over an in-memory file system.
//! The transport counts opens, closes and live connections per host so tests
//! can assert on connection reuse and cleanup.
//!
//! Two commands misbehave on purpose: `disconnect` loses the connection
//! mid-command, and `kill -9 $$` ends without an exit status.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use ssh_fleet::{
    AcquireMode, CommandOutput, ConnectOptions, Connection, Endpoint, FleetError, HostKeyPolicy,
    PoolConfig, Result, SessionPool, Transport,
};

#[derive(Default)]
struct Inner {
    live: HashMap<String, usize>,
    max_live: HashMap<String, usize>,
    running: HashMap<String, usize>,
    max_running: HashMap<String, usize>,
    opens: HashMap<String, usize>,
    connect_attempts: HashMap<String, usize>,
    closes: usize,
    commands: Vec<(String, String)>,
    files: HashMap<(String, String), Vec<u8>>,
    unreachable: HashSet<String>,
    failing_opens: HashMap<String, usize>,
    flaky_puts: usize,
    connect_delay: Duration,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Refuse every connection to `host`
    pub fn unreachable(&self, host: &str) -> &Self {
        self.lock().unreachable.insert(host.to_string());
        self
    }

    /// Fail the next `count` connection attempts to `host`
    pub fn fail_opens(&self, host: &str, count: usize) -> &Self {
        self.lock().failing_opens.insert(host.to_string(), count);
        self
    }

    /// Fail the next `count` uploads with a connection reset
    pub fn flaky_puts(&self, count: usize) -> &Self {
        self.lock().flaky_puts = count;
        self
    }

    pub fn connect_delay(&self, delay: Duration) -> &Self {
        self.lock().connect_delay = delay;
        self
    }

    pub fn put_file(&self, host: &str, path: &str, content: &str) {
        self.lock()
            .files
            .insert((host.to_string(), path.to_string()), content.as_bytes().to_vec());
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        self.lock()
            .files
            .get(&(host.to_string(), path.to_string()))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Connection attempts to `host`, successful or not
    pub fn connect_attempts(&self, host: &str) -> usize {
        self.lock().connect_attempts.get(host).copied().unwrap_or(0)
    }

    pub fn opens(&self, host: &str) -> usize {
        self.lock().opens.get(host).copied().unwrap_or(0)
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    pub fn live(&self, host: &str) -> usize {
        self.lock().live.get(host).copied().unwrap_or(0)
    }

    pub fn total_live(&self) -> usize {
        self.lock().live.values().sum()
    }

    /// Highest number of simultaneously live connections seen for `host`
    pub fn max_live(&self, host: &str) -> usize {
        self.lock().max_live.get(host).copied().unwrap_or(0)
    }

    /// Highest number of simultaneously running commands seen for `host`
    pub fn max_running(&self, host: &str) -> usize {
        self.lock().max_running.get(host).copied().unwrap_or(0)
    }

    pub fn commands(&self, host: &str) -> Vec<String> {
        self.lock()
            .commands
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        endpoint: &Endpoint,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>> {
        let host = endpoint.host.clone();
        let delay = {
            let mut inner = self.lock();
            *inner.connect_attempts.entry(host.clone()).or_default() += 1;
            inner.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if inner.unreachable.contains(&host) {
            return Err(FleetError::connect(format!(
                "Failed to connect to {}: Connection refused",
                endpoint.address()
            )));
        }
        if let Some(remaining) = inner.failing_opens.get_mut(&host) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FleetError::connect("Connection reset by peer"));
            }
        }

        *inner.opens.entry(host.clone()).or_default() += 1;
        let live = inner.live.entry(host.clone()).or_default();
        *live += 1;
        let live = *live;
        let max = inner.max_live.entry(host.clone()).or_default();
        *max = (*max).max(live);

        Ok(Box::new(MockConnection {
            host,
            transport: self.clone(),
            closed: false,
        }))
    }
}

pub struct MockConnection {
    host: String,
    transport: MockTransport,
    closed: bool,
}

impl MockConnection {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some(live) = self.transport.lock().live.get_mut(&self.host) {
                *live -= 1;
            }
        }
    }

    /// Interpret one command line against the in-memory file system
    fn respond(&self, command: &str) -> CommandOutput {
        let mut inner = self.transport.lock();

        if command == "false" {
            return output("", "", 1);
        }
        if let Some(text) = command.strip_prefix("echo ") {
            return output(&format!("{}\n", text), "", 0);
        }
        if command.starts_with("ls") {
            return output("total 0\n", "", 0);
        }
        if let Some(path) = command.strip_prefix("chmod +x ") {
            let key = (self.host.clone(), unquote(path));
            return if inner.files.contains_key(&key) {
                output("", "", 0)
            } else {
                output("", "chmod: No such file or directory\n", 1)
            };
        }
        if let Some(path) = command.strip_prefix("rm -f ") {
            inner.files.remove(&(self.host.clone(), unquote(path)));
            return output("", "", 0);
        }

        // Anything else is treated as a script path
        let key = (self.host.clone(), unquote(command));
        match inner.files.get(&key) {
            Some(script) => run_script(&String::from_utf8_lossy(script)),
            None => output("", &format!("{}: command not found\n", command), 127),
        }
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        {
            let mut inner = self.transport.lock();
            inner
                .commands
                .push((self.host.clone(), command.to_string()));
            let running = inner.running.entry(self.host.clone()).or_default();
            *running += 1;
            let running = *running;
            let max = inner.max_running.entry(self.host.clone()).or_default();
            *max = (*max).max(running);
        }

        if let Some(secs) = command.strip_prefix("sleep ") {
            let secs: u64 = secs.trim().parse().unwrap_or(1);
            tokio::time::sleep(Duration::from_secs(secs)).await;
        } else {
            // Let other tasks interleave
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let result = match command {
            "disconnect" => {
                self.release();
                Err(FleetError::connect("channel closed before command completed"))
            }
            "kill -9 $$" => Ok(CommandOutput {
                stdout: String::new(),
                stderr: "killed by signal KILL\n".to_string(),
                exit_code: None,
            }),
            _ => Ok(self.respond(command)),
        };
        if let Some(running) = self.transport.lock().running.get_mut(&self.host) {
            *running -= 1;
        }
        result
    }

    async fn put(
        &mut self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        remote_path: &str,
    ) -> Result<u64> {
        {
            let mut inner = self.transport.lock();
            if inner.flaky_puts > 0 {
                inner.flaky_puts -= 1;
                return Err(FleetError::transient_transfer("upload: Connection reset by peer"));
            }
        }
        if remote_path.starts_with("/readonly/") {
            return Err(FleetError::transfer("Permission denied"));
        }

        let mut content = Vec::new();
        source
            .read_to_end(&mut content)
            .await
            .map_err(|e| FleetError::from_transfer_io("upload", e))?;
        let written = content.len() as u64;
        self.transport
            .lock()
            .files
            .insert((self.host.clone(), remote_path.to_string()), content);
        Ok(written)
    }

    async fn get(
        &mut self,
        remote_path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let content = self
            .transport
            .lock()
            .files
            .get(&(self.host.clone(), remote_path.to_string()))
            .cloned()
            .ok_or_else(|| FleetError::transfer("No such file"))?;

        sink.write_all(&content)
            .await
            .map_err(|e| FleetError::from_transfer_io("download", e))?;
        sink.flush()
            .await
            .map_err(|e| FleetError::from_transfer_io("download", e))?;
        Ok(content.len() as u64)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.transport.lock().closes += 1;
        }
        self.release();
        Ok(())
    }
}

fn output(stdout: &str, stderr: &str, code: u32) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code: Some(code),
    }
}

/// Strip `./` and one level of single quotes
fn unquote(word: &str) -> String {
    let word = word.trim();
    let word = word.strip_prefix("./").unwrap_or(word);
    word.trim_matches('\'').to_string()
}

/// Scripts understand `echo <text>` and `exit <code>` lines
fn run_script(script: &str) -> CommandOutput {
    let mut stdout = String::new();
    for line in script.lines() {
        let line = line.trim();
        if let Some(text) = line.strip_prefix("echo ") {
            stdout.push_str(text);
            stdout.push('\n');
        } else if let Some(code) = line.strip_prefix("exit ") {
            let code = code.trim().parse().unwrap_or(1);
            return output(&stdout, "script failed\n", code);
        }
    }
    output(&stdout, "", 0)
}

pub fn endpoint(host: &str) -> Endpoint {
    Endpoint::with_password(host, "admin", "admin")
}

/// Pool config with short timings for tests
pub fn test_config() -> PoolConfig {
    PoolConfig::new(HostKeyPolicy::AcceptAny)
        .with_max_connections(8)
        .with_connect_timeout(Duration::from_secs(2))
        .with_command_timeout(Duration::from_secs(2))
        .with_acquire_timeout(Duration::from_secs(5))
        .with_retries(2, Duration::from_millis(1))
}

pub fn non_blocking(config: PoolConfig) -> PoolConfig {
    config.with_acquire_mode(AcquireMode::NonBlocking)
}

pub fn pool(transport: &MockTransport, config: PoolConfig) -> SessionPool {
    SessionPool::new(config, Arc::new(transport.clone())).unwrap()
}

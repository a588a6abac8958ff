//! Session: exclusive owner of one connection to one endpoint
//!
//! A [`Session`] translates [`Operation`]s into transport calls and tracks
//! the connection state:
//!
//! ```text
//! Disconnected -> Connecting -> Ready -> (Executing -> Ready)* -> Closing -> Closed
//!                     |           |            |
//!                     +-----------+------------+--> Broken -> Connecting
//! ```
//!
//! A session never retries on its own; reconnect policy lives in the pool and
//! request retries in the dispatcher.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::operation::Operation;
use crate::ssh::sanitize::{script_invocation, shell_quote};
use crate::ssh::{CommandOutput, ConnectOptions, Connection, Endpoint, Transport};

/// Upper bound for a graceful disconnect
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a [`Session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Executing,
    Broken,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::Broken => "broken",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-session settings derived from the pool configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect: ConnectOptions,
    /// Deadline for each command and each file transfer
    pub command_timeout: Duration,
    /// Keep the remote copy of a script whose run failed
    pub retain_failed_scripts: bool,
}

pub struct Session {
    id: u64,
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    settings: SessionSettings,
    connection: Option<Box<dyn Connection>>,
    state: SessionState,
    last_activity: Instant,
    retry_count: u32,
    connect_count: u32,
}

impl Session {
    pub fn new(
        id: u64,
        endpoint: Endpoint,
        transport: Arc<dyn Transport>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            id,
            endpoint,
            transport,
            settings,
            connection: None,
            state: SessionState::Disconnected,
            last_activity: Instant::now(),
            retry_count: 0,
            connect_count: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Failed connection attempts since the last successful connect
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Successful connects over the session's lifetime
    pub fn connect_count(&self) -> u32 {
        self.connect_count
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(
                "Session {} ({}): {} -> {}",
                self.id, self.endpoint, self.state, next
            );
            self.state = next;
        }
    }

    /// Establish the connection
    ///
    /// Allowed from `Disconnected` and `Broken`; a no-op when already `Ready`.
    /// Failure leaves the session `Broken`.
    pub async fn connect(&mut self) -> Result<()> {
        match self.state {
            SessionState::Ready => return Ok(()),
            SessionState::Disconnected | SessionState::Broken => {}
            other => return Err(FleetError::NotReady(other)),
        }

        // A broken session may still hold the channel that failed
        self.connection = None;
        self.transition(SessionState::Connecting);

        match self
            .transport
            .open(&self.endpoint, &self.settings.connect)
            .await
        {
            Ok(connection) => {
                self.connection = Some(connection);
                self.retry_count = 0;
                self.connect_count += 1;
                self.last_activity = Instant::now();
                self.transition(SessionState::Ready);
                Ok(())
            }
            Err(err) => {
                self.retry_count += 1;
                warn!(
                    "Session {} failed to connect to {}: {}",
                    self.id, self.endpoint, err
                );
                self.transition(SessionState::Broken);
                Err(err)
            }
        }
    }

    /// Mark the session unusable; the next `connect` opens a fresh connection
    pub fn mark_broken(&mut self) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.connection = None;
        self.transition(SessionState::Broken);
    }

    /// Reconcile state after the caller stopped driving an operation
    ///
    /// An operation future dropped mid-flight (cancellation) leaves the
    /// session `Executing` or `Connecting`; such a session is never reused.
    pub(crate) fn settle(&mut self) {
        if matches!(
            self.state,
            SessionState::Executing | SessionState::Connecting
        ) {
            warn!(
                "Session {} ({}) abandoned while {}; marking broken",
                self.id, self.endpoint, self.state
            );
            self.mark_broken();
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state == SessionState::Ready && self.connection.is_some() {
            Ok(())
        } else {
            Err(FleetError::NotReady(self.state))
        }
    }

    /// Take the connection out for the duration of one operation
    ///
    /// If the operation future is dropped, the connection is dropped with it
    /// and the session stays `Executing` until settled.
    fn begin(&mut self) -> Result<Box<dyn Connection>> {
        self.ensure_ready()?;
        let connection = self
            .connection
            .take()
            .ok_or(FleetError::NotReady(self.state))?;
        self.transition(SessionState::Executing);
        Ok(connection)
    }

    fn finish<T>(&mut self, connection: Box<dyn Connection>, result: &Result<T>) {
        self.last_activity = Instant::now();
        match result {
            Err(err) if poisons_connection(err) => {
                warn!(
                    "Session {} ({}) discarding connection: {}",
                    self.id, self.endpoint, err
                );
                drop(connection);
                self.transition(SessionState::Broken);
            }
            _ => {
                self.connection = Some(connection);
                self.transition(SessionState::Ready);
            }
        }
    }

    /// Run a command; a non-zero exit status is reported as
    /// [`FleetError::Execution`] carrying the captured output.
    pub async fn execute(&mut self, command: &str) -> Result<CommandOutput> {
        let deadline = self.settings.command_timeout;
        let mut connection = self.begin()?;

        debug!("Session {} executing `{}`", self.id, command);
        let result = match timeout(deadline, connection.exec(command)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Command on {} timed out after {}ms",
                    self.endpoint,
                    deadline.as_millis()
                );
                Err(FleetError::timeout(deadline))
            }
        };

        self.finish(connection, &result);
        result?.into_result()
    }

    /// Upload a local file, returning the number of bytes written
    pub async fn push(&mut self, local_path: &Path, remote_path: &str) -> Result<u64> {
        self.ensure_ready()?;

        // The local handle lives in this scope and is released on every path
        let mut file = tokio::fs::File::open(local_path).await.map_err(|e| {
            FleetError::from_transfer_io(&format!("open {}", local_path.display()), e)
        })?;

        let deadline = self.settings.command_timeout;
        let mut connection = self.begin()?;
        let result = match timeout(deadline, connection.put(&mut file, remote_path)).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::timeout(deadline)),
        };
        self.finish(connection, &result);

        let written = result?;
        info!(
            "Pushed {} ({} bytes) to {}:{}",
            local_path.display(),
            written,
            self.endpoint,
            remote_path
        );
        Ok(written)
    }

    /// Download a remote file, returning the number of bytes read
    ///
    /// The download lands in a sibling file that replaces `local_path` only
    /// once complete; a failed pull leaves an existing local file untouched.
    pub async fn pull(&mut self, remote_path: &str, local_path: &Path) -> Result<u64> {
        self.ensure_ready()?;

        let partial = self.partial_path(local_path)?;
        let mut file = tokio::fs::File::create(&partial).await.map_err(|e| {
            FleetError::from_transfer_io(&format!("create {}", partial.display()), e)
        })?;

        let deadline = self.settings.command_timeout;
        let mut connection = self.begin()?;
        let result = match timeout(deadline, connection.get(remote_path, &mut file)).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::timeout(deadline)),
        };
        self.finish(connection, &result);
        drop(file);

        let result = match result {
            Ok(read) => tokio::fs::rename(&partial, local_path)
                .await
                .map(|_| read)
                .map_err(|e| {
                    FleetError::from_transfer_io(&format!("rename to {}", local_path.display()), e)
                }),
            Err(err) => Err(err),
        };

        match result {
            Ok(read) => {
                info!(
                    "Pulled {}:{} ({} bytes) to {}",
                    self.endpoint,
                    remote_path,
                    read,
                    local_path.display()
                );
                Ok(read)
            }
            Err(err) => {
                if let Err(e) = tokio::fs::remove_file(&partial).await {
                    debug!(
                        "Could not remove partial download {}: {}",
                        partial.display(),
                        e
                    );
                }
                Err(err)
            }
        }
    }

    /// `.<name>.<session id>.part` next to `local_path`
    fn partial_path(&self, local_path: &Path) -> Result<PathBuf> {
        let name = local_path.file_name().ok_or_else(|| {
            FleetError::transfer(format!("{} is not a file path", local_path.display()))
        })?;
        let mut partial = OsString::from(".");
        partial.push(name);
        partial.push(format!(".{}.part", self.id));
        Ok(local_path.with_file_name(partial))
    }

    /// Push a script, `chmod +x` it, run it and remove the remote copy
    ///
    /// Cleanup runs whether or not the script succeeded. When both the run and
    /// the cleanup fail, the run's error is returned and the cleanup error is
    /// only logged.
    pub async fn execute_file(
        &mut self,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<CommandOutput> {
        let quoted = shell_quote(remote_path);

        let run_result = match self.push(local_path, remote_path).await {
            Ok(_) => match self.execute(&format!("chmod +x {}", quoted)).await {
                Ok(_) => self.execute(&script_invocation(remote_path)).await,
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        if run_result.is_err() && self.settings.retain_failed_scripts {
            info!(
                "Keeping {} on {} for inspection after failed run",
                remote_path, self.endpoint
            );
        } else {
            self.remove_remote(remote_path, &quoted).await;
        }

        run_result
    }

    async fn remove_remote(&mut self, remote_path: &str, quoted: &str) {
        if !self.is_ready() {
            warn!(
                "Cannot remove {} from {}: session is {}",
                remote_path, self.endpoint, self.state
            );
            return;
        }
        if let Err(e) = self.execute(&format!("rm -f {}", quoted)).await {
            warn!(
                "Failed to remove {} from {}: {}",
                remote_path, self.endpoint, e
            );
        }
    }

    /// Run any [`Operation`]
    ///
    /// File transfers report empty stdout and exit code 0 on success.
    pub async fn run(&mut self, operation: &Operation) -> Result<CommandOutput> {
        match operation {
            Operation::Exec { command } => self.execute(command).await,
            Operation::Push {
                local_path,
                remote_path,
            } => {
                self.push(local_path, remote_path).await?;
                Ok(transfer_output())
            }
            Operation::Pull {
                remote_path,
                local_path,
            } => {
                self.pull(remote_path, local_path).await?;
                Ok(transfer_output())
            }
            Operation::ExecuteFile {
                local_path,
                remote_path,
            } => self.execute_file(local_path, remote_path).await,
        }
    }

    /// Release the connection
    ///
    /// Idempotent: closing a closed session does nothing and returns `Ok`.
    pub async fn close(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            debug!("Session {} ({}) already closed", self.id, self.endpoint);
            return Ok(());
        }

        self.transition(SessionState::Closing);
        let result = match self.connection.take() {
            Some(mut connection) => match timeout(CLOSE_TIMEOUT, connection.close()).await {
                Ok(result) => result,
                Err(_) => Err(FleetError::timeout(CLOSE_TIMEOUT)),
            },
            None => Ok(()),
        };
        self.transition(SessionState::Closed);
        result
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.id())
            .field("state", &self.state)
            .field("retry_count", &self.retry_count)
            .field("connect_count", &self.connect_count)
            .finish()
    }
}

/// Errors after which the connection cannot be trusted for the next operation
fn poisons_connection(err: &FleetError) -> bool {
    matches!(err, FleetError::Timeout(_) | FleetError::Connect(_)) || err.is_retryable()
}

fn transfer_output() -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: String::new(),
        exit_code: Some(0),
    }
}

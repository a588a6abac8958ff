//! ssh-fleet - pooled SSH sessions for running operations on many hosts
//!
//! This crate keeps at most one live SSH session per endpoint, reuses it
//! across operations, and dispatches batches of operations over many
//! endpoints concurrently while bounding the number of open connections.
//!
//! # Features
//!
//! - Run shell commands (`exec`), upload (`push`) and download (`pull`) files
//! - Upload, run and clean up a script in one step (`execute_file`)
//! - One session per endpoint, serialized per endpoint, parallel across endpoints
//! - Reconnect with exponential backoff, retries for transient failures only
//! - Per-command timeouts; a timed out session reconnects before reuse
//! - Explicit host-key policy (`strict`, `accept-new`, `accept-any`)
//!
//! # Modules
//!
//! - [`session`] - one connection and its state machine
//! - [`pool`] - per-endpoint session reuse and the connection bound
//! - [`dispatcher`] - ordered batch execution with retries and cancellation
//! - [`ssh`] - endpoints, host-key checking and the russh transport
//!
//! # Example Usage (CLI)
//!
//! ```bash
//! ssh-fleet --host=10.0.0.1,10.0.0.2 --user=admin --password=secret \
//!   --host-key-policy=accept-new exec "uptime"
//! ```
//!
//! # Example Usage (library)
//!
//! ```no_run
//! use ssh_fleet::{Dispatcher, Endpoint, HostKeyPolicy, Operation, PoolConfig, Request, SessionPool};
//!
//! # async fn demo() -> ssh_fleet::Result<()> {
//! let pool = SessionPool::with_russh(PoolConfig::new(HostKeyPolicy::Strict))?;
//! let dispatcher = Dispatcher::new(pool.clone());
//!
//! let requests = vec![
//!     Request::new(Endpoint::with_password("10.0.0.1", "admin", "secret"), Operation::exec("ls -l")),
//!     Request::new(Endpoint::with_password("10.0.0.2", "admin", "secret"), Operation::exec("ls -l")),
//! ];
//! for result in dispatcher.run_batch(requests).await {
//!     println!("{}: {:?}", result.endpoint, result.outcome);
//! }
//!
//! pool.close_all().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod operation;
pub mod pool;
pub mod retry;
pub mod session;
pub mod ssh;

// Re-exports for convenience
pub use config::{AcquireMode, Args, Config, PoolConfig};
pub use dispatcher::Dispatcher;
pub use error::{ErrorKind, FleetError, Result};
pub use operation::{Failure, Operation, OperationResult, Outcome, Request};
pub use pool::{PoolStats, PooledSession, SessionPool, ShutdownReport};
pub use retry::RetryPolicy;
pub use session::{Session, SessionSettings, SessionState};
pub use ssh::{
    CommandOutput, ConnectOptions, Connection, Credentials, Endpoint, EndpointId, HostKeyPolicy,
    RusshTransport, Transport, MISSING_EXIT_STATUS,
};

//! Transport capability consumed by sessions
//!
//! A [`Transport`] opens [`Connection`]s; a connection runs commands and moves
//! file content. Sessions only talk to these traits, so the SSH stack (see
//! [`RusshTransport`](super::connection::RusshTransport)) can be swapped for an
//! in-memory implementation in tests.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::command::CommandOutput;
use super::endpoint::Endpoint;
use super::handler::HostKeyPolicy;
use crate::error::Result;

/// Parameters of a single connection attempt
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// How the server's host key is verified
    pub host_key_policy: HostKeyPolicy,

    /// known_hosts file to use instead of `~/.ssh/known_hosts`
    pub known_hosts: Option<PathBuf>,

    /// Upper bound for TCP setup, key exchange and authentication
    pub connect_timeout: Duration,
}

/// Opens connections to endpoints
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish and authenticate a connection
    ///
    /// Fails with [`FleetError::Connect`](crate::FleetError::Connect) on
    /// network, host-key or authentication failure.
    async fn open(&self, endpoint: &Endpoint, options: &ConnectOptions)
        -> Result<Box<dyn Connection>>;
}

/// One live, authenticated connection
///
/// A connection is never used by two operations at once; the owning session
/// holds it behind `&mut`.
#[async_trait]
pub trait Connection: Send {
    /// Run a command to completion and capture its output
    ///
    /// A non-zero exit status is not an error at this level.
    async fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    /// Write everything from `source` to `remote_path`, truncating it
    ///
    /// Returns the number of bytes written.
    async fn put(
        &mut self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        remote_path: &str,
    ) -> Result<u64>;

    /// Copy `remote_path` into `sink`, returning the number of bytes read
    async fn get(
        &mut self,
        remote_path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64>;

    /// Tear the connection down
    async fn close(&mut self) -> Result<()>;
}

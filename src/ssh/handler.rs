//! SSH client handler implementation
//!
//! Implements the `russh::client::Handler` trait to verify server host keys
//! according to the caller-supplied [`HostKeyPolicy`].

use std::path::PathBuf;

use russh::keys::known_hosts::{learn_known_hosts, learn_known_hosts_path};
use russh::keys::{check_known_hosts, check_known_hosts_path, PublicKey};
use tracing::{debug, info, warn};

/// How server host keys are verified
///
/// No `Default`: every pool names its policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum HostKeyPolicy {
    /// Only accept keys already present in known_hosts
    Strict,
    /// Accept and record keys of unknown hosts, reject changed keys
    AcceptNew,
    /// Accept every key without verification (insecure)
    AcceptAny,
}

/// SSH client handler for russh
#[derive(Debug, Clone)]
pub struct SshHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
}

impl SshHandler {
    /// Create a new SSH handler for one endpoint
    pub fn new(
        host: impl Into<String>,
        port: u16,
        policy: HostKeyPolicy,
        known_hosts: Option<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            policy,
            known_hosts,
        }
    }

    fn is_known(&self, key: &PublicKey) -> Result<bool, russh::keys::Error> {
        match &self.known_hosts {
            Some(path) => check_known_hosts_path(&self.host, self.port, key, path),
            None => check_known_hosts(&self.host, self.port, key),
        }
    }

    fn learn(&self, key: &PublicKey) -> Result<(), russh::keys::Error> {
        match &self.known_hosts {
            Some(path) => learn_known_hosts_path(&self.host, self.port, key, path),
            None => learn_known_hosts(&self.host, self.port, key),
        }
    }
}

impl russh::client::Handler for SshHandler {
    type Error = anyhow::Error;

    /// Verify the server's host key
    ///
    /// A key that differs from the recorded one is an error under every
    /// policy except `AcceptAny`.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAny => {
                warn!(
                    "Accepting host key of {}:{} without verification",
                    self.host, self.port
                );
                Ok(true)
            }
            HostKeyPolicy::Strict => {
                let known = self.is_known(server_public_key)?;
                if !known {
                    warn!("Host key of {}:{} is not in known_hosts", self.host, self.port);
                }
                Ok(known)
            }
            HostKeyPolicy::AcceptNew => {
                if self.is_known(server_public_key)? {
                    debug!("Host key of {}:{} verified", self.host, self.port);
                    return Ok(true);
                }
                self.learn(server_public_key)?;
                info!("Recorded new host key for {}:{}", self.host, self.port);
                Ok(true)
            }
        }
    }
}

//! russh-backed transport
//!
//! Opens authenticated SSH connections with russh and exposes them through
//! the [`Transport`]/[`Connection`] traits. Command execution lives in
//! `command.rs`, SFTP transfers in `transfer.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::command::CommandOutput;
use super::endpoint::{Credentials, Endpoint};
use super::handler::SshHandler;
use super::transport::{ConnectOptions, Connection, Transport};
use crate::error::{FleetError, Result};

/// [`Transport`] implementation on top of russh and russh-sftp
#[derive(Clone)]
pub struct RusshTransport {
    config: Arc<client::Config>,
}

impl RusshTransport {
    /// Create a transport with russh's default client configuration
    pub fn new() -> Self {
        Self::with_config(client::Config::default())
    }

    /// Create a transport with a custom russh client configuration
    pub fn with_config(config: client::Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for RusshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RusshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn open(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>> {
        info!("Connecting to SSH server {}...", endpoint);

        // TCP setup, key exchange and authentication share one deadline
        match timeout(options.connect_timeout, self.do_connect(endpoint, options)).await {
            Ok(Ok(connection)) => {
                info!("Successfully connected to {}", endpoint);
                Ok(Box::new(connection))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                error!(
                    "SSH connection to {} timed out after {}ms",
                    endpoint,
                    options.connect_timeout.as_millis()
                );
                Err(FleetError::connect(format!(
                    "Connection timeout after {}ms",
                    options.connect_timeout.as_millis()
                )))
            }
        }
    }
}

impl RusshTransport {
    /// Internal connection logic
    async fn do_connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> Result<RusshConnection> {
        let handler = SshHandler::new(
            endpoint.host.clone(),
            endpoint.port,
            options.host_key_policy,
            options.known_hosts.clone(),
        );

        let addr = endpoint.address();
        let mut session = client::connect(self.config.clone(), addr.as_str(), handler)
            .await
            .map_err(|e| {
                error!("SSH connection to {} failed: {:#}", endpoint, e);
                FleetError::connect(format!("{:#}", e))
            })?;

        authenticate(&mut session, endpoint).await?;

        Ok(RusshConnection {
            label: endpoint.to_string(),
            session,
            sftp: None,
        })
    }
}

/// Authenticate with the SSH server
async fn authenticate(session: &mut Handle<SshHandler>, endpoint: &Endpoint) -> Result<()> {
    let username = endpoint.username.as_str();

    let key = match &endpoint.credentials {
        Credentials::Password(password) => {
            debug!("Attempting password authentication for user '{}'", username);
            let auth_result = session
                .authenticate_password(username, password)
                .await
                .map_err(|e| FleetError::connect(format!("Authentication failed: {}", e)))?;

            if auth_result.success() {
                info!("Password authentication successful");
                return Ok(());
            }
            return Err(FleetError::connect(
                "Authentication failed: password rejected",
            ));
        }
        Credentials::KeyFile { path, passphrase } => {
            russh::keys::load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                FleetError::SshKey(format!(
                    "Failed to load private key {}: {}",
                    path.display(),
                    e
                ))
            })?
        }
        Credentials::KeyContent(content) => {
            russh::keys::PrivateKey::from_openssh(content.as_bytes())
                .map_err(|e| FleetError::SshKey(format!("Failed to parse private key: {}", e)))?
        }
    };

    debug!("Attempting key authentication for user '{}'", username);

    // None selects the default hash for the key type
    let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);

    let auth_result = session
        .authenticate_publickey(username, key_with_alg)
        .await
        .map_err(|e| FleetError::connect(format!("Authentication failed: {}", e)))?;

    if auth_result.success() {
        info!("Key authentication successful");
        Ok(())
    } else {
        Err(FleetError::connect("Authentication failed: key rejected"))
    }
}

/// A live russh session plus a lazily opened SFTP subsystem
pub struct RusshConnection {
    pub(crate) label: String,
    pub(crate) session: Handle<SshHandler>,
    pub(crate) sftp: Option<SftpSession>,
}

impl std::fmt::Debug for RusshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshConnection")
            .field("endpoint", &self.label)
            .field("sftp_open", &self.sftp.is_some())
            .finish()
    }
}

#[async_trait]
impl Connection for RusshConnection {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        self.exec_via_channel(command).await
    }

    async fn put(
        &mut self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        remote_path: &str,
    ) -> Result<u64> {
        let result = self.upload(source, remote_path).await;
        if result.is_err() {
            // the subsystem may be wedged; reopen it next time
            self.sftp = None;
        }
        result
    }

    async fn get(
        &mut self,
        remote_path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let result = self.download(remote_path, sink).await;
        if result.is_err() {
            self.sftp = None;
        }
        result
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(sftp) = self.sftp.take() {
            if let Err(e) = sftp.close().await {
                debug!("Failed to close SFTP subsystem on {}: {}", self.label, e);
            }
        }

        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
            .map_err(|e| FleetError::connect(format!("Failed to disconnect: {}", e)))?;

        info!("SSH connection to {} closed", self.label);
        Ok(())
    }
}

//! Endpoint and credential types
//!
//! An [`Endpoint`] names one remote device together with the credentials
//! used to log into it. Pool and dispatcher key their state by [`EndpointId`].

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// How to authenticate against an endpoint
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Password authentication
    Password(String),

    /// Private key loaded from disk, optionally encrypted
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },

    /// Private key content (OpenSSH format, not a path)
    KeyContent(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(<redacted>)"),
            Credentials::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Credentials::KeyContent(_) => f.write_str("KeyContent(<redacted>)"),
        }
    }
}

/// Identity of an endpoint: two endpoints with the same host, port and user
/// share one pooled session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EndpointId {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// A single addressable remote device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Remote hostname or IP address
    pub host: String,

    /// SSH port (default: 22)
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Credentials used when the pool opens a connection
    pub credentials: Credentials,
}

impl Endpoint {
    /// Create an endpoint on the default SSH port
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            credentials,
        }
    }

    /// Shorthand for password authentication
    pub fn with_password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, username, Credentials::Password(password.into()))
    }

    /// Set the SSH port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn id(&self) -> EndpointId {
        EndpointId {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
        }
    }

    /// `host:port` string suitable for socket address resolution
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            // bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

//! SSH transport layer
//!
//! Endpoint and credential types, host-key verification, and the transport
//! capability used by sessions, with its russh/russh-sftp implementation.

pub mod command;
pub mod connection;
pub mod endpoint;
pub mod handler;
pub mod sanitize;
mod transfer;
pub mod transport;

// Re-exports
pub use command::{CommandOutput, MISSING_EXIT_STATUS};
pub use connection::{RusshConnection, RusshTransport};
pub use endpoint::{Credentials, Endpoint, EndpointId};
pub use handler::{HostKeyPolicy, SshHandler};
pub use sanitize::{sanitize_command, shell_quote, validate_remote_path};
pub use transport::{ConnectOptions, Connection, Transport};

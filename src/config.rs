//! Pool configuration and CLI argument parsing for the ssh-fleet binary

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::error::{FleetError, Result};
use crate::operation::{Operation, Request};
use crate::retry::RetryPolicy;
use crate::session::SessionSettings;
use crate::ssh::{ConnectOptions, Credentials, Endpoint, HostKeyPolicy};

/// Default bound on simultaneously open connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Default timeout for TCP setup, key exchange and authentication in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000; // 30 seconds

/// Default timeout for command execution and transfers in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000; // 60 seconds

/// Idle sessions older than this are closed by the sweeper
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Upper bound for waiting on a session or on connection capacity
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 120;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Default max characters for a command (None = unlimited)
pub const DEFAULT_MAX_CHARS: Option<usize> = Some(1000);

/// What `acquire` does when every connection slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquireMode {
    /// Wait for a release, bounded by `acquire_timeout`
    #[default]
    Blocking,
    /// Fail immediately with `PoolExhausted`
    NonBlocking,
}

/// Settings shared by the pool, its sessions and the dispatcher
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_concurrent_connections: usize,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub idle_session_timeout: Duration,
    pub acquire_timeout: Duration,
    pub acquire_mode: AcquireMode,
    /// Reconnect attempts for a broken session, and retries per request
    pub max_retries: u32,
    /// First backoff delay, doubled on each retry
    pub retry_backoff: Duration,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts_path: Option<PathBuf>,
    pub max_command_chars: Option<usize>,
    /// Keep the remote copy of a script whose run failed
    pub retain_failed_scripts: bool,
    pub sweep_interval: Duration,
}

impl PoolConfig {
    /// Configuration with defaults for everything except host-key checking,
    /// which has no safe default.
    pub fn new(host_key_policy: HostKeyPolicy) -> Self {
        Self {
            max_concurrent_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            command_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            idle_session_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            acquire_mode: AcquireMode::Blocking,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            host_key_policy,
            known_hosts_path: None,
            max_command_chars: DEFAULT_MAX_CHARS,
            retain_failed_scripts: false,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_concurrent_connections = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_session_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_acquire_mode(mut self, mode: AcquireMode) -> Self {
        self.acquire_mode = mode;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    pub fn with_max_command_chars(mut self, max_chars: Option<usize>) -> Self {
        self.max_command_chars = max_chars;
        self
    }

    pub fn with_retain_failed_scripts(mut self, retain: bool) -> Self {
        self.retain_failed_scripts = retain;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Reject bounds that would make the pool unusable
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.max_concurrent_connections == 0 {
            errors.push("max_concurrent_connections must be at least 1");
        }
        if self.connect_timeout.is_zero() {
            errors.push("connect_timeout must be greater than zero");
        }
        if self.command_timeout.is_zero() {
            errors.push("command_timeout must be greater than zero");
        }
        if self.acquire_timeout.is_zero() {
            errors.push("acquire_timeout must be greater than zero");
        }
        if self.sweep_interval.is_zero() {
            errors.push("sweep_interval must be greater than zero");
        }

        if !errors.is_empty() {
            return Err(FleetError::config(errors.join("; ")));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_retries, self.retry_backoff)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            host_key_policy: self.host_key_policy,
            known_hosts: self.known_hosts_path.clone(),
            connect_timeout: self.connect_timeout,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect: self.connect_options(),
            command_timeout: self.command_timeout,
            retain_failed_scripts: self.retain_failed_scripts,
        }
    }
}

/// ssh-fleet CLI Arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "ssh-fleet")]
#[command(version)]
#[command(about = "Run commands and move files on many SSH hosts through one session pool")]
pub struct Args {
    /// Target host as host or host:port; repeat or comma-separate for several
    #[arg(long = "host", env = "SSH_FLEET_HOSTS", value_delimiter = ',', required = true)]
    pub hosts: Vec<String>,

    /// SSH port for hosts given without one
    #[arg(long, default_value = "22", env = "SSH_FLEET_PORT")]
    pub port: u16,

    /// SSH username
    #[arg(long, env = "SSH_FLEET_USER")]
    pub user: String,

    /// SSH password (alternative to key)
    #[arg(long, env = "SSH_FLEET_PASSWORD")]
    pub password: Option<String>,

    /// Path to SSH private key file (alternative to password)
    #[arg(long, env = "SSH_FLEET_KEY")]
    pub key: Option<PathBuf>,

    /// Passphrase for an encrypted private key
    #[arg(long, env = "SSH_FLEET_KEY_PASSPHRASE")]
    pub key_passphrase: Option<String>,

    /// How to verify server host keys
    #[arg(long, value_enum, env = "SSH_FLEET_HOST_KEY_POLICY")]
    pub host_key_policy: HostKeyPolicy,

    /// known_hosts file to use instead of ~/.ssh/known_hosts
    #[arg(long, env = "SSH_FLEET_KNOWN_HOSTS")]
    pub known_hosts: Option<PathBuf>,

    /// Maximum number of simultaneously open connections
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS, env = "SSH_FLEET_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// Connection timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_MS, env = "SSH_FLEET_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Command execution timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS, env = "SSH_FLEET_TIMEOUT")]
    pub timeout: u64,

    /// Retries for connection and transient transfer failures
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, env = "SSH_FLEET_RETRIES")]
    pub retries: u32,

    /// First retry delay in milliseconds, doubled on each retry
    #[arg(long, default_value_t = DEFAULT_RETRY_BACKOFF_MS, env = "SSH_FLEET_RETRY_BACKOFF")]
    pub retry_backoff: u64,

    /// Maximum characters for command length.
    /// Use "none", "0", or negative value to disable limit.
    /// Default: 1000
    #[arg(long = "maxChars", env = "SSH_FLEET_MAX_CHARS")]
    pub max_chars: Option<String>,

    /// Keep a script on the remote host when its run fails
    #[arg(long, default_value = "false")]
    pub keep_failed_scripts: bool,

    /// Print results as JSON
    #[arg(long, default_value = "false")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// What to do on every host
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run a shell command
    Exec {
        /// Command line, passed to the remote shell as is
        command: String,
    },
    /// Upload a local file
    Push { local: PathBuf, remote: String },
    /// Download a remote file; with several hosts each copy gets a `.<host>` suffix
    Pull { remote: String, local: PathBuf },
    /// Upload a script, run it and remove it
    RunScript { local: PathBuf, remote: String },
}

/// Parsed and validated configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoints: Vec<Endpoint>,
    pub pool: PoolConfig,
    pub command: Command,
    pub json: bool,
}

impl Config {
    /// Create Config from CLI Args
    pub fn from_args(args: Args) -> Result<Self> {
        let mut errors = Vec::new();

        if args.user.is_empty() {
            errors.push("Missing required --user".to_string());
        }

        let credentials = match (args.key.clone(), sanitize_password(args.password)) {
            (Some(path), _) => Some(Credentials::KeyFile {
                path,
                passphrase: sanitize_password(args.key_passphrase),
            }),
            (None, Some(password)) => Some(Credentials::Password(password)),
            (None, None) => {
                errors.push("Must provide either --password or --key".to_string());
                None
            }
        };

        if let Some(ref key_path) = args.key {
            if !key_path.exists() {
                errors.push(format!("SSH key file not found: {}", key_path.display()));
            }
        }

        let mut targets = Vec::new();
        for spec in &args.hosts {
            match parse_host_spec(spec, args.port) {
                Ok(target) => targets.push(target),
                Err(e) => errors.push(e.to_string()),
            }
        }
        if targets.is_empty() && errors.is_empty() {
            errors.push("Missing required --host".to_string());
        }

        if args.max_connections == 0 {
            errors.push("--max-connections must be at least 1".to_string());
        }
        if args.timeout == 0 {
            errors.push("--timeout must be greater than zero".to_string());
        }
        if args.connect_timeout == 0 {
            errors.push("--connect-timeout must be greater than zero".to_string());
        }

        if !errors.is_empty() {
            return Err(FleetError::Config(format!(
                "Configuration error:\n{}",
                errors.join("\n")
            )));
        }

        let credentials = credentials
            .ok_or_else(|| FleetError::config("Must provide either --password or --key"))?;

        let endpoints = targets
            .into_iter()
            .map(|(host, port)| {
                Endpoint::new(host, args.user.clone(), credentials.clone()).port(port)
            })
            .collect();

        let mut pool = PoolConfig::new(args.host_key_policy)
            .with_max_connections(args.max_connections)
            .with_connect_timeout(Duration::from_millis(args.connect_timeout))
            .with_command_timeout(Duration::from_millis(args.timeout))
            .with_retries(args.retries, Duration::from_millis(args.retry_backoff))
            .with_max_command_chars(parse_max_chars(args.max_chars.as_deref()))
            .with_retain_failed_scripts(args.keep_failed_scripts);
        if let Some(path) = args.known_hosts {
            pool = pool.with_known_hosts(path);
        }

        Ok(Config {
            endpoints,
            pool,
            command: args.command,
            json: args.json,
        })
    }

    /// One request per endpoint for the configured command
    pub fn requests(&self) -> Vec<Request> {
        let several = self.endpoints.len() > 1;
        self.endpoints
            .iter()
            .map(|endpoint| {
                let operation = match &self.command {
                    Command::Exec { command } => Operation::exec(command.clone()),
                    Command::Push { local, remote } => Operation::push(local, remote.clone()),
                    Command::Pull { remote, local } => {
                        let local = if several {
                            let mut name = local.clone().into_os_string();
                            name.push(format!(".{}", endpoint.host));
                            PathBuf::from(name)
                        } else {
                            local.clone()
                        };
                        Operation::pull(remote.clone(), local)
                    }
                    Command::RunScript { local, remote } => {
                        Operation::execute_file(local, remote.clone())
                    }
                };
                Request::new(endpoint.clone(), operation)
            })
            .collect()
    }
}

/// Split `host`, `host:port` or `[v6addr]:port`
///
/// A bare IPv6 address (more than one colon, no brackets) takes the default port.
pub fn parse_host_spec(spec: &str, default_port: u16) -> Result<(String, u16)> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(FleetError::config("Empty host"));
    }

    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| FleetError::config(format!("Invalid port in host '{}'", spec)))
    };

    if let Some(rest) = spec.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| FleetError::config(format!("Unterminated '[' in host '{}'", spec)))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => default_port,
            None => return Err(FleetError::config(format!("Invalid host '{}'", spec))),
        };
        return Ok((host.to_string(), port));
    }

    match spec.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(FleetError::config(format!("Missing host name in '{}'", spec)));
            }
            Ok((host.to_string(), parse_port(port)?))
        }
        _ => Ok((spec.to_string(), default_port)),
    }
}

/// Parse max_chars argument
///
/// - "none" (case-insensitive) → None (unlimited)
/// - "0" or negative → None (unlimited)
/// - positive integer → Some(value)
/// - None (not provided) → DEFAULT_MAX_CHARS
pub fn parse_max_chars(value: Option<&str>) -> Option<usize> {
    match value {
        None => DEFAULT_MAX_CHARS,
        Some(s) => {
            if s.eq_ignore_ascii_case("none") {
                return None;
            }

            match s.parse::<i64>() {
                Ok(n) if n <= 0 => None,
                Ok(n) => Some(n as usize),
                Err(_) => DEFAULT_MAX_CHARS,
            }
        }
    }
}

/// Sanitize password: return None if empty
fn sanitize_password(password: Option<String>) -> Option<String> {
    password.filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> std::result::Result<Args, clap::Error> {
        let mut argv = vec![
            "ssh-fleet",
            "--host",
            "web-1,web-2:2222",
            "--user",
            "deploy",
            "--password",
            "secret",
            "--host-key-policy",
            "accept-new",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv)
    }

    #[test]
    fn test_parse_max_chars() {
        assert_eq!(parse_max_chars(Some("none")), None);
        assert_eq!(parse_max_chars(Some("NONE")), None);
        assert_eq!(parse_max_chars(Some("0")), None);
        assert_eq!(parse_max_chars(Some("-100")), None);
        assert_eq!(parse_max_chars(Some("500")), Some(500));
        assert_eq!(parse_max_chars(Some("abc")), DEFAULT_MAX_CHARS);
        assert_eq!(parse_max_chars(None), DEFAULT_MAX_CHARS);
    }

    #[test]
    fn test_sanitize_password() {
        assert_eq!(
            sanitize_password(Some("secret".to_string())),
            Some("secret".to_string())
        );
        assert_eq!(sanitize_password(Some("".to_string())), None);
        assert_eq!(sanitize_password(None), None);
    }

    #[test]
    fn test_parse_host_spec() {
        assert_eq!(parse_host_spec("web-1", 22).unwrap(), ("web-1".to_string(), 22));
        assert_eq!(
            parse_host_spec("web-1:2222", 22).unwrap(),
            ("web-1".to_string(), 2222)
        );
        assert_eq!(
            parse_host_spec("[::1]:2200", 22).unwrap(),
            ("::1".to_string(), 2200)
        );
        assert_eq!(parse_host_spec("[::1]", 22).unwrap(), ("::1".to_string(), 22));
        assert_eq!(
            parse_host_spec("fe80::1", 22).unwrap(),
            ("fe80::1".to_string(), 22)
        );
        assert!(parse_host_spec("web-1:http", 22).is_err());
        assert!(parse_host_spec(":22", 22).is_err());
        assert!(parse_host_spec("[::1", 22).is_err());
        assert!(parse_host_spec("  ", 22).is_err());
    }

    #[test]
    fn test_host_key_policy_is_required() {
        let result = Args::try_parse_from([
            "ssh-fleet", "--host", "web-1", "--user", "deploy", "--password", "x", "exec", "ls",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_from_args() {
        let args = parse(&["--timeout", "5000", "--maxChars", "none", "exec", "uptime"]).unwrap();
        let config = Config::from_args(args).unwrap();

        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].port, 22);
        assert_eq!(config.endpoints[1].host, "web-2");
        assert_eq!(config.endpoints[1].port, 2222);
        assert_eq!(config.pool.command_timeout, Duration::from_millis(5000));
        assert_eq!(config.pool.max_command_chars, None);
        assert_eq!(config.pool.host_key_policy, HostKeyPolicy::AcceptNew);
        assert!(matches!(
            config.endpoints[0].credentials,
            Credentials::Password(_)
        ));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let args = Args::try_parse_from([
            "ssh-fleet",
            "--host",
            "web-1:notaport",
            "--user",
            "",
            "--host-key-policy",
            "strict",
            "--max-connections",
            "0",
            "exec",
            "ls",
        ])
        .unwrap();

        let err = Config::from_args(args).unwrap_err().to_string();
        assert!(err.contains("--user"));
        assert!(err.contains("--password or --key"));
        assert!(err.contains("Invalid port"));
        assert!(err.contains("--max-connections"));
    }

    #[test]
    fn test_missing_key_file_rejected() {
        let args = Args::try_parse_from([
            "ssh-fleet",
            "--host",
            "web-1",
            "--user",
            "deploy",
            "--key",
            "/nonexistent/id_ed25519",
            "--host-key-policy",
            "strict",
            "exec",
            "ls",
        ])
        .unwrap();

        let err = Config::from_args(args).unwrap_err().to_string();
        assert!(err.contains("SSH key file not found"));
    }

    #[test]
    fn test_pull_requests_get_per_host_paths() {
        let args = parse(&["pull", "/var/log/syslog", "syslog"]).unwrap();
        let config = Config::from_args(args).unwrap();
        let requests = config.requests();

        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].operation,
            Operation::pull("/var/log/syslog", "syslog.web-1")
        );
        assert_eq!(
            requests[1].operation,
            Operation::pull("/var/log/syslog", "syslog.web-2")
        );
    }

    #[test]
    fn test_pool_config_validate() {
        let config = PoolConfig::new(HostKeyPolicy::Strict);
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_policy().max_retries, DEFAULT_MAX_RETRIES);

        let config = PoolConfig::new(HostKeyPolicy::Strict)
            .with_max_connections(0)
            .with_command_timeout(Duration::ZERO);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_concurrent_connections"));
        assert!(err.contains("command_timeout"));
    }
}

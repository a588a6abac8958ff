//! Command execution over SSH
//!
//! Provides the `CommandOutput` struct and exec-channel handling for
//! [`RusshConnection`].

use russh::ChannelMsg;
use serde::Serialize;
use tracing::debug;

use super::connection::RusshConnection;
use crate::error::{FleetError, Result};

/// Status reported for a command that ended without an exit status, e.g.
/// one killed by a signal
pub const MISSING_EXIT_STATUS: u32 = 255;

/// Output from a command execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,

    /// Standard error from the command
    pub stderr: String,

    /// Exit code of the command (if available)
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    /// Create a new empty CommandOutput
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Exit status, with a missing status reported as [`MISSING_EXIT_STATUS`]
    pub fn status(&self) -> u32 {
        self.exit_code.unwrap_or(MISSING_EXIT_STATUS)
    }

    /// Turn a non-zero exit status into [`FleetError::Execution`]
    pub fn into_result(self) -> Result<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(FleetError::Execution {
                exit_code: self.status(),
                output: self,
            })
        }
    }
}

impl RusshConnection {
    /// Execute command via a new exec channel
    pub(crate) async fn exec_via_channel(&mut self, command: &str) -> Result<CommandOutput> {
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(|e| FleetError::connect(format!("Failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| FleetError::connect(format!("Failed to exec command: {}", e)))?;

        self.collect_channel_output(channel).await
    }

    /// Collect output from a channel until it closes
    async fn collect_channel_output(
        &self,
        mut channel: russh::Channel<russh::client::Msg>,
    ) -> Result<CommandOutput> {
        let mut output = CommandOutput::new();
        let mut closed = false;
        let mut signal = None;

        // exit-status usually arrives after EOF, so only Close ends the loop
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    output.stdout.push_str(&String::from_utf8_lossy(&data));
                }
                ChannelMsg::ExtendedData { data, ext } => {
                    // ext == 1 is stderr
                    if ext == 1 {
                        output.stderr.push_str(&String::from_utf8_lossy(&data));
                    } else {
                        output.stdout.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    output.exit_code = Some(exit_status);
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    signal = Some(format!("{:?}", signal_name));
                }
                ChannelMsg::Close => {
                    closed = true;
                    break;
                }
                _ => {}
            }
        }

        debug!(
            "Command completed on {}: exit_code={:?}, signal={:?}, stdout_len={}, stderr_len={}",
            self.label,
            output.exit_code,
            signal,
            output.stdout.len(),
            output.stderr.len()
        );

        complete_output(output, closed, signal)
    }
}

/// Decide how a finished exec channel is reported
///
/// A channel that went away before `Close` without an exit status means the
/// connection dropped mid-command. A signal exit is recorded on stderr and
/// reported through [`MISSING_EXIT_STATUS`].
fn complete_output(
    mut output: CommandOutput,
    closed: bool,
    signal: Option<String>,
) -> Result<CommandOutput> {
    if output.exit_code.is_some() {
        return Ok(output);
    }
    if let Some(signal) = signal {
        output.stderr.push_str(&format!("killed by signal {}\n", signal));
        return Ok(output);
    }
    if !closed {
        return Err(FleetError::connect("channel closed before command completed"));
    }
    output.stderr.push_str("command exited without a status\n");
    Ok(output)
}

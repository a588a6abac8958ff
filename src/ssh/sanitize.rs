//! Command sanitization and shell quoting utilities
//!
//! Provides functions for validating requests before they reach a session and
//! for quoting remote paths inside the helper commands of `execute_file`.

use crate::error::{FleetError, Result};

/// Sanitize a command before execution
///
/// This function:
/// - Validates that the command is not empty
/// - Trims whitespace
/// - Checks length against max_chars limit
///
/// # Examples
/// ```
/// use ssh_fleet::ssh::sanitize::sanitize_command;
///
/// let cmd = sanitize_command("  ls -la  ", Some(1000)).unwrap();
/// assert_eq!(cmd, "ls -la");
///
/// // Too long command
/// let result = sanitize_command("a".repeat(100).as_str(), Some(50));
/// assert!(result.is_err());
/// ```
pub fn sanitize_command(command: &str, max_chars: Option<usize>) -> Result<String> {
    let trimmed = command.trim();

    if trimmed.is_empty() {
        return Err(FleetError::invalid_params("Command cannot be empty"));
    }

    if let Some(max) = max_chars {
        if trimmed.len() > max {
            return Err(FleetError::invalid_params(format!(
                "Command is too long (max {} characters, got {})",
                max,
                trimmed.len()
            )));
        }
    }

    Ok(trimmed.to_string())
}

/// Validate a remote path used by push, pull and execute_file
pub fn validate_remote_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(FleetError::invalid_params("Remote path cannot be empty"));
    }
    if path.contains(['\0', '\n', '\r']) {
        return Err(FleetError::invalid_params(
            "Remote path contains control characters",
        ));
    }
    Ok(())
}

/// Escape a string for use inside a single-quoted shell string
///
/// # Example
/// ```
/// use ssh_fleet::ssh::sanitize::escape_for_shell;
///
/// let escaped = escape_for_shell("it's");
/// assert_eq!(escaped, "it'\"'\"'s");
/// ```
pub fn escape_for_shell(value: &str) -> String {
    // 'word' becomes '"'"'word'"'"': end quote, literal quote, reopen quote
    value.replace('\'', "'\"'\"'")
}

/// Quote a value as one single-quoted shell word
///
/// # Example
/// ```
/// use ssh_fleet::ssh::sanitize::shell_quote;
///
/// assert_eq!(shell_quote("/tmp/my script.sh"), "'/tmp/my script.sh'");
/// ```
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", escape_for_shell(value))
}

/// Command that runs an uploaded script by path
///
/// Relative paths get a `./` prefix so the shell does not search `PATH`.
pub fn script_invocation(remote_path: &str) -> String {
    if remote_path.contains('/') {
        shell_quote(remote_path)
    } else {
        format!("./{}", shell_quote(remote_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_command_valid() {
        let result = sanitize_command("ls -la", Some(1000));
        assert_eq!(result.unwrap(), "ls -la");
    }

    #[test]
    fn test_sanitize_command_trims_whitespace() {
        let result = sanitize_command("  ls -la  ", Some(1000));
        assert_eq!(result.unwrap(), "ls -la");
    }

    #[test]
    fn test_sanitize_command_empty() {
        let result = sanitize_command("", Some(1000));
        assert!(result.unwrap_err().to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_sanitize_command_whitespace_only() {
        let result = sanitize_command("   ", None);
        assert!(result.unwrap_err().to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_sanitize_command_too_long() {
        let long_cmd = "a".repeat(100);
        let result = sanitize_command(&long_cmd, Some(50));
        assert!(result.unwrap_err().to_string().contains("too long"));
    }

    #[test]
    fn test_sanitize_command_exactly_at_limit() {
        let cmd = "a".repeat(50);
        assert!(sanitize_command(&cmd, Some(50)).is_ok());
    }

    #[test]
    fn test_sanitize_command_unlimited() {
        let long_cmd = "a".repeat(10000);
        assert!(sanitize_command(&long_cmd, None).is_ok());
    }

    #[test]
    fn test_validate_remote_path() {
        assert!(validate_remote_path("/tmp/deploy.sh").is_ok());
        assert!(validate_remote_path("script.sh").is_ok());
        assert!(validate_remote_path("").is_err());
        assert!(validate_remote_path("  ").is_err());
        assert!(validate_remote_path("/tmp/a\nrm -rf /").is_err());
    }

    #[test]
    fn test_shell_quote_with_quotes() {
        assert_eq!(shell_quote("echo 'hello'"), "'echo '\"'\"'hello'\"'\"''");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_script_invocation() {
        assert_eq!(script_invocation("/tmp/run.sh"), "'/tmp/run.sh'");
        assert_eq!(script_invocation("run.sh"), "./'run.sh'");
    }
}

// Human-readable error messages for dssh

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;
use thiserror::Error;

/// Initialize color output based on TTY detection and NO_COLOR environment variable
fn should_use_colors() -> bool {
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    std::io::stderr().is_terminal()
}

/// All error types in dssh
#[derive(Debug)]
pub enum DsshError {
    /// Malformed address shorthand, port or tag string
    Format {
        input: String,
        message: String,
    },

    /// A target could not be turned into a host record
    Resolution {
        target: String,
        message: String,
        suggestion: Option<String>,
    },

    /// A jump host that itself wants to jump further
    NestedJump {
        target: String,
        hop: String,
        jump: String,
    },

    /// I/O errors
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// Alias table or SSH client configuration problems
    Config {
        message: String,
        path: Option<PathBuf>,
        suggestion: Option<String>,
    },

    /// SSH connection errors
    Ssh {
        host: String,
        message: String,
        suggestion: Option<String>,
    },

    /// SFTP transfer errors
    Transfer {
        host: String,
        message: String,
        path: Option<String>,
    },

    /// Nothing selected to run against
    NoTargets,
}

/// Errors produced while parsing `user@host:port` shorthand and tag lists
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("hostname is required non-empty string")]
    Empty,

    #[error("invalid hostname format: {0}")]
    Malformed(String),

    #[error("invalid port format: {0}")]
    InvalidPort(String),

    #[error("username is already set: {0}")]
    UserAlreadySet(String),

    #[error("port is already set: {0}")]
    PortAlreadySet(String),

    #[error("invalid tags: {0}")]
    InvalidTags(String),
}

impl FormatError {
    fn input(&self) -> &str {
        match self {
            FormatError::Empty => "",
            FormatError::Malformed(s)
            | FormatError::InvalidPort(s)
            | FormatError::UserAlreadySet(s)
            | FormatError::PortAlreadySet(s)
            | FormatError::InvalidTags(s) => s,
        }
    }
}

impl From<FormatError> for DsshError {
    fn from(err: FormatError) -> Self {
        DsshError::Format {
            input: err.input().to_string(),
            message: err.to_string(),
        }
    }
}

impl DsshError {
    pub fn io(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        DsshError::Io {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    pub fn ssh(host: impl Into<String>, message: impl Into<String>) -> Self {
        DsshError::Ssh {
            host: host.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// True for errors detected before any network or file I/O
    pub fn is_format(&self) -> bool {
        matches!(self, DsshError::Format { .. })
    }
}

impl std::error::Error for DsshError {}

impl fmt::Display for DsshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        match self {
            DsshError::Format { input, message } => {
                writeln!(f, "{}: {}", "FORMAT ERROR".red().bold(), message)?;
                if !input.is_empty() {
                    writeln!(f, "  {} {}", "Input:".dimmed(), input)?;
                }
                Ok(())
            }

            DsshError::Resolution {
                target,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "RESOLUTION ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Target:".dimmed(), target)?;

                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            DsshError::NestedJump { target, hop, jump } => {
                writeln!(
                    f,
                    "{}: nested jump not supported",
                    "RESOLUTION ERROR".red().bold()
                )?;
                writeln!(f, "  {} {}", "Target:".dimmed(), target)?;
                writeln!(f, "  {} {}", "Jump host:".dimmed(), hop)?;
                writeln!(f, "  {} {}", "Its jump:".dimmed(), jump)?;
                writeln!(f)?;
                writeln!(
                    f,
                    "{}: list every hop in the target's jump setting instead, e.g. \"{},{}\"",
                    "Hint".yellow().bold(),
                    jump,
                    hop
                )?;
                Ok(())
            }

            DsshError::Io { message, path } => {
                writeln!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            DsshError::Config {
                message,
                path,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "CONFIG ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "File:".dimmed(), path.display())?;
                }

                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            DsshError::Ssh {
                host,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "SSH ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;

                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            DsshError::Transfer {
                host,
                message,
                path,
            } => {
                writeln!(f, "{}: {}", "TRANSFER ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path)?;
                }
                Ok(())
            }

            DsshError::NoTargets => {
                writeln!(
                    f,
                    "{}: one of \"<host>\" or \"--host <host>\" or \"--tags\" is required!",
                    "ERROR".red().bold()
                )
            }
        }
    }
}

/// Suggest a fix for common connection failures
pub fn ssh_connection_suggestion(e: &std::io::Error) -> Option<String> {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Some("Ensure SSH service is running on the target host".to_string())
        }
        std::io::ErrorKind::TimedOut => {
            Some("Check network connectivity and firewall rules".to_string())
        }
        std::io::ErrorKind::PermissionDenied => {
            Some("Check SSH key permissions and authentication".to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_jump_display() {
        let err = DsshError::NestedJump {
            target: "web".to_string(),
            hop: "bastion".to_string(),
            jump: "gateway".to_string(),
        };

        let output = format!("{}", err);
        let clean_output = console::strip_ansi_codes(&output);

        assert!(clean_output.contains("nested jump not supported"));
        assert!(clean_output.contains("Jump host: bastion"));
        assert!(clean_output.contains("\"gateway,bastion\""));
    }

    #[test]
    fn test_format_error_converts() {
        let err: DsshError = FormatError::InvalidPort("70000".to_string()).into();

        assert!(err.is_format());
        let clean_output = console::strip_ansi_codes(&format!("{}", err)).to_string();
        assert!(clean_output.contains("invalid port format: 70000"));
        assert!(clean_output.contains("Input: 70000"));
    }

    #[test]
    fn test_ssh_suggestion() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(ssh_connection_suggestion(&refused).is_some());

        let other = std::io::Error::from(std::io::ErrorKind::Other);
        assert!(ssh_connection_suggestion(&other).is_none());
    }
}

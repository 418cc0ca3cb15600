//! Top-level error taxonomy for the fleet engine.
//!
//! Every component (pool, channel manager, traffic tester, iperf
//! orchestrator, config loader) produces a [`FleetError`] so that callers —
//! the CLI and the host façade — can match on a single set of categories
//! regardless of which component failed.

use thiserror::Error;

use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed for {host}: {reason}")]
    Auth { host: String, reason: String },

    #[error("host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("protocol error on {host}: {reason}")]
    Protocol { host: String, reason: String },

    #[error("operation on {host} timed out after {timeout_secs}s")]
    Timeout { host: String, timeout_secs: u64 },

    #[error("remote command failed on {host}: {reason}")]
    RemoteExec { host: String, reason: String },

    #[error("failed to parse output: {0}")]
    Parse(String),

    #[error("local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),
}

impl FleetError {
    /// Category name used for log fields and exported result rows.
    pub fn category(&self) -> &'static str {
        match self {
            FleetError::Config(_) => "config",
            FleetError::Auth { .. } => "auth",
            FleetError::Unreachable { .. } => "unreachable",
            FleetError::Protocol { .. } => "protocol",
            FleetError::Timeout { .. } => "timeout",
            FleetError::RemoteExec { .. } => "remote_exec",
            FleetError::Parse(_) => "parse",
            FleetError::LocalIo(_) => "local_io",
        }
    }

    /// Whether a failed connection attempt for this error is worth retrying
    /// with backoff (mirrors the Python original's retry predicate).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::Protocol { .. } | FleetError::Auth { .. } | FleetError::Unreachable { .. }
        )
    }

    pub fn unreachable(host: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        FleetError::Unreachable {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(host: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        FleetError::Protocol {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    pub fn auth(host: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        FleetError::Auth {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    pub fn from_ssh(host: impl Into<String>, err: SshError) -> Self {
        let host = host.into();
        match err {
            SshError::AuthenticationFailed(reason) => FleetError::Auth { host, reason },
            SshError::ConnectionFailed(reason) | SshError::Timeout(reason) => {
                FleetError::Unreachable { host, reason }
            }
            other => FleetError::Protocol {
                host,
                reason: other.to_string(),
            },
        }
    }
}

impl serde::Serialize for FleetError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

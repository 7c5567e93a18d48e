use thiserror::Error;

use crate::log::LogEntry;
use crate::relay::ExistingRegistration;

/// Failures talking to the relay's REST API
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Server name '{name}' is already registered: {message}")]
    NameTaken {
        name: String,
        message: String,
        existing: Option<ExistingRegistration>,
    },

    #[error("Relay request failed: HTTP {status} {body}")]
    Http { status: u16, body: String },

    #[error("Relay unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid relay request: {0}")]
    Validation(String),
}

impl RelayError {
    pub fn is_name_taken(&self) -> bool {
        matches!(self, Self::NameTaken { .. })
    }
}

/// Failures that stop a tunnel from starting
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Registration failed: {0}")]
    Registration(#[from] RelayError),

    #[error("Tunnel client is already running")]
    AlreadyRunning,

    #[error("Tunnel client has been stopped")]
    Stopped,

    #[error("Name prompt failed: {0}")]
    Prompt(String),

    #[error("Tunnel '{name}' did not connect within {waited_secs}s (last error: {last_error})")]
    Timeout {
        name: String,
        waited_secs: u64,
        last_error: String,
        log: Vec<LogEntry>,
    },
}

//! Error types for backline

use crate::common::ServerId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Membership Errors ===
    #[error("Server {0} is not tracked")]
    NotTracked(ServerId),

    // === Placement Errors ===
    #[error("No backup available that satisfies placement constraints")]
    NoCandidate,

    // === Network Errors ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Ping nonce mismatch: expected {expected:#x}, got {got:#x}")]
    NonceMismatch { expected: u64, got: u64 },

    // === Lifecycle Errors ===
    #[error("Failure detector is already running")]
    AlreadyRunning,

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Transport(_) | Error::NoCandidate | Error::NotTracked(_)
        )
    }

    /// Did the peer fail to answer (as opposed to answering wrongly or us
    /// misusing the API)?
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Transport(_) | Error::NonceMismatch { .. }
        )
    }
}

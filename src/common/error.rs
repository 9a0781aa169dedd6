//! Error types for ringkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Client Errors ===
    #[error("Not connected to any server")]
    NotConnected,

    #[error("Argument too long: {0}")]
    ArgumentTooLong(String),

    // === Cluster-state Errors ===
    #[error("Server not responsible for key")]
    NotResponsible,

    #[error("Server is write-locked")]
    WriteLocked,

    #[error("Server is stopped")]
    Stopped,

    // === Replication Errors ===
    #[error("Range transfer to {target} failed: {reason}")]
    Transfer { target: String, reason: String },

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Protocol Errors ===
    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Transient cluster states (stopped, write-locked, not responsible) are
    /// resolved by waiting or refreshing ring metadata; they must never
    /// surface to the end user as failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotResponsible | Error::WriteLocked | Error::Stopped
        )
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

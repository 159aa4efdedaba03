//! Error types for sftp-sync
//!
//! Three layers, matching how failures propagate:
//! - [`ConnectError`]: fatal, raised while establishing the session
//! - [`OpError`]: per-operation, split into transient and permanent kinds
//! - [`SyncError`]: fatal run-level errors surfaced by the orchestrator

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for fatal run-level failures
pub type SyncResult<T> = Result<T, SyncError>;

/// Failure to establish an authenticated SSH/SFTP session
///
/// All variants are fatal: the run aborts before any transfer.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Connection attempt exceeded the configured timeout
    #[error("connection to {host}:{port} timed out after {timeout_secs}s")]
    Timeout {
        host: String,
        port: u16,
        timeout_secs: u64,
    },

    /// Server rejected every configured authentication method
    #[error("authentication rejected for user '{username}': {message}")]
    AuthRejected { username: String, message: String },

    /// TCP connection could not be established
    #[error("host {host}:{port} unreachable: {message}")]
    HostUnreachable {
        host: String,
        port: u16,
        message: String,
    },

    /// SSH handshake or SFTP channel negotiation failed
    #[error("protocol mismatch with {host}: {message}")]
    ProtocolMismatch { host: String, message: String },
}

/// A single remote operation failed
///
/// Transient kinds are eligible for retry with backoff; permanent kinds are
/// recorded and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// Network dropped or timed out mid-operation (transient)
    #[error("network interrupted: {0}")]
    NetworkInterrupted(String),

    /// Remote content did not match the local file after upload (transient)
    #[error("hash mismatch after upload: expected {expected}, remote has {actual}")]
    HashMismatch { expected: String, actual: String },

    /// SFTP channel refused the request, typically under load (transient)
    #[error("sftp channel busy")]
    ChannelBusy,

    /// Server denied the operation (permanent)
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Path does not exist or cannot be represented remotely (permanent)
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Skipped because an operation it depends on failed (permanent)
    #[error("dependency failed: {0}")]
    DependencyFailed(String),

    /// Run was cancelled before this operation was attempted
    #[error("cancelled")]
    Cancelled,
}

impl OpError {
    /// Whether the retry policy applies to this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OpError::NetworkInterrupted(_) | OpError::HashMismatch { .. } | OpError::ChannelBusy
        )
    }
}

/// Fatal run-level error
///
/// Any of these aborts the run with no partial transfer result; per-operation
/// failures are captured in [`TransferResult`](crate::sync::TransferResult)
/// instead.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Session could not be established
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Remote target tree could not be listed
    #[error("failed to list remote tree at {path}: {source}")]
    RemoteListFailed { path: PathBuf, source: OpError },

    /// Remote target root could not be created
    #[error("failed to prepare remote root {path}: {source}")]
    RemoteRootFailed { path: PathBuf, source: OpError },

    /// Local source tree could not be walked
    #[error("failed to walk local tree at {path}: {message}")]
    LocalWalkFailed { path: PathBuf, message: String },

    /// Configuration is invalid or incomplete
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

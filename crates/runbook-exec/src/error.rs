//! Error types for runbook-exec

use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

use crate::secrets::SecretError;

/// Failure of a local command, SSH operation or secret lookup
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// TCP connect, SSH handshake or channel open failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Server rejected the credentials
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Local command exceeded its timeout and was killed
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Limit that was exceeded
        timeout: Duration,
    },

    /// Private key could not be loaded or decrypted
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Shell could not be started
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// Local I/O failed
    #[error("I/O error: {0}")]
    IoError(String),

    /// SFTP operation failed on an open session
    #[error("file transfer failed: {0}")]
    TransferFailed(String),

    /// Session already closed
    #[error("not connected")]
    NotConnected,

    /// Target, options or store are unusable as given
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Secret lookup failed
    #[error(transparent)]
    Secret(#[from] SecretError),
}

impl ExecError {
    /// `IoError` prefixed with what was being accessed
    pub(crate) fn io(context: impl Display, err: impl Display) -> Self {
        ExecError::IoError(format!("{context}: {err}"))
    }

    /// `TransferFailed` prefixed with the remote path
    pub(crate) fn transfer(remote: impl Display, err: impl Display) -> Self {
        ExecError::TransferFailed(format!("{remote}: {err}"))
    }
}

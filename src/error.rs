//! Error types for the relay
//!
//! Every failure is fatal: errors bubble up to `main`, which logs them and
//! exits with a failure status. Device attributes are restored on the way
//! out by `DeviceSet`'s drop.

use std::io;
use std::path::PathBuf;

use nix::sys::signal::Signal;

use crate::app::ConfigError;
use crate::term::MAX_DEVICES;

/// Relay error type
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Too many devices specified (at most {MAX_DEVICES})")]
    TooManyDevices,

    #[error("Failed to open device {path}: {source}")]
    OpenDevice {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read terminal attributes of {path}: {source}")]
    Capture {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to open log file {path}: {source}")]
    OpenLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to allocate PTY: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("Failed to create readiness pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("Failed to create session: {0}")]
    Setsid(#[source] nix::Error),

    #[error("Failed to set terminal attributes on {endpoint}: {source}")]
    SetAttributes {
        endpoint: String,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to set non-blocking mode on {endpoint}: {source}")]
    NonBlocking {
        endpoint: String,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to set up signal handling: {0}")]
    Signals(#[source] nix::Error),

    #[error("Failed to duplicate file descriptor: {0}")]
    Dup2(#[source] nix::Error),

    #[error("Argument contains an interior NUL byte: {0:?}")]
    InvalidArgument(String),

    #[error("Failed to execute {command}: {source}")]
    Exec {
        command: String,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to poll: {0}")]
    Poll(#[source] nix::Error),

    #[error("Failed to read from {endpoint}: {source}")]
    Read {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write to {endpoint}: {source}")]
    Write {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("End of file on {0}")]
    EndOfFile(String),

    #[error("PTY session closed")]
    SessionClosed,

    #[error("Relay terminated by {0}")]
    Terminated(Signal),

    #[error("Failed to send readiness signal: {0}")]
    HandshakeSend(#[source] io::Error),

    #[error("Failed to receive readiness signal: {0}")]
    HandshakeReceive(#[source] io::Error),

    #[error("Relay closed the readiness pipe before signalling")]
    HandshakeClosed,
}

impl RelayError {
    /// Errors caused by what the user asked for, reported before any fork
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            RelayError::Config(_)
                | RelayError::TooManyDevices
                | RelayError::OpenDevice { .. }
                | RelayError::Capture { .. }
                | RelayError::OpenLog { .. }
                | RelayError::InvalidArgument(_)
        )
    }

    /// Ways the relay ends once the command is running that are not faults
    pub fn is_shutdown(&self) -> bool {
        matches!(self, RelayError::SessionClosed | RelayError::Terminated(_))
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

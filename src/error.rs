//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes of a distributed
//! instrument-control system.
//!
//! ## Error taxonomy
//!
//! - **`ConnectivityLost`**: the TCP link to a device dropped or could not be
//!   established within the configured retry budget. Recovery logic matches
//!   on this variant to tear a link down and mark it disconnected.
//! - **`NotConnected`**: a command was issued on a link that is not
//!   connected. Caller error, reported immediately and never retried.
//! - **`Timeout`**: a command reply did not arrive within the per-call
//!   reply window. The link stays up; the caller decides what to do.
//! - **`Protocol`**: the device answered, but with something the driver
//!   could not interpret.
//! - **`Precondition`**: a state-machine precondition was violated (arming
//!   twice, ending a scan that is not running, setting the experiment while
//!   a scan runs). Always synchronous and specific.
//! - **`Remote`**: a call through the RPC client boundary failed.
//! - **`Io`** / **`Config`** / **`Json`**: wrapped lower-level failures.
//!
//! Distinguishing `ConnectivityLost` from `Protocol` and `Timeout` matters:
//! the keep-alive watchdog counts timeouts but only tears the link down on a
//! disconnection, so the variants must stay pattern-matchable.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Connection to device lost: {0}")]
    ConnectivityLost(String),

    #[error("Device not connected")]
    NotConnected,

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DaqError {
    /// True if the error signals that the device connection is gone
    /// (as opposed to a protocol hiccup or a slow reply).
    pub fn is_disconnection(&self) -> bool {
        matches!(self, DaqError::ConnectivityLost(_) | DaqError::NotConnected)
    }
}

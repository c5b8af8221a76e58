//! Unified error handling for the hello-discovery crate
//!
//! This module provides a single `Error` enum covering the discovery,
//! registration and reconnect paths, while module-local errors such as
//! [`StoreError`] and [`ConfigError`] stay available where they are produced.
//!
//! # Taxonomy
//!
//! - `StoreUnavailable` - the coordination store cannot be reached
//! - `LeaseGrantFailed` / `LeaseRenewalFailed` - lease lifecycle failures
//! - `WatchStream` - the resolver's update stream broke
//! - `NoAddressesAvailable` - an empty address set met a fail-fast pick
//! - `ReconnectExhausted` - the reconnect controller gave up
//!
//! # Usage
//!
//! ```rust,ignore
//! use hello_discovery::error::{Error, ErrorCategory};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!("retrying: {err}");
//!     } else {
//!         tracing::error!(category = ?err.category(), "fatal: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::store::StoreError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Coordination store connectivity
    Store,
    /// Lease grant and renewal
    Lease,
    /// Watch stream and resolution
    Watch,
    /// RPC calls and transport
    Rpc,
    /// Configuration and validation
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short label used in log fields
    pub fn label(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Lease => "lease",
            Self::Watch => "watch",
            Self::Rpc => "rpc",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the hello-discovery crate
#[derive(Error, Debug)]
pub enum Error {
    /// Network/connection failure towards the coordination store
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store rejected the lease request
    #[error("Lease grant failed: {0}")]
    LeaseGrantFailed(String),

    /// A keepalive renewal did not go through
    #[error("Lease {lease_id} renewal failed: {reason}")]
    LeaseRenewalFailed { lease_id: i64, reason: String },

    /// The resolver's watch stream errored or closed
    #[error("Watch stream error: {0}")]
    WatchStream(String),

    /// No live addresses for the service (fail-fast pick only)
    #[error("No addresses available for service '{service}'")]
    NoAddressesAvailable { service: String },

    /// The reconnect controller exceeded its attempt budget
    #[error("Reconnect exhausted after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// The owning client was closed
    #[error("Client closed")]
    Closed,

    /// An address or store key could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A resolver target could not be parsed
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Other coordination store errors
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Application-level RPC status
    #[error("RPC error: {0}")]
    Rpc(#[from] tonic::Status),

    /// gRPC transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) => true,
            Self::LeaseGrantFailed(_) => false,
            Self::LeaseRenewalFailed { .. } => true,
            Self::WatchStream(_) => true,
            Self::NoAddressesAvailable { .. } => true,
            Self::ReconnectExhausted { .. } => false,
            Self::Closed => false,
            Self::InvalidAddress(_) | Self::InvalidTarget(_) => false,
            Self::Store(e) => e.is_transient(),
            Self::Rpc(status) => crate::retry::is_retryable(status),
            Self::Transport(_) => true,
            Self::Http(_) => true,
            Self::Json(_) => false,
            Self::Io(_) => true,
            Self::Config(_) => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StoreUnavailable(_) | Self::Store(_) | Self::Http(_) => ErrorCategory::Store,
            Self::LeaseGrantFailed(_) | Self::LeaseRenewalFailed { .. } => ErrorCategory::Lease,
            Self::WatchStream(_) | Self::NoAddressesAvailable { .. } => ErrorCategory::Watch,
            Self::ReconnectExhausted { .. } | Self::Rpc(_) | Self::Transport(_) | Self::Closed => {
                ErrorCategory::Rpc
            }
            Self::InvalidAddress(_) | Self::InvalidTarget(_) | Self::Config(_) => {
                ErrorCategory::Config
            }
            Self::Json(_) | Self::Io(_) => ErrorCategory::Other,
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::WatchClosed(msg) => Self::WatchStream(msg),
            other => Self::Store(other),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

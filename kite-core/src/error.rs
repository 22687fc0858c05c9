//! Error types shared by every kite crate

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid extension point, blank extension name, unresolvable
    /// implementation type or an unusable configuration value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No such extension '{name}' for extension point {extension_point}")]
    ExtensionNotFound {
        extension_point: String,
        name: String,
    },

    /// No endpoint or local instance is registered for the service key.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("No response received for interface {interface}")]
    ResponseMissing { interface: String },

    #[error("Response does not match request {expected} (got {actual}) for interface {interface}")]
    RequestMismatch {
        interface: String,
        expected: String,
        actual: String,
    },

    #[error("Invocation of {interface} failed: {message}")]
    InvocationFailed { interface: String, message: String },

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether a failed call may be attempted again.
    ///
    /// Only transport level failures qualify; correlation and not-found
    /// errors are surfaced to the caller unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Io(e) => crate::resilience::retry::is_transient_io_error(e),
            _ => false,
        }
    }
}

/// Result type for kite operations
pub type Result<T> = std::result::Result<T, Error>;

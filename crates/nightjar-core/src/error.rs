//! Error types for the shared kernel.

/// The result type used throughout nightjar-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kernel operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identity string failed validation.
    #[error("invalid identity: {message}")]
    InvalidIdentity {
        /// Description of the validation failure.
        message: String,
    },

    /// A configuration value is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration failure.
        message: String,
    },
}

impl Error {
    /// Creates a new identity validation error.
    #[must_use]
    pub fn invalid_identity(message: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

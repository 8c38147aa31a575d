//! Error types for the export worker domain.

use nightjar_core::{FileId, WorkerId};

/// The result type used throughout nightjar-worker.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating and running an export.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The run was cancelled by the host or a lost heartbeat.
    #[error("run cancelled")]
    Cancelled,

    /// Leadership was lost mid-run; another replica owns the lease.
    #[error("lease lost for worker {worker_id}")]
    LeaseLost {
        /// The workload whose lease was lost.
        worker_id: WorkerId,
    },

    /// A state store operation failed.
    #[error("store error: {message}")]
    Store {
        /// Description of the store failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Reading a page from the source view failed.
    #[error("page read failed at page {page}: {message}")]
    PageRead {
        /// The page that could not be read.
        page: u64,
        /// Description of the read failure.
        message: String,
    },

    /// Writing to an output file failed.
    #[error("write failed for file {file_id}: {message}")]
    Write {
        /// The output file whose write failed.
        file_id: FileId,
        /// Description of the write failure.
        message: String,
        /// The underlying I/O cause, if any.
        #[source]
        source: Option<std::io::Error>,
    },

    /// Publishing a completion event failed.
    #[error("publish failed for file {file_id}: {message}")]
    Publish {
        /// The output file whose event could not be published.
        file_id: FileId,
        /// Description of the publish failure.
        message: String,
    },

    /// A file's configured translator id is not in the registry.
    #[error("translator not registered: {translator_id}")]
    TranslatorNotRegistered {
        /// The unknown translator identifier.
        translator_id: String,
    },

    /// A row could not be rendered by a translator.
    #[error("translation failed for file {file_id}: {message}")]
    Translation {
        /// The output file whose translation failed.
        file_id: FileId,
        /// Description of the failure.
        message: String,
    },

    /// A configuration value is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration failure.
        message: String,
    },

    /// An error from the shared kernel.
    #[error("core error: {0}")]
    Core(#[from] nightjar_core::Error),
}

impl Error {
    /// Creates a new store error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new store error with a source.
    #[must_use]
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new write error from an I/O failure.
    #[must_use]
    pub fn write_io(file_id: FileId, message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Write {
            file_id,
            message: message.into(),
            source: Some(source),
        }
    }

    /// Returns true for failures worth retrying with backoff.
    ///
    /// Store, page-read, and publish failures are assumed transient;
    /// cancellation, lost leadership, write failures (handled by the
    /// resume protocol), and state inconsistencies are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store { .. } | Self::PageRead { .. } | Self::Publish { .. }
        )
    }
}

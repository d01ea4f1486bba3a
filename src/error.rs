//! Custom error types for the event builder.
//!
//! This module defines the primary error type, `EbError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the errors that can occur while reading, building and distributing
//! datagrams.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically TOML syntax errors or
//!   type mismatches in the configuration file or environment.
//! - **`Configuration`**: Semantic configuration errors (zero batch size, empty
//!   source list, unknown log level). Fatal, raised at construction time.
//! - **`Io`**: Wraps `std::io::Error` from file sources. Short reads are not
//!   errors; they are handled by the reader.
//! - **`Format`**: Corrupt framing or truncated datagrams. Corruption is not a
//!   transient condition, so format errors are never retried.
//! - **`Destination`**: The user destination callback failed; batch
//!   construction for the current chunk is aborted.
//! - **`UnsupportedDevice`**: No detector factory is registered for a
//!   `(dettype, software, version)` key. Recoverable: the detector is skipped.
//! - **`WorkerDisconnected`** / **`Worker`**: A worker task went away or its
//!   event handler failed.
//! - **`Join`**: A blocking task panicked or was cancelled.
//! - **`Metrics`**: Wraps `prometheus` registration and encoding errors.
//!
//! By using `#[from]`, `EbError` can be created from underlying error types with
//! the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type EbResult<T> = std::result::Result<T, EbError>;

/// Primary error type for the event builder.
#[derive(Error, Debug)]
pub enum EbError {
    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values parsed but are not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O failure on a chunk source.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed packet footer or truncated datagram.
    #[error("Format error: {0}")]
    Format(String),

    /// The destination callback failed for an event.
    #[error("Destination callback failed: {0}")]
    Destination(#[source] anyhow::Error),

    /// No detector implementation is registered for this version.
    #[error("Unsupported device version: {dettype}/{software} v{version}")]
    UnsupportedDevice {
        /// Detector type, e.g. `epix10ka`.
        dettype: String,
        /// Software (DRP class) name, e.g. `raw`.
        software: String,
        /// Dotted version string.
        version: String,
    },

    /// A worker's channel closed before the run finished.
    #[error("Worker {0} disconnected")]
    WorkerDisconnected(usize),

    /// A worker's event handler returned an error.
    #[error("Worker {worker} failed: {message}")]
    Worker {
        /// Worker (destination) id.
        worker: usize,
        /// Error reported by the handler.
        message: String,
    },

    /// A node or worker task panicked.
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A counter could not be registered or exported.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl EbError {
    /// Build a format error from anything displayable.
    pub fn format(message: impl Into<String>) -> Self {
        EbError::Format(message.into())
    }

    /// Whether the caller can continue after this error.
    ///
    /// Format and configuration errors are permanent. An unsupported device
    /// only disables that detector.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            EbError::UnsupportedDevice { .. } => true,
            EbError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            EbError::Config(_)
            | EbError::Configuration(_)
            | EbError::Format(_)
            | EbError::Destination(_)
            | EbError::WorkerDisconnected(_)
            | EbError::Worker { .. }
            | EbError::Join(_)
            | EbError::Metrics(_) => false,
        }
    }
}

//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Boxed error returned by recipe callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(hoard::cache::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(
        code(hoard::cache::config),
        help("Valid cache policies are \"off\", \"temporary\" and \"user\"")
    )]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Metadata store error
    #[error("Cache database error: {source}")]
    #[diagnostic(code(hoard::cache::database))]
    Database {
        /// The underlying SQLite error
        #[from]
        source: rusqlite::Error,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(hoard::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// The recipe callback failed to produce its artifact
    #[error("Failed to create cache entry for owner '{owner}': {source}")]
    #[diagnostic(
        code(hoard::cache::recipe),
        help("The partially written temporary file is discarded on the next attempt")
    )]
    Recipe {
        /// Owner tag of the recipe
        owner: String,
        /// Error raised by the callback
        #[source]
        source: BoxError,
    },

    /// The cache manager worker is no longer running
    #[error("Cache manager is not running")]
    #[diagnostic(code(hoard::cache::manager_stopped))]
    ManagerStopped,

    /// A second cache facade was constructed while one is alive
    #[error("A cache instance already exists in this process")]
    #[diagnostic(
        code(hoard::cache::already_initialized),
        help("Construct the cache once at startup and pass it to the code that needs it")
    )]
    AlreadyInitialized,

    /// Refused to operate on a path outside the cache directory
    #[error("Path is outside the cache directory: {}", path.display())]
    #[diagnostic(code(hoard::cache::outside_directory))]
    OutsideCacheDirectory {
        /// The offending path
        path: Box<Path>,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Wrap a failure raised by a recipe callback
    #[must_use]
    pub fn recipe(owner: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Recipe {
            owner: owner.into(),
            source: source.into(),
        }
    }

    /// Create an outside-of-cache error
    #[must_use]
    pub fn outside_cache(path: impl AsRef<Path>) -> Self {
        Self::OutsideCacheDirectory {
            path: path.as_ref().into(),
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

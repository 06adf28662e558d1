//! Error types and result handling for tap-duckdb.
//!
//! This module defines the main error type [`Error`], the value-level
//! [`CoercionError`], and a convenience [`Result`] type alias used
//! throughout the crate.
//!
//! Errors fall into two groups. Run-level errors (see [`Error::is_fatal`])
//! stop the whole invocation: the catalog cannot be reached, the state input
//! is malformed, or the configuration is invalid. Everything else is scoped to
//! a single stream: the stream is abandoned, the failure is recorded in the
//! run summary, and the remaining streams carry on.
//!
//! # Example
//!
//! ```rust
//! use tap_duckdb::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     Err(Error::Connection("database file is locked".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(e) if e.is_fatal() => eprintln!("Fatal: {}", e),
//!     Err(e) => eprintln!("Stream error: {}", e),
//! }
//! ```

use crate::sync::ReplicationMethod;
use thiserror::Error;

/// The main error type for tap-duckdb operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid config file or
    /// environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The query executor could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The catalog listing itself could not be read.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The requested replication method cannot be served for this stream.
    #[error("Replication method {method} is not supported for stream '{stream}'")]
    UnsupportedMethod {
        /// Stream the method was requested for
        stream: String,
        /// The rejected method
        method: ReplicationMethod,
    },

    /// A source value cannot be represented in its portable type.
    #[error("Stream '{stream}': {source}")]
    Coercion {
        /// Stream being extracted
        stream: String,
        /// The failing coercion
        #[source]
        source: CoercionError,
    },

    /// The selection document names a missing stream or an invalid
    /// replication key.
    #[error("Invalid selection for stream '{stream}': {message}")]
    InvalidSelection {
        /// Stream the selection refers to
        stream: String,
        /// What was wrong with it
        message: String,
    },

    /// The state input document is malformed.
    #[error("Invalid state document: {0}")]
    State(String),

    /// A query against the source failed or timed out.
    #[error("Query error: {0}")]
    Query(String),

    /// Rows arrived out of cursor order.
    #[error("Stream '{stream}': rows are not ordered by '{column}'")]
    OutOfOrder {
        /// Stream being extracted
        stream: String,
        /// The cursor column whose ordering was violated
        column: String,
    },

    /// The message protocol would have been violated.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization error when encoding messages or state.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from writing the message stream or state file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// DuckDB driver error.
    #[cfg(feature = "duckdb")]
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// A stop was requested (e.g., via Ctrl+C).
    ///
    /// This is not really an error but uses the error mechanism to cleanly
    /// leave the extraction loop after the current record.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Whether this error halts the whole run rather than a single stream.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Connection(_) | Error::Discovery(_) | Error::State(_)
        )
    }
}

/// A value that does not fit the portable type declared for its column.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot coerce {value} into {target} for column '{column}': {reason}")]
pub struct CoercionError {
    /// Column the value was read from (empty until attached by the extractor)
    pub column: String,
    /// Short rendering of the offending value
    pub value: String,
    /// Portable type the value was coerced into
    pub target: String,
    /// Why the value was rejected
    pub reason: String,
}

impl CoercionError {
    pub fn new(value: impl Into<String>, target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            column: String::new(),
            value: value.into(),
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn in_column(mut self, column: &str) -> Self {
        self.column = column.to_string();
        self
    }
}

/// A convenient Result type alias for tap-duckdb operations.
///
/// This is equivalent to `std::result::Result<T, tap_duckdb::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types and result handling for pg-mirror.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_mirror::{Error, Result};
//!
//! fn parse_flag(raw: &str) -> Result<bool> {
//!     match raw {
//!         "t" => Ok(true),
//!         "f" => Ok(false),
//!         other => Err(Error::IllegalArgument(format!("not a boolean: {other}"))),
//!     }
//! }
//!
//! match parse_flag("x") {
//!     Ok(v) => println!("parsed {v}"),
//!     Err(Error::IllegalArgument(msg)) => eprintln!("bad input: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-mirror operations.
///
/// Covers everything from configuration issues through wire decoding to
/// failures while applying changes on the destination database.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file or environment overrides.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding transaction envelopes.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed pgoutput payload: wrong leading tag or a read past the end.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal state does not allow the operation, e.g. a row change
    /// for a relation that was never announced.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A value could not be converted to its declared field type.
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// A replicated column uses a Postgres type with no known mapping.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Collector start-up failed (slot, publication or table metadata).
    #[error("Setup error: {0}")]
    Setup(String),

    /// A sink rejected a transaction.
    #[error("Sink error: {0}")]
    Sink(String),
}

impl Error {
    /// Returns true for errors that will not go away by retrying the same
    /// input: malformed wire data, unconvertible values and unknown types.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::IllegalState(_)
                | Error::IllegalArgument(_)
                | Error::NotImplemented(_)
                | Error::Config(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// A convenient Result type alias for pg-mirror operations.
///
/// This is equivalent to `std::result::Result<T, pg_mirror::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

//! # Error Handling
//!
//! A single error enum covers every failure mode in tidelog. Callers match on
//! the variant they care about (usually [`Error::Conflict`]) and propagate the
//! rest with `?`.
//!
//! Background producers (record streams, subscriptions, the remote reader) do
//! not return errors to their consumers; they close their delivery channel and
//! leave a trace event behind. Everything on a direct call boundary returns
//! `Result`.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in tidelog operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Optimistic concurrency conflict: the stream was appended to since the
    /// caller last observed its version.
    ///
    /// Recovery is the usual optimistic loop: re-read the stream, re-apply,
    /// retry with the fresh version. The HTTP layer maps this to 400.
    #[error(
        "optimistic concurrency conflict on stream '{stream}': expected version {expected}, found {actual}"
    )]
    Conflict {
        /// The stream where the conflict occurred.
        stream: String,
        /// The version the caller expected.
        expected: u64,
        /// The actual current version.
        actual: u64,
    },

    /// The requested operation is not supported by this store, e.g. an
    /// ordinary append addressed to the `$all` stream.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem operation failed (creating store directories, etc).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A record or page could not be decoded into the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// HTTP request to a remote feed failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A data source name or option could not be parsed.
    #[error("config error: {0}")]
    Config(String),
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

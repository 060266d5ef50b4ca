//! Error taxonomy for the call-execution framework.
//!
//! Configuration and key-derivation errors are programmer errors: they are
//! never retried or swallowed. Remote-call failures are retried only when the
//! retry predicate matches them; everything else propagates on the first
//! attempt.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of a single remote-call attempt.
#[derive(Debug, Error)]
pub enum CallError {
    /// The provider rejected the call for exceeding its rate limit.
    /// This is the designated retryable class.
    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    /// The per-attempt deadline elapsed and the in-flight attempt was
    /// cancelled. Consumes one retry slot like any other retryable failure.
    #[error("attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    /// The provider returned an error response. Not retried by default.
    #[error("remote call failed: {0}")]
    Remote(String),

    /// The request never reached the provider (connection, TLS, DNS).
    #[error("transport error: {0}")]
    Transport(String),

    /// The wrapped call was handed arguments it cannot decode.
    #[error("invalid call arguments: {0}")]
    InvalidArguments(String),
}

/// Error type for persistent store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store environment: {0}")]
    EnvOpen(String),

    #[error("failed to open store database: {0}")]
    DbOpen(String),

    /// Transaction-level failure. Treated as transient contention and
    /// retried a bounded number of times before surfacing.
    #[error("store transaction failed: {0}")]
    Transaction(String),

    #[error("store serialization failed: {0}")]
    Serialization(String),

    /// Delete of a key that was not present, with `allow_missing` unset.
    #[error("key not found in store")]
    MissingKey,

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// A cache key component's canonical form embeds a transient memory
    /// address or object identity and can never hit on a repeat call.
    #[error("cache key contains a transient object representation: {0}")]
    UnstableCacheKey(String),

    /// A store was requested with no path and no configured default.
    #[error("no default cache path configured")]
    NoDefaultPathConfigured,

    /// The call-log path does not carry the `.jsonl` extension.
    #[error("call log path must have a .jsonl extension: {0}")]
    InvalidLogPath(PathBuf),

    /// Every attempt failed with a retryable error; carries the full
    /// ordered failure history.
    #[error("max retries exceeded after {} attempts", .attempts.len())]
    MaxRetriesExceeded { attempts: Vec<CallError> },

    /// A non-retryable remote failure, propagated from the first attempt
    /// that raised it.
    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

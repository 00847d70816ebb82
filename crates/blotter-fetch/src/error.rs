//! Error types for the fetch pipeline.
//!
//! The taxonomy distinguishes what is retryable in place (transient
//! network faults, upstream 5xx) from what is not: rate limiting rotates
//! to another credential, parse failures will not improve on retry, and
//! an open circuit fails fast without touching the network.

use thiserror::Error;

/// Result type alias using `FetchError`.
pub type Result<T> = std::result::Result<T, FetchError>;

/// Errors surfaced by the fetch pipeline.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transient network failure (connection reset, DNS, transport).
    #[error("network error: {message}")]
    Network {
        /// Failure detail.
        message: String,
    },

    /// Request exceeded its per-call timeout.
    #[error("request timed out after {seconds}s")]
    Timeout {
        /// Timeout that was exceeded, in seconds.
        seconds: u64,
    },

    /// Upstream returned HTTP 429 for the credential in use.
    #[error("rate limited by upstream")]
    RateLimited,

    /// Upstream returned a 5xx response.
    #[error("upstream server error: HTTP {status}")]
    UpstreamServer {
        /// HTTP status code returned.
        status: u16,
    },

    /// Response shape did not match expectations; retrying will not help.
    #[error("parse error: {message}")]
    Parse {
        /// What failed to parse.
        message: String,
    },

    /// Circuit breaker is open for the partition; no network call was made.
    #[error("circuit open for partition {partition}")]
    CircuitOpen {
        /// Partition key whose circuit is open.
        partition: String,
    },

    /// Invalid configuration, fatal at startup.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is misconfigured.
        message: String,
    },

    /// Workers did not stop within the shutdown deadline.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// The deadline that was exceeded.
        timeout: std::time::Duration,
    },

    /// Storage layer failure.
    #[error(transparent)]
    Storage(#[from] blotter_core::CoreError),
}

impl FetchError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout { seconds }
    }

    /// Creates a parse error from a message.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into() }
    }

    /// Creates a circuit-open error for a partition.
    pub fn circuit_open(partition: impl Into<String>) -> Self {
        Self::CircuitOpen { partition: partition.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the same call can meaningfully be retried in place.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::UpstreamServer { .. }
        )
    }
}

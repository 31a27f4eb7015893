//! Error types for the reqwest-probe-pool crate.

use thiserror::Error;

/// Error returned when no eligible, rested proxy is available in the pool.
#[derive(Debug, Error)]
#[error("No proxy available in pool")]
pub struct NoProxyAvailable;

/// Error returned by a [`ProxySource`](crate::source::ProxySource) fetch.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The request to the proxy vendor failed.
    #[error("proxy source request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The proxy vendor answered with a non-success status.
    #[error("proxy source answered with status {0}")]
    Status(u16),
    /// A local proxy list could not be read.
    #[error("proxy list could not be read: {0}")]
    Io(#[from] std::io::Error),
    /// The vendor answer could not be interpreted.
    #[error("invalid proxy source response: {0}")]
    InvalidResponse(String),
}

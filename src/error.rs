//! Error taxonomy for the alarm engine.
//!
//! Every failure the core can surface maps onto one [`AlarmError`] variant.
//! Failures are isolated per event and per gateway: callers log them and
//! move on to the next event or reading. Only [`AlarmError::ConfigLoad`]
//! halts alarm generation for a gateway, until a later reload succeeds.

use thiserror::Error;

/// Errors produced by the registry, store, coordinator and pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AlarmError {
    /// Threshold fetch failed; the gateway stays (or remains) unloaded.
    #[error("Threshold load failed for gateway '{gateway_id}': {reason}")]
    ConfigLoad { gateway_id: String, reason: String },

    /// Persisting one alarm event failed.
    #[error("Alarm append failed: {0}")]
    StoreAppend(String),

    /// Fetching a page of alarm records failed.
    #[error("Alarm query failed: {0}")]
    StoreQuery(String),

    /// The reading's `data` field is not a category -> subcategory -> number map.
    #[error("Malformed reading: {0}")]
    MalformedReading(String),

    /// `page` must be >= 1 and `page_size` > 0.
    #[error("Invalid page request: page={page}, page_size={page_size}")]
    InvalidPage { page: u32, page_size: u32 },

    /// The subscription handle was never issued or has been unsubscribed.
    #[error("Unknown subscription {0}")]
    UnknownSubscription(uuid::Uuid),

    /// The reading source has no open channel for this gateway.
    #[error("Reading source closed for gateway '{0}'")]
    SourceClosed(String),
}

/// Convenience `Result` alias for the alarm engine.
pub type Result<T> = std::result::Result<T, AlarmError>;

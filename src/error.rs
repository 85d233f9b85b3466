use thiserror::Error;

/// Venue-level failure classification, reported by an [`ExchangeAdapter`](crate::adapters::ExchangeAdapter).
///
/// Adapters are expected to classify every failure into one of these buckets so the
/// core can decide whether to retry, swallow, or bubble the error.
#[derive(Debug, Clone, Error)]
pub enum VenueErrorKind {
    #[error("rate limited by venue (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("venue rejected the request: {0}")]
    Rejected(String),

    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    #[error("fatal venue error: {0}")]
    Fatal(String),
}

/// The typed error returned by every public operation in the core.
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("config error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("precondition not met: {0}")]
    Precondition(String),

    #[error("venue error on {venue}: {kind}")]
    Venue {
        venue: String,
        #[source]
        kind: VenueErrorKind,
    },

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("hedge imbalance exceeded tolerance: {0}")]
    Imbalance(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("lock acquisition timed out for `{0}`")]
    LockAcquisitionTimeout(String),
}

impl KeeperError {
    pub fn venue(venue: impl Into<String>, kind: VenueErrorKind) -> Self {
        KeeperError::Venue {
            venue: venue.into(),
            kind,
        }
    }

    /// Whether a [`crate::retry::RetryPolicy`] should consider this error retryable
    /// by default, absent a caller-supplied classifier. Only transient, venue-side
    /// conditions are retryable; validation/precondition/rollback failures never are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KeeperError::Venue {
                kind: VenueErrorKind::RateLimited { .. } | VenueErrorKind::NetworkTransient(_),
                ..
            } | KeeperError::Timeout(_)
        )
    }
}

//! Provider-independent error taxonomy.
//!
//! Adapter error types are converted into [`MailError`] at the driver
//! boundary, so the ledger, queue and cache only ever see these variants.

use std::time::Duration;

use thiserror::Error;

/// Result alias used by everything above the provider adapters
pub type MailResult<T> = Result<T, MailError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailError {
    /// No active connection, or the backend rejected our credentials
    #[error("not authenticated: {0}")]
    Unauthenticated(String),

    /// Network or backend outage; retried before being surfaced
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Sync state or page token is stale; recovered by a full resync
    #[error("sync cursor is no longer valid")]
    InvalidCursor,

    /// The entity no longer exists upstream
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request payload; never retried
    #[error("invalid request: {0}")]
    ValidationError(String),

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
}

impl MailError {
    /// Whether the mutation queue may retry the failed call
    pub fn is_transient(&self) -> bool {
        matches!(self, MailError::ProviderUnavailable(_))
    }

    /// Short machine-readable name, used in logs and failure events
    pub fn kind(&self) -> &'static str {
        match self {
            MailError::Unauthenticated(_) => "unauthenticated",
            MailError::ProviderUnavailable(_) => "provider_unavailable",
            MailError::InvalidCursor => "invalid_cursor",
            MailError::NotFound(_) => "not_found",
            MailError::ValidationError(_) => "validation_error",
            MailError::RateLimited { .. } => "rate_limited",
        }
    }
}

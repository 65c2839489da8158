//! Error types for flowtime-sync

use thiserror::Error;

/// Result type alias using flowtime-sync's `SyncError`
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while syncing.
///
/// None of these ever reach the UI; transient failures leave the ledger and
/// queue untouched and are retried on the next debounce cycle.
#[derive(Error, Debug)]
pub enum SyncError {
    /// HTTP transport failure
    #[error("Sync HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote API rejected the request
    #[error("Sync API error: {message} ({status})")]
    Api {
        /// HTTP status code
        status: u16,
        /// Message extracted from the response body
        message: String,
    },

    /// Remote payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Remote schema is out of step with this client and the stripped
    /// resend failed too; cleared by the next backend migration
    #[error("Remote schema drift: {0}")]
    SchemaDrift(String),

    /// Request was malformed before it ever reached the network
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Local store or database failure
    #[error(transparent)]
    Core(#[from] flowtime_core::Error),

    /// Engine was stopped while the operation was in flight
    #[error("Engine is not running")]
    NotRunning,
}

impl SyncError {
    /// Whether the operation should simply be retried later.
    ///
    /// Covers transport failures and server-side conditions (5xx, 429); a
    /// 4xx is a bug on our side and retrying will not help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::SchemaDrift(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

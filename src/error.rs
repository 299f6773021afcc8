// =============================================================================
// Error taxonomy for the sync engine
// =============================================================================
//
// Only `InvalidSession` and `BindFailed` ever surface to callers (from
// `SyncOrchestrator::start`). Everything else is recovered locally: storage
// errors retry on the next flush, fetch errors back off inside the backfill
// workers, stream errors are the market source's problem to reconnect from.
// =============================================================================

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// `start` received an empty symbol or a non-positive interval.
    #[error("invalid session: symbol={symbol:?} interval_ms={interval_ms}")]
    InvalidSession { symbol: String, interval_ms: i64 },

    /// The repository could not create or open its backing file.
    #[error("bind failed for {path}")]
    BindFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Query issued against a repository that was never bound.
    #[error("repository not bound")]
    NotBound,

    /// Transient persist or read failure; retried on the next flush.
    #[error("storage I/O error")]
    Storage(#[from] std::io::Error),

    /// The market source returned an error while fetching a range.
    #[error("fetch failed: {0}")]
    Fetch(#[from] anyhow::Error),

    /// Delivered via the live stream's error callback.
    #[error("live stream error code={code}: {message}")]
    Stream { code: i32, message: String },
}

pub type SyncResult<T> = Result<T, SyncError>;

//! Error types shared across PrcDrop crates.

use thiserror::Error;

/// Why a single price probe did not yield a price.
///
/// Every variant is transient from the scheduler's point of view: it bumps the
/// consecutive-failure counter and hands the decision to the retry policy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProbeFailure {
    /// The page loaded but no element matched the selector.
    #[error("price element not found: {0}")]
    NotFound(String),
    /// The probe did not finish within its time budget.
    #[error("probe timed out after {0}s")]
    Timeout(u64),
    /// An element matched but its text is not a price.
    #[error("unparsable price text: {0:?}")]
    ParseError(String),
    /// Transport or HTTP status error while fetching the page.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// The selector table has no entry for the page's domain.
    #[error("no selector for domain {0}")]
    NoSelector(String),
}

impl ProbeFailure {
    /// Short machine-friendly label, used in logs and persisted as the last error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeFailure::NotFound(_) => "not_found",
            ProbeFailure::Timeout(_) => "timeout",
            ProbeFailure::ParseError(_) => "parse_error",
            ProbeFailure::Fetch(_) => "fetch",
            ProbeFailure::NoSelector(_) => "no_selector",
        }
    }
}

/// Delivery failure reported by a notifier.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("SMTP delivery failed: {0}")]
    Smtp(String),

    #[error("HTTP delivery failed: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Top-level PrcDrop error.
#[derive(Debug, Error)]
pub enum PrcDropError {
    /// Missing or malformed input, rejected at the boundary. No state is created.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The target domain has no price selector.
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),

    #[error("probe failure: {0}")]
    Probe(#[from] ProbeFailure),

    /// Consecutive failures reached the retry budget.
    #[error("retries exhausted after {failures} failures for {id}")]
    RetriesExhausted { id: String, failures: u32 },

    #[error("notification failure: {0}")]
    Notification(#[from] NotifyError),

    /// Optimistic-concurrency collision. Recovered locally by re-reading.
    #[error("store conflict on {0}")]
    StoreConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PrcDropError>;

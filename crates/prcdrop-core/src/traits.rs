//! Seams to the outside world: price extraction and message delivery.

use async_trait::async_trait;

use crate::error::{NotifyError, ProbeFailure};
use crate::selectors::SelectorTable;

/// Fetches a product page and extracts its current price.
#[async_trait]
pub trait PriceProbe: Send + Sync {
    /// Probe `url` using the selector registered for its domain.
    async fn probe(&self, url: &str, selectors: &SelectorTable) -> Result<f64, ProbeFailure>;

    fn name(&self) -> &str;
}

/// Delivers a plain-text message to one recipient.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str, recipient: &str) -> Result<(), NotifyError>;

    /// Channel name for logs ("email", "webhook", ...).
    fn channel_name(&self) -> &str;
}

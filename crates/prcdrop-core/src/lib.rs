//! # PrcDrop Core
//!
//! Shared building blocks for the price-drop tracker: configuration, error
//! taxonomy, URL/price normalization, the hot-swappable selector table and the
//! traits behind which page probing and message delivery live.

pub mod config;
pub mod error;
pub mod selectors;
pub mod traits;
pub mod types;

pub use config::PrcDropConfig;
pub use error::{NotifyError, PrcDropError, ProbeFailure, Result};
pub use selectors::{SelectorStore, SelectorTable};
pub use traits::{Notifier, PriceProbe};
pub use types::{Target, normalize_domain, parse_price};

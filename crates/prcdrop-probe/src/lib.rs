//! # PrcDrop Probe
//!
//! The concrete [`PriceProbe`](prcdrop_core::traits::PriceProbe): an HTTP
//! fetch followed by a naive selector lookup over the returned markup.

pub mod extract;
pub mod http;

pub use http::{HttpProbe, extract_price};

//! HTTP price probe — fetch the page, find the price element, parse it.

use std::time::Duration;

use async_trait::async_trait;
use prcdrop_core::config::ProbeConfig;
use prcdrop_core::error::{PrcDropError, ProbeFailure};
use prcdrop_core::selectors::SelectorTable;
use prcdrop_core::traits::PriceProbe;
use prcdrop_core::types::{domain_of, parse_price};

use crate::extract;

/// Plain HTTP fetch + selector lookup. Pages that only render their price
/// client-side will come back as `NotFound`.
pub struct HttpProbe {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpProbe {
    pub fn new(config: &ProbeConfig) -> Result<Self, PrcDropError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .cookie_store(true)
            .build()
            .map_err(|e| PrcDropError::Config(format!("HTTP client error: {e}")))?;
        Ok(Self {
            client,
            timeout_secs: config.request_timeout_secs,
        })
    }

    /// Download the page body.
    pub async fn fetch(&self, url: &str) -> Result<String, ProbeFailure> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeFailure::Timeout(self.timeout_secs)
            } else {
                ProbeFailure::Fetch(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProbeFailure::Fetch(format!("HTTP {status} from {url}")));
        }

        resp.text().await.map_err(|e| {
            if e.is_timeout() {
                ProbeFailure::Timeout(self.timeout_secs)
            } else {
                ProbeFailure::Fetch(format!("read body: {e}"))
            }
        })
    }
}

#[async_trait]
impl PriceProbe for HttpProbe {
    async fn probe(&self, url: &str, selectors: &SelectorTable) -> Result<f64, ProbeFailure> {
        let domain = domain_of(url).map_err(|e| ProbeFailure::Fetch(e.to_string()))?;
        let selector = selectors
            .get(&domain)
            .ok_or_else(|| ProbeFailure::NoSelector(domain.clone()))?
            .to_string();
        tracing::debug!("Using selector: {selector} for domain: {domain}");

        let html = self.fetch(url).await?;
        extract_price(&html, &selector)
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Locate the price element in `html` and turn its text into a number.
pub fn extract_price(html: &str, selector: &str) -> Result<f64, ProbeFailure> {
    let text = extract::select_text(html, selector)
        .ok_or_else(|| ProbeFailure::NotFound(selector.to_string()))?;
    tracing::debug!("Price element text: {text:?}");
    parse_price(&text).ok_or(ProbeFailure::ParseError(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_price_from_markup() {
        let html = r#"<div class="pdp"><span class="currency plus">R 2,499.00</span></div>"#;
        assert_eq!(extract_price(html, "span.currency"), Ok(2499.0));
    }

    #[test]
    fn test_missing_element_is_not_found() {
        let html = "<div class=pdp></div>";
        assert!(matches!(
            extract_price(html, ".currency"),
            Err(ProbeFailure::NotFound(_))
        ));
    }

    #[test]
    fn test_garbage_text_is_parse_error() {
        let html = "<span class=currency>Coming soon</span>";
        assert_eq!(
            extract_price(html, ".currency"),
            Err(ProbeFailure::ParseError("Coming soon".into()))
        );
    }

    #[tokio::test]
    async fn test_unknown_domain_has_no_selector() {
        let probe = HttpProbe::new(&ProbeConfig::default()).unwrap();
        let table = SelectorTable::new([("takealot.com", "span.currency")]);
        let err = probe
            .probe("https://www.unknown-shop.co.za/item/1", &table)
            .await
            .unwrap_err();
        assert_eq!(err, ProbeFailure::NoSelector("unknown-shop.co.za".into()));
    }
}

//! Normalization helpers: domains, URLs, recipients and price text.

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{PrcDropError, Result};

/// A validated, normalized tracking target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// URL as submitted, trimmed. This is what gets fetched and linked.
    pub url: String,
    /// Canonical URL the identity key is derived from.
    pub identity_url: String,
    /// Host used for selector lookup.
    pub domain: String,
    /// Lowercased, trimmed recipient address.
    pub recipient: String,
}

impl Target {
    /// Validate raw subscribe input and normalize it.
    pub fn parse(url: &str, recipient: &str) -> Result<Self> {
        let url = url.trim();
        let recipient = recipient.trim();
        if url.is_empty() || recipient.is_empty() {
            return Err(PrcDropError::InvalidRequest(
                "URL and email are required".into(),
            ));
        }
        let identity_url = normalize_url(url)?;
        let domain = domain_of(&identity_url)?;
        let recipient = normalize_recipient(recipient)?;
        Ok(Self {
            url: url.to_string(),
            identity_url,
            domain,
            recipient,
        })
    }

    /// Stable identity key for this (URL, recipient) pair.
    pub fn key(&self) -> String {
        subscription_key(&self.identity_url, &self.recipient)
    }
}

/// Strip a single leading `www.` label.
pub fn normalize_domain(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    }
}

/// Selector-table key for a URL.
pub fn domain_of(url: &str) -> Result<String> {
    let parsed = Url::parse(url)
        .map_err(|e| PrcDropError::InvalidRequest(format!("invalid URL {url:?}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| PrcDropError::InvalidRequest(format!("URL has no host: {url}")))?;
    Ok(normalize_domain(host))
}

/// Canonical form of a product URL. Two URLs that differ only in a `www.`
/// prefix, host case or fragment normalize to the same string.
pub fn normalize_url(raw: &str) -> Result<String> {
    let mut parsed = Url::parse(raw.trim())
        .map_err(|e| PrcDropError::InvalidRequest(format!("invalid URL {raw:?}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(PrcDropError::InvalidRequest(format!(
            "unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| PrcDropError::InvalidRequest(format!("URL has no host: {raw}")))?;
    let domain = normalize_domain(host);
    parsed
        .set_host(Some(&domain))
        .map_err(|e| PrcDropError::InvalidRequest(format!("invalid host {domain:?}: {e}")))?;
    parsed.set_fragment(None);
    Ok(parsed.to_string())
}

/// Lowercase and sanity-check an email address.
pub fn normalize_recipient(raw: &str) -> Result<String> {
    let addr = raw.trim().to_lowercase();
    let valid = match addr.split_once('@') {
        Some((local, host)) => {
            !local.is_empty() && host.contains('.') && !host.contains('@') && !addr.contains(' ')
        }
        None => false,
    };
    if !valid {
        return Err(PrcDropError::InvalidRequest(format!(
            "invalid email address: {raw}"
        )));
    }
    Ok(addr)
}

/// Hex SHA-256 of the normalized URL and recipient.
pub fn subscription_key(normalized_url: &str, recipient: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_url.as_bytes());
    hasher.update(b"\n");
    hasher.update(recipient.as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse displayed price text into a number.
///
/// Only the first non-empty line is considered (sale widgets often stack the
/// old price underneath). Currency symbols/codes around the number are
/// dropped, as are `,`, spaces and non-breaking spaces used as thousands
/// separators. `.` is the decimal point. Returns `None` for anything that is
/// not a finite, non-negative number.
pub fn parse_price(text: &str) -> Option<f64> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let cleaned: String = line
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '\u{a0}' | '\u{202f}'))
        .collect();
    let start = cleaned.find(|c: char| c.is_ascii_digit() || c == '.')?;
    let end = cleaned.rfind(|c: char| c.is_ascii_digit())? + 1;
    if end <= start {
        return None;
    }
    let number = &cleaned[start..end];
    // Reject leftovers like "12abc34" instead of guessing.
    if !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let value: f64 = number.parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

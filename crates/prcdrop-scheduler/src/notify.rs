//! Notification records and message builders.
//! Every delivery attempt is kept in an in-memory ring buffer and mirrored to
//! the store so operators can see what went out and what did not.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const HISTORY_CAP: usize = 100;

/// Why a message was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Price fell below baseline; goes to the subscriber.
    PriceDrop,
    /// Request for a domain with no selector; goes to the operator.
    UnsupportedSite,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PriceDrop => "price_drop",
            NotificationKind::UnsupportedSite => "unsupported_site",
        }
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "price_drop" => Ok(NotificationKind::PriceDrop),
            "unsupported_site" => Ok(NotificationKind::UnsupportedSite),
            other => Err(format!("unknown notification kind: {other}")),
        }
    }
}

/// One delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Owning subscription, if any.
    pub subscription_id: Option<String>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// Notifier that handled it.
    pub channel: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub delivered: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Bounded in-memory history, newest last.
#[derive(Debug, Default)]
pub struct NotifyHistory {
    entries: VecDeque<Notification>,
}

impl NotifyHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, notification: Notification) {
        self.entries.push_back(notification);
        while self.entries.len() > HISTORY_CAP {
            self.entries.pop_front();
        }
    }

    /// Most recent `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Notification> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Subject and body of the subscriber alert.
pub fn price_drop_message(url: &str, price: f64) -> (String, String) {
    (
        "Price Drop Alert!".to_string(),
        format!("The price for your product is now R{price:.2}\n\nCheck it out here:\n{url}"),
    )
}

/// Subject and body of the operator request for a new domain.
pub fn unsupported_site_message(domain: &str) -> (String, String) {
    (
        "Website Support!".to_string(),
        format!("Add website support for {domain}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> Notification {
        Notification {
            kind: NotificationKind::PriceDrop,
            subscription_id: Some(format!("sub-{n}")),
            recipient: "bob@mail.com".into(),
            subject: "s".into(),
            body: "b".into(),
            channel: "log".into(),
            attempt: 1,
            delivered: true,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut h = NotifyHistory::new();
        for n in 0..150 {
            h.record(entry(n));
        }
        assert_eq!(h.len(), 100);
        let recent = h.recent(2);
        assert_eq!(recent[0].subscription_id.as_deref(), Some("sub-149"));
        assert_eq!(recent[1].subscription_id.as_deref(), Some("sub-148"));
    }

    #[test]
    fn test_price_drop_message_format() {
        let (subject, body) = price_drop_message("https://shop.co.za/p/1", 450.0);
        assert_eq!(subject, "Price Drop Alert!");
        assert_eq!(
            body,
            "The price for your product is now R450.00\n\nCheck it out here:\nhttps://shop.co.za/p/1"
        );
    }

    #[test]
    fn test_unsupported_site_message() {
        let (subject, body) = unsupported_site_message("newshop.co.za");
        assert_eq!(subject, "Website Support!");
        assert_eq!(body, "Add website support for newshop.co.za");
    }
}

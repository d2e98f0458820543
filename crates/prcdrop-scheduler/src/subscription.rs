//! Subscription definitions — the unit of price tracking and its lifecycle.

use chrono::{DateTime, Utc};
use prcdrop_core::error::ProbeFailure;
use serde::{Deserialize, Serialize};

use crate::policy::{ReschedulePolicy, RetryDecision, RetryPolicy};

/// Stable identity of a (normalized URL, recipient) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state. Everything except `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// Being monitored; baseline may or may not be set yet.
    Active,
    /// Price fell below the baseline; alert sent (or attempted).
    Dropped,
    /// Retry budget exhausted.
    Abandoned,
    /// Domain had no selector at submission time; never probed.
    Unsupported,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Active => "active",
            SubscriptionState::Dropped => "dropped",
            SubscriptionState::Abandoned => "abandoned",
            SubscriptionState::Unsupported => "unsupported",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubscriptionState::Active)
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionState::Active),
            "dropped" => Ok(SubscriptionState::Dropped),
            "abandoned" => Ok(SubscriptionState::Abandoned),
            "unsupported" => Ok(SubscriptionState::Unsupported),
            other => Err(format!("unknown subscription state: {other}")),
        }
    }
}

/// Delivery status of the price-drop alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyStatus {
    /// No alert owed.
    None,
    /// Subscription is DROPPED, alert not yet confirmed.
    Pending,
    Sent,
    /// Retry budget spent; handed to the operator.
    Failed,
}

impl NotifyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyStatus::None => "none",
            NotifyStatus::Pending => "pending",
            NotifyStatus::Sent => "sent",
            NotifyStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for NotifyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(NotifyStatus::None),
            "pending" => Ok(NotifyStatus::Pending),
            "sent" => Ok(NotifyStatus::Sent),
            "failed" => Ok(NotifyStatus::Failed),
            other => Err(format!("unknown notify status: {other}")),
        }
    }
}

/// A tracked (URL, recipient) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// Normalized product URL.
    pub url: String,
    /// Normalized domain used for selector lookup.
    pub domain: String,
    pub recipient: String,
    /// First successfully observed price. Write-once.
    pub baseline: Option<f64>,
    /// Most recent successfully observed price.
    pub last_price: Option<f64>,
    pub state: SubscriptionState,
    /// Consecutive failed probes since the last success.
    pub failures: u32,
    /// Earliest time the next probe may run. `None` once terminal.
    pub next_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub notify_status: NotifyStatus,
    pub notify_attempts: u32,
    /// Optimistic-concurrency version, bumped by every stored update.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Price(f64),
    Failed(ProbeFailure),
}

/// What a transition means for the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Probe failed, budget left; try again at `at`.
    Retry { at: DateTime<Utc>, failures: u32 },
    /// First price recorded.
    BaselineSet { price: f64, at: DateTime<Utc> },
    /// Price at or above baseline.
    NoDrop { price: f64, at: DateTime<Utc> },
    /// Price fell below baseline; alert is owed.
    Dropped { price: f64, baseline: f64 },
    /// Retry budget exhausted.
    Abandoned { failures: u32 },
}

impl Effect {
    /// When the subscription should be probed next, if ever.
    pub fn next_check(&self) -> Option<DateTime<Utc>> {
        match self {
            Effect::Retry { at, .. } | Effect::BaselineSet { at, .. } | Effect::NoDrop { at, .. } => {
                Some(*at)
            }
            Effect::Dropped { .. } | Effect::Abandoned { .. } => None,
        }
    }
}

/// The record to store plus its meaning.
#[derive(Debug, Clone)]
pub struct Transition {
    pub next: Subscription,
    pub effect: Effect,
}

fn after(now: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Subscription {
    /// Active and its next-eligible-check has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == SubscriptionState::Active && self.next_check.is_some_and(|t| t <= now)
    }

    /// Apply one probe outcome. Pure: returns the successor record, or `None`
    /// if the subscription is already terminal.
    pub fn advance(
        &self,
        outcome: &CheckOutcome,
        now: DateTime<Utc>,
        retry: &dyn RetryPolicy,
        reschedule: &dyn ReschedulePolicy,
    ) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        let mut next = self.clone();
        next.updated_at = now;

        let effect = match outcome {
            CheckOutcome::Failed(failure) => {
                next.failures = self.failures.saturating_add(1);
                next.last_error = Some(failure.to_string());
                match retry.decide(next.failures) {
                    RetryDecision::RetryAfter(delay) => {
                        let at = after(now, delay);
                        next.next_check = Some(at);
                        Effect::Retry {
                            at,
                            failures: next.failures,
                        }
                    }
                    RetryDecision::Abandon => {
                        next.state = SubscriptionState::Abandoned;
                        next.next_check = None;
                        Effect::Abandoned {
                            failures: next.failures,
                        }
                    }
                }
            }
            CheckOutcome::Price(price) => {
                let price = *price;
                next.failures = 0;
                next.last_error = None;
                next.last_price = Some(price);
                match self.baseline {
                    None => {
                        let at = after(now, reschedule.interval());
                        next.baseline = Some(price);
                        next.next_check = Some(at);
                        Effect::BaselineSet { price, at }
                    }
                    Some(baseline) if price < baseline => {
                        next.state = SubscriptionState::Dropped;
                        next.next_check = None;
                        next.notify_status = NotifyStatus::Pending;
                        Effect::Dropped { price, baseline }
                    }
                    Some(_) => {
                        let at = after(now, reschedule.interval());
                        next.next_check = Some(at);
                        Effect::NoDrop { price, at }
                    }
                }
            }
        };

        Some(Transition { next, effect })
    }
}

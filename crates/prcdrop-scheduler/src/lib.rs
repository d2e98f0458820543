//! # PrcDrop Scheduler
//!
//! Recurring price checks with bounded retry, rescheduling and exactly-once
//! price-drop alerts.
//!
//! ## Design Principles
//! - SQLite persistence: one row per (URL, recipient), survives restarts
//! - Optimistic concurrency: every change is a versioned compare-and-update
//! - Tokio timers only: the dispatcher sleeps until the next deadline
//! - Retry and reschedule timing are pluggable policies
//!
//! ## Architecture
//! ```text
//! subscribe(url, email)
//!   ├── no selector → UNSUPPORTED + operator mail (background)
//!   └── store.create → CheckQueue (due now)
//!
//! Scheduler::run (deadline queue, N workers)
//!   └── check(id)
//!         ├── PriceProbe (timeout-bounded)
//!         ├── Subscription::advance → compare_and_update
//!         │     ├── BaselineSet / NoDrop → requeue after interval
//!         │     ├── Retry → requeue after RetryPolicy delay
//!         │     ├── Abandoned → terminal
//!         │     └── Dropped → Notifier (bounded attempts) → Sent | Failed
//!         └── NotifyHistory + notifications table
//! ```

pub mod dispatch;
pub mod engine;
pub mod notify;
pub mod persistence;
pub mod policy;
pub mod queue;
pub mod subscription;

pub use dispatch::{EmailNotifier, LogNotifier, WebhookNotifier};
pub use engine::{RecoveryReport, Scheduler, SchedulerSettings, SchedulerStatus, SubscribeOutcome};
pub use notify::{Notification, NotificationKind, NotifyHistory};
pub use persistence::SubscriptionStore;
pub use policy::{ExponentialBackoff, FixedDelay, FixedInterval, ReschedulePolicy, RetryPolicy};
pub use queue::CheckQueue;
pub use subscription::{
    CheckOutcome, Effect, NotifyStatus, Subscription, SubscriptionId, SubscriptionState,
};

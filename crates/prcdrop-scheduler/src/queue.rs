//! Delay queue of pending checks, ordered by due time.
//!
//! Entries are hints: the store is authoritative, so a popped id is re-read
//! and silently skipped if it is no longer due.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::subscription::SubscriptionId;

/// Queue statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub next_due: Option<DateTime<Utc>>,
}

pub struct CheckQueue {
    heap: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, SubscriptionId)>>>,
    wake: Notify,
}

impl CheckQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
        }
    }

    /// Queue a check for `id` at `at` and wake the dispatcher.
    pub async fn schedule(&self, id: SubscriptionId, at: DateTime<Utc>) {
        let mut heap = self.heap.lock().await;
        tracing::debug!("📥 Queue: {id} due {at} (queued: {})", heap.len() + 1);
        heap.push(Reverse((at, id)));
        drop(heap);
        self.wake.notify_one();
    }

    /// Remove and return every id due at or before `now`, each at most once.
    pub async fn pop_due(&self, now: DateTime<Utc>) -> Vec<SubscriptionId> {
        let mut heap = self.heap.lock().await;
        let mut seen = HashSet::new();
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = heap.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, id))) = heap.pop() {
                if seen.insert(id.clone()) {
                    due.push(id);
                }
            }
        }
        due
    }

    pub async fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.heap.lock().await.peek().map(|Reverse((at, _))| *at)
    }

    /// Sleep until the earliest deadline, a new entry, or `max_idle`,
    /// whichever comes first.
    pub async fn wait(&self, max_idle: Duration) {
        let sleep_for = match self.next_deadline().await {
            Some(at) => (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(max_idle),
            None => max_idle,
        };
        if sleep_for.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = self.wake.notified() => {}
        }
    }

    pub async fn stats(&self) -> QueueStats {
        let heap = self.heap.lock().await;
        QueueStats {
            queued: heap.len(),
            next_due: heap.peek().map(|Reverse((at, _))| *at),
        }
    }
}

impl Default for CheckQueue {
    fn default() -> Self {
        Self::new()
    }
}

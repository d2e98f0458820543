//! SQLite-backed subscription store.
//!
//! One row per identity key. Every state change goes through
//! [`SubscriptionStore::compare_and_update`], which only succeeds if the row
//! still carries the version the caller read.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use prcdrop_core::error::{PrcDropError, Result};
use prcdrop_core::types::Target;
use rusqlite::OptionalExtension;

use crate::notify::Notification;
use crate::subscription::{NotifyStatus, Subscription, SubscriptionId, SubscriptionState};

const COLUMNS: &str = "id, url, domain, recipient, baseline, last_price, state, failures, \
     next_check, last_error, notify_status, notify_attempts, version, created_at, updated_at";

fn store_err(ctx: &'static str) -> impl Fn(rusqlite::Error) -> PrcDropError {
    move |e| PrcDropError::Store(format!("{ctx}: {e}"))
}

fn to_millis(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(|t| t.timestamp_millis())
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    let state: String = row.get(6)?;
    let notify_status: String = row.get(10)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    Ok(Subscription {
        id: SubscriptionId::new(row.get::<_, String>(0)?),
        url: row.get(1)?,
        domain: row.get(2)?,
        recipient: row.get(3)?,
        baseline: row.get(4)?,
        last_price: row.get(5)?,
        state: state.parse().map_err(|e| bad_column(6, e))?,
        failures: row.get(7)?,
        next_check: from_millis(row.get(8)?),
        last_error: row.get(9)?,
        notify_status: notify_status.parse().map_err(|e| bad_column(10, e))?,
        notify_attempts: row.get(11)?,
        version: row.get(12)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

/// Durable subscription records plus notification log.
pub struct SubscriptionStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SubscriptionStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(store_err("DB open"))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(store_err("DB open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(store_err("Busy timeout"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY,              -- hash of (url, recipient)
                url TEXT NOT NULL,
                domain TEXT NOT NULL,
                recipient TEXT NOT NULL,
                baseline REAL,                    -- write-once
                last_price REAL,
                state TEXT NOT NULL DEFAULT 'active',
                failures INTEGER NOT NULL DEFAULT 0,
                next_check INTEGER,               -- unix millis, NULL once terminal
                last_error TEXT,
                notify_status TEXT NOT NULL DEFAULT 'none',
                notify_attempts INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_subscriptions_due
                ON subscriptions (state, next_check);

            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,               -- 'price_drop', 'unsupported_site'
                subscription_id TEXT,
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                channel TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL,             -- 'sent', 'failed'
                error TEXT,
                created_at TEXT NOT NULL
            );
         ",
            )
            .map_err(store_err("Migration"))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|e| PrcDropError::Store(format!("Lock: {e}")))
    }

    // ─── Subscriptions ──────────────────────────────────────

    /// Register a subscription. Returns its id and whether a new monitoring
    /// cycle was started.
    ///
    /// An ACTIVE row is left untouched, as is a DROPPED row whose alert is
    /// still owed. Any other terminal row is reset to a fresh ACTIVE cycle.
    pub fn create(&self, target: &Target) -> Result<(SubscriptionId, bool)> {
        let id = SubscriptionId::new(target.key());
        let now = Utc::now();
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err("Begin"))?;

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT state, notify_status FROM subscriptions WHERE id = ?1",
                [id.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(store_err("Lookup"))?;

        let created = match existing {
            None => {
                tx.execute(
                    "INSERT INTO subscriptions (id, url, domain, recipient, state, next_check, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?6)",
                    rusqlite::params![
                        id.as_str(),
                        target.url,
                        target.domain,
                        target.recipient,
                        now.timestamp_millis(),
                        now.to_rfc3339()
                    ],
                )
                .map_err(store_err("Insert"))?;
                true
            }
            Some((state, _)) if state == SubscriptionState::Active.as_str() => false,
            Some((state, notify))
                if state == SubscriptionState::Dropped.as_str()
                    && notify == NotifyStatus::Pending.as_str() =>
            {
                false
            }
            Some(_) => {
                tx.execute(
                    "UPDATE subscriptions SET url = ?2, domain = ?3, recipient = ?4,
                        baseline = NULL, last_price = NULL, state = 'active', failures = 0,
                        next_check = ?5, last_error = NULL, notify_status = 'none',
                        notify_attempts = 0, version = version + 1,
                        created_at = ?6, updated_at = ?6
                     WHERE id = ?1",
                    rusqlite::params![
                        id.as_str(),
                        target.url,
                        target.domain,
                        target.recipient,
                        now.timestamp_millis(),
                        now.to_rfc3339()
                    ],
                )
                .map_err(store_err("Restart"))?;
                true
            }
        };

        tx.commit().map_err(store_err("Commit"))?;
        Ok((id, created))
    }

    /// Record a request for a domain with no selector. The row is terminal and
    /// never scheduled. An ACTIVE row for the same key is left alone.
    pub fn record_unsupported(&self, target: &Target) -> Result<SubscriptionId> {
        let id = SubscriptionId::new(target.key());
        let now = Utc::now().to_rfc3339();
        self.lock()?
            .execute(
                "INSERT INTO subscriptions (id, url, domain, recipient, state, next_check, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'unsupported', NULL, ?5, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    state = 'unsupported', next_check = NULL, version = version + 1, updated_at = ?5
                 WHERE state IN ('abandoned', 'unsupported')",
                rusqlite::params![id.as_str(), target.url, target.domain, target.recipient, now],
            )
            .map_err(store_err("Record unsupported"))?;
        Ok(id)
    }

    pub fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>> {
        self.lock()?
            .query_row(
                &format!("SELECT {COLUMNS} FROM subscriptions WHERE id = ?1"),
                [id.as_str()],
                row_to_subscription,
            )
            .optional()
            .map_err(store_err("Get"))
    }

    /// Replace `expected` with `next` if the row still has `expected.version`.
    /// Returns the stored record (with its new version). Fails with
    /// `StoreConflict` if another writer got there first.
    pub fn compare_and_update(
        &self,
        expected: &Subscription,
        next: &Subscription,
    ) -> Result<Subscription> {
        let now = Utc::now();
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE subscriptions SET
                    baseline = COALESCE(baseline, ?3), last_price = ?4, state = ?5,
                    failures = ?6, next_check = ?7, last_error = ?8,
                    notify_status = ?9, notify_attempts = ?10,
                    version = version + 1, updated_at = ?11
                 WHERE id = ?1 AND version = ?2",
                rusqlite::params![
                    expected.id.as_str(),
                    expected.version,
                    next.baseline,
                    next.last_price,
                    next.state.as_str(),
                    next.failures,
                    to_millis(next.next_check),
                    next.last_error,
                    next.notify_status.as_str(),
                    next.notify_attempts,
                    now.to_rfc3339()
                ],
            )
            .map_err(store_err("Update"))?;

        if changed == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM subscriptions WHERE id = ?1",
                    [expected.id.as_str()],
                    |r| r.get(0),
                )
                .map_err(store_err("Exists"))?;
            return Err(if exists {
                PrcDropError::StoreConflict(expected.id.to_string())
            } else {
                PrcDropError::NotFound(expected.id.to_string())
            });
        }

        let mut stored = next.clone();
        stored.baseline = expected.baseline.or(next.baseline);
        stored.version = expected.version + 1;
        stored.updated_at = now;
        Ok(stored)
    }

    /// ACTIVE subscriptions whose next check is at or before `now`.
    pub fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM subscriptions
                 WHERE state = 'active' AND next_check IS NOT NULL AND next_check <= ?1
                 ORDER BY next_check",
            )
            .map_err(store_err("Prepare"))?;
        let rows = stmt
            .query_map([now.timestamp_millis()], |r| {
                r.get::<_, String>(0).map(SubscriptionId::new)
            })
            .map_err(store_err("List due"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("List due"))
    }

    /// Every ACTIVE subscription with its next check time.
    pub fn list_scheduled(&self) -> Result<Vec<(SubscriptionId, DateTime<Utc>)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, next_check FROM subscriptions
                 WHERE state = 'active' AND next_check IS NOT NULL",
            )
            .map_err(store_err("Prepare"))?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    SubscriptionId::new(r.get::<_, String>(0)?),
                    from_millis(r.get(1)?).unwrap_or_else(Utc::now),
                ))
            })
            .map_err(store_err("List scheduled"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("List scheduled"))
    }

    /// DROPPED subscriptions whose alert has not been confirmed.
    pub fn list_pending_notifications(&self) -> Result<Vec<Subscription>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM subscriptions
                 WHERE state = 'dropped' AND notify_status = 'pending'"
            ))
            .map_err(store_err("Prepare"))?;
        let rows = stmt
            .query_map([], row_to_subscription)
            .map_err(store_err("List pending"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("List pending"))
    }

    /// Subscription count per state.
    pub fn counts(&self) -> Result<BTreeMap<String, u64>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM subscriptions GROUP BY state")
            .map_err(store_err("Prepare"))?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map_err(store_err("Counts"))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (state, n) = row.map_err(store_err("Counts"))?;
            counts.insert(state, n.max(0) as u64);
        }
        Ok(counts)
    }

    // ─── Notifications ──────────────────────────────────────

    pub fn record_notification(&self, n: &Notification) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO notifications
                (kind, subscription_id, recipient, subject, body, channel, attempt, status, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                n.kind.as_str(),
                n.subscription_id,
                n.recipient,
                n.subject,
                n.body,
                n.channel,
                n.attempt,
                if n.delivered { "sent" } else { "failed" },
                n.error,
                n.timestamp.to_rfc3339()
            ],
        )
        .map_err(store_err("Save notification"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest notifications, newest first.
    pub fn recent_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT kind, subscription_id, recipient, subject, body, channel, attempt, status, error, created_at
                 FROM notifications ORDER BY id DESC LIMIT ?1",
            )
            .map_err(store_err("Prepare"))?;
        let rows = stmt
            .query_map([limit as i64], |r| {
                let kind: String = r.get(0)?;
                let status: String = r.get(7)?;
                let created_at: String = r.get(9)?;
                Ok(Notification {
                    kind: kind.parse().map_err(|e| bad_column(0, e))?,
                    subscription_id: r.get(1)?,
                    recipient: r.get(2)?,
                    subject: r.get(3)?,
                    body: r.get(4)?,
                    channel: r.get(5)?,
                    attempt: r.get(6)?,
                    delivered: status == "sent",
                    error: r.get(8)?,
                    timestamp: parse_ts(&created_at),
                })
            })
            .map_err(store_err("Recent notifications"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("Recent notifications"))
    }
}

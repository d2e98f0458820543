//! Scheduler engine — decides when each subscription is probed, applies the
//! outcome through the store, and delivers price-drop alerts.
//!
//! Checks are dispatched from a deadline queue onto at most `workers`
//! concurrent tasks. Every state change is a compare-and-update against the
//! version that was read before probing; on a collision the record is re-read
//! and the same probe result is re-applied to the fresh state.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use prcdrop_core::config::SchedulerConfig;
use prcdrop_core::error::{PrcDropError, ProbeFailure, Result};
use prcdrop_core::selectors::SelectorStore;
use prcdrop_core::traits::{Notifier, PriceProbe};
use prcdrop_core::types::Target;
use prcdrop_core::PrcDropConfig;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};

use crate::notify::{
    Notification, NotificationKind, NotifyHistory, price_drop_message, unsupported_site_message,
};
use crate::persistence::SubscriptionStore;
use crate::policy::{self, ReschedulePolicy, RetryPolicy};
use crate::queue::CheckQueue;
use crate::subscription::{
    CheckOutcome, Effect, NotifyStatus, Subscription, SubscriptionId, SubscriptionState,
};

/// Re-read/re-apply rounds before a collision is reported.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Runtime knobs, usually derived from `[scheduler]` and `[email]`.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub probe_timeout: Duration,
    pub notify_attempts: u32,
    pub notify_retry_delay: Duration,
    /// Operator address for unsupported-site requests.
    pub support_email: Option<String>,
    /// How often the store is swept for due subscriptions the queue missed.
    pub sweep_interval: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &PrcDropConfig) -> Self {
        let s = &config.scheduler;
        Self {
            workers: s.workers.max(1),
            probe_timeout: Duration::from_secs(s.probe_timeout_secs),
            notify_attempts: s.notify_attempts.max(1),
            notify_retry_delay: Duration::from_secs(s.notify_retry_delay_secs),
            support_email: Some(config.email.support_email.clone()).filter(|e| !e.is_empty()),
            sweep_interval: Duration::from_secs(s.sweep_interval_secs.max(1)),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&PrcDropConfig::default())
    }
}

/// Result of a subscribe request.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeOutcome {
    /// Monitoring is (or already was) running. `created` is false when an
    /// existing subscription was reused.
    Tracking { id: SubscriptionId, created: bool },
    /// No selector for the domain; the operator was asked to add one.
    Unsupported { domain: String },
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub active_probes: usize,
    pub queued: usize,
    pub next_due: Option<DateTime<Utc>>,
    pub selectors_loaded: usize,
    pub subscriptions: BTreeMap<String, u64>,
}

/// What startup recovery found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub rescheduled: usize,
    pub pending_alerts: usize,
    pub delivered: usize,
}

/// Removes the id from the in-flight set when dropped.
struct Claim<'a> {
    set: &'a std::sync::Mutex<HashSet<SubscriptionId>>,
    id: SubscriptionId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

/// Counts a running probe until dropped.
struct ProbeSlot<'a>(&'a AtomicUsize);

impl<'a> ProbeSlot<'a> {
    fn take(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The price-check scheduler.
pub struct Scheduler {
    store: Arc<SubscriptionStore>,
    selectors: Arc<SelectorStore>,
    probe: Arc<dyn PriceProbe>,
    notifier: Arc<dyn Notifier>,
    operator: Option<Arc<dyn Notifier>>,
    retry: Arc<dyn RetryPolicy>,
    reschedule: Arc<dyn ReschedulePolicy>,
    settings: SchedulerSettings,
    queue: CheckQueue,
    active_probes: AtomicUsize,
    in_flight: std::sync::Mutex<HashSet<SubscriptionId>>,
    history: Arc<Mutex<NotifyHistory>>,
}

impl Scheduler {
    /// Scheduler with default settings and policies.
    pub fn new(
        store: Arc<SubscriptionStore>,
        selectors: Arc<SelectorStore>,
        probe: Arc<dyn PriceProbe>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            store,
            selectors,
            probe,
            notifier,
            operator: None,
            retry: policy::retry_policy(&defaults),
            reschedule: policy::reschedule_policy(&defaults),
            settings: SchedulerSettings::default(),
            queue: CheckQueue::new(),
            active_probes: AtomicUsize::new(0),
            in_flight: std::sync::Mutex::new(HashSet::new()),
            history: Arc::new(Mutex::new(NotifyHistory::new())),
        }
    }

    /// Scheduler with settings and policies taken from `config`.
    pub fn from_config(
        config: &PrcDropConfig,
        store: Arc<SubscriptionStore>,
        selectors: Arc<SelectorStore>,
        probe: Arc<dyn PriceProbe>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::new(store, selectors, probe, notifier)
            .with_settings(SchedulerSettings::from_config(config))
            .with_retry_policy(policy::retry_policy(&config.scheduler))
            .with_reschedule_policy(policy::reschedule_policy(&config.scheduler))
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_retry_policy(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reschedule_policy(mut self, reschedule: Arc<dyn ReschedulePolicy>) -> Self {
        self.reschedule = reschedule;
        self
    }

    /// Channel that receives a copy of every operator alert.
    pub fn with_operator_notifier(mut self, operator: Option<Arc<dyn Notifier>>) -> Self {
        self.operator = operator;
        self
    }

    pub fn store(&self) -> &Arc<SubscriptionStore> {
        &self.store
    }

    pub fn selectors(&self) -> &Arc<SelectorStore> {
        &self.selectors
    }

    /// Probes currently running.
    pub fn active_probes(&self) -> usize {
        self.active_probes.load(Ordering::SeqCst)
    }

    // ─── Subscribe ──────────────────────────────────────────

    /// Validate and register a (URL, recipient) pair.
    ///
    /// Fails only with `InvalidRequest` or a store error. Domains without a
    /// selector are recorded as UNSUPPORTED and reported to the operator in
    /// the background.
    pub async fn subscribe(&self, url: &str, recipient: &str) -> Result<SubscribeOutcome> {
        let target = Target::parse(url, recipient)?;

        if !self.selectors.supports(&target.domain) {
            let err = PrcDropError::UnsupportedTarget(target.domain.clone());
            tracing::info!("🚫 {err} (requested by {})", target.recipient);
            if let Err(e) = self.store.record_unsupported(&target) {
                tracing::warn!("⚠️ Could not record unsupported request: {e}");
            }
            self.request_support(&target.domain);
            return Ok(SubscribeOutcome::Unsupported {
                domain: target.domain,
            });
        }

        let (id, created) = self.store.create(&target)?;
        if created {
            tracing::info!("📅 Tracking {} for {} ({id})", target.url, target.recipient);
            self.queue.schedule(id.clone(), Utc::now()).await;
        } else {
            tracing::debug!("📅 Already tracking {} for {} ({id})", target.url, target.recipient);
        }
        Ok(SubscribeOutcome::Tracking { id, created })
    }

    /// Fire-and-forget "please add this site" mail to the operator.
    fn request_support(&self, domain: &str) {
        let (subject, body) = unsupported_site_message(domain);
        let support = self.settings.support_email.clone();
        let notifier = self.notifier.clone();
        let operator = self.operator.clone();
        let store = self.store.clone();
        let history = self.history.clone();

        tokio::spawn(async move {
            match support {
                Some(address) => {
                    let result = notifier.notify(&subject, &body, &address).await;
                    if let Err(e) = &result {
                        tracing::warn!("⚠️ Support request for {address} failed: {e}");
                    }
                    let entry = Notification {
                        kind: NotificationKind::UnsupportedSite,
                        subscription_id: None,
                        recipient: address,
                        subject: subject.clone(),
                        body: body.clone(),
                        channel: notifier.channel_name().to_string(),
                        attempt: 1,
                        delivered: result.is_ok(),
                        error: result.err().map(|e| e.to_string()),
                        timestamp: Utc::now(),
                    };
                    record(&store, &history, entry).await;
                }
                None => tracing::warn!("⚠️ No support address configured; dropping: {body}"),
            }
            if let Some(op) = operator {
                if let Err(e) = op.notify(&subject, &body, "operator").await {
                    tracing::warn!("⚠️ Operator escalation failed: {e}");
                }
            }
        });
    }

    // ─── Checks ─────────────────────────────────────────────

    fn claim(&self, id: &SubscriptionId) -> Option<Claim<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(id.clone()) {
            return None;
        }
        Some(Claim {
            set: &self.in_flight,
            id: id.clone(),
        })
    }

    /// Run one check for `id` if it is due. Returns the applied effect, or
    /// `None` if nothing happened (not due, terminal, already in flight, or
    /// superseded by another writer).
    pub async fn check(&self, id: &SubscriptionId) -> Result<Option<Effect>> {
        let effect = {
            let Some(_claim) = self.claim(id) else {
                tracing::debug!("⏭️ Check for {id} already in flight");
                return Ok(None);
            };
            self.check_claimed(id).await?
        };
        // Must run after the claim is released.
        if let Some(at) = effect.as_ref().and_then(Effect::next_check) {
            self.queue.schedule(id.clone(), at).await;
        }
        Ok(effect)
    }

    async fn check_claimed(&self, id: &SubscriptionId) -> Result<Option<Effect>> {
        let Some(mut current) = self.store.get(id)? else {
            return Ok(None);
        };
        if !current.is_due(Utc::now()) {
            if let (SubscriptionState::Active, Some(at)) = (current.state, current.next_check) {
                self.queue.schedule(id.clone(), at).await;
            }
            return Ok(None);
        }

        let outcome = self.run_probe(&current).await;
        match &outcome {
            CheckOutcome::Price(price) => {
                tracing::info!("💰 {} → R{price:.2}", current.url)
            }
            CheckOutcome::Failed(failure) => tracing::warn!(
                kind = failure.kind(),
                "⚠️ Probe failed for {}: {failure}",
                current.url
            ),
        }

        for _ in 0..MAX_CONFLICT_RETRIES {
            let now = Utc::now();
            let Some(transition) = current.advance(
                &outcome,
                now,
                self.retry.as_ref(),
                self.reschedule.as_ref(),
            ) else {
                return Ok(None);
            };

            match self.store.compare_and_update(&current, &transition.next) {
                Ok(stored) => {
                    self.apply(stored, &transition.effect).await;
                    return Ok(Some(transition.effect));
                }
                Err(PrcDropError::StoreConflict(_)) => {
                    tracing::warn!("🔁 Store conflict on {id}; re-reading");
                    match self.store.get(id)? {
                        Some(fresh) if fresh.is_due(now) => current = fresh,
                        _ => {
                            tracing::debug!("⏭️ {id} advanced elsewhere; discarding result");
                            return Ok(None);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(PrcDropError::StoreConflict(id.to_string()))
    }

    async fn run_probe(&self, sub: &Subscription) -> CheckOutcome {
        let selectors = self.selectors.snapshot();
        let _slot = ProbeSlot::take(&self.active_probes);
        let started = Instant::now();
        let result =
            tokio::time::timeout(self.settings.probe_timeout, self.probe.probe(&sub.url, &selectors))
                .await;
        tracing::debug!("⏱️ Probe of {} took {:?}", sub.url, started.elapsed());

        match result {
            Ok(Ok(price)) if price.is_finite() && price >= 0.0 => CheckOutcome::Price(price),
            Ok(Ok(price)) => CheckOutcome::Failed(ProbeFailure::ParseError(price.to_string())),
            Ok(Err(failure)) => CheckOutcome::Failed(failure),
            Err(_) => CheckOutcome::Failed(ProbeFailure::Timeout(
                self.settings.probe_timeout.as_secs(),
            )),
        }
    }

    async fn apply(&self, stored: Subscription, effect: &Effect) {
        match effect {
            Effect::Retry { at, failures } => tracing::warn!(
                "🔄 Retry {failures}/{} for {} at {at}",
                self.retry.max_failures(),
                stored.url
            ),
            Effect::BaselineSet { price, .. } => {
                tracing::info!("📌 Baseline R{price:.2} recorded for {}", stored.url)
            }
            Effect::NoDrop { price, at } => {
                tracing::info!("➖ No drop for {} (R{price:.2}); next check {at}", stored.url)
            }
            Effect::Dropped { price, baseline } => {
                tracing::info!(
                    "📉 Price drop for {}: R{baseline:.2} → R{price:.2}",
                    stored.url
                );
                let attempts = self.settings.notify_attempts;
                self.deliver(stored, attempts).await;
            }
            Effect::Abandoned { failures } => {
                let err = PrcDropError::RetriesExhausted {
                    id: stored.id.to_string(),
                    failures: *failures,
                };
                tracing::error!(
                    url = %stored.url,
                    "❌ {err}. Max retries exceeded; stopping further attempts."
                )
            }
        }
    }

    // ─── Delivery ───────────────────────────────────────────

    /// Send the price-drop alert for a DROPPED subscription, trying up to
    /// `attempts` times. Returns whether it was delivered.
    async fn deliver(&self, sub: Subscription, attempts: u32) -> bool {
        let price = sub.last_price.unwrap_or_default();
        let (subject, body) = price_drop_message(&sub.url, price);
        let attempts = attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = self.notifier.notify(&subject, &body, &sub.recipient).await;
            let entry = Notification {
                kind: NotificationKind::PriceDrop,
                subscription_id: Some(sub.id.to_string()),
                recipient: sub.recipient.clone(),
                subject: subject.clone(),
                body: body.clone(),
                channel: self.notifier.channel_name().to_string(),
                attempt,
                delivered: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
                timestamp: Utc::now(),
            };
            record(&self.store, &self.history, entry).await;

            match result {
                Ok(()) => {
                    tracing::info!("📧 Alert sent to {} for {}", sub.recipient, sub.url);
                    self.finish_delivery(&sub, NotifyStatus::Sent, attempt, None);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Alert attempt {attempt}/{attempts} to {} failed: {e}",
                        sub.recipient
                    );
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.notify_retry_delay).await;
            }
        }

        let reason = last_error
            .map(|e| PrcDropError::from(e).to_string())
            .unwrap_or_default();
        self.finish_delivery(&sub, NotifyStatus::Failed, attempts, Some(reason.clone()));
        tracing::error!(
            target: "operator",
            subscription = %sub.id,
            recipient = %sub.recipient,
            "❌ Price drop alert undeliverable after {attempts} attempts: {reason}"
        );
        if let Some(op) = &self.operator {
            let note = format!(
                "Could not notify {} that {} dropped to R{price:.2}: {reason}",
                sub.recipient, sub.url
            );
            if let Err(e) = op.notify("Undeliverable price drop alert", &note, "operator").await {
                tracing::warn!("⚠️ Operator escalation failed: {e}");
            }
        }
        false
    }

    fn finish_delivery(
        &self,
        sub: &Subscription,
        status: NotifyStatus,
        attempts: u32,
        error: Option<String>,
    ) {
        let mut current = sub.clone();
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut next = current.clone();
            next.notify_status = status;
            next.notify_attempts = current.notify_attempts.saturating_add(attempts);
            if error.is_some() {
                next.last_error = error.clone();
            }
            match self.store.compare_and_update(&current, &next) {
                Ok(_) => return,
                Err(PrcDropError::StoreConflict(_)) => match self.store.get(&sub.id) {
                    Ok(Some(fresh)) if fresh.state == SubscriptionState::Dropped => current = fresh,
                    _ => return,
                },
                Err(e) => {
                    tracing::error!("❌ Could not record alert status for {}: {e}", sub.id);
                    return;
                }
            }
        }
        tracing::error!("❌ Gave up recording alert status for {}", sub.id);
    }

    // ─── Lifecycle ──────────────────────────────────────────

    /// Rebuild the queue from the store and retry alerts that were owed when
    /// the process last stopped (one attempt each).
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let scheduled = self.store.list_scheduled()?;
        for (id, at) in &scheduled {
            self.queue.schedule(id.clone(), *at).await;
        }

        let pending = self.store.list_pending_notifications()?;
        let mut report = RecoveryReport {
            rescheduled: scheduled.len(),
            pending_alerts: pending.len(),
            delivered: 0,
        };
        for sub in pending {
            let Some(_claim) = self.claim(&sub.id) else {
                continue;
            };
            tracing::info!("♻️ Retrying owed alert for {} ({})", sub.url, sub.id);
            if self.deliver(sub, 1).await {
                report.delivered += 1;
            }
        }

        tracing::info!(
            "♻️ Recovery: {} scheduled, {}/{} owed alerts delivered",
            report.rescheduled,
            report.delivered,
            report.pending_alerts
        );
        Ok(report)
    }

    /// Queue every due subscription the store knows about.
    async fn sweep(&self) {
        let now = Utc::now();
        match self.store.list_due(now) {
            Ok(ids) => {
                for id in ids {
                    let busy = self
                        .in_flight
                        .lock()
                        .map(|set| set.contains(&id))
                        .unwrap_or(false);
                    if !busy {
                        self.queue.schedule(id, now).await;
                    }
                }
            }
            Err(e) => tracing::warn!("⚠️ Sweep failed: {e}"),
        }
    }

    /// Dispatch due checks until `shutdown` resolves, then wait (bounded) for
    /// in-flight checks to finish.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let workers = self.settings.workers.max(1);
        let permits = Arc::new(Semaphore::new(workers));
        let mut last_sweep = Instant::now();
        tracing::info!("⏰ Scheduler started ({workers} workers)");

        'dispatch: loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.queue.wait(self.settings.sweep_interval) => {}
            }

            if last_sweep.elapsed() >= self.settings.sweep_interval {
                last_sweep = Instant::now();
                self.sweep().await;
            }

            for id in self.queue.pop_due(Utc::now()).await {
                let permit = tokio::select! {
                    _ = &mut shutdown => break 'dispatch,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break 'dispatch,
                    },
                };
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.check(&id).await {
                        tracing::error!("❌ Check for {id} failed: {e}");
                    }
                    drop(permit);
                });
            }
        }

        tracing::info!("🛑 Scheduler stopping; waiting for in-flight checks");
        let grace = self.settings.probe_timeout + Duration::from_secs(5);
        if tokio::time::timeout(grace, permits.acquire_many(workers as u32))
            .await
            .is_err()
        {
            tracing::warn!("⚠️ In-flight checks still running at shutdown");
        }
    }

    // ─── Introspection ──────────────────────────────────────

    pub async fn status(&self) -> Result<SchedulerStatus> {
        let queue = self.queue.stats().await;
        Ok(SchedulerStatus {
            active_probes: self.active_probes(),
            queued: queue.queued,
            next_due: queue.next_due,
            selectors_loaded: self.selectors.snapshot().len(),
            subscriptions: self.store.counts()?,
        })
    }

    /// Most recent notification attempts, newest first.
    pub async fn recent_notifications(&self, limit: usize) -> Vec<Notification> {
        self.history.lock().await.recent(limit)
    }
}

async fn record(store: &SubscriptionStore, history: &Mutex<NotifyHistory>, entry: Notification) {
    if let Err(e) = store.record_notification(&entry) {
        tracing::warn!("⚠️ Could not persist notification: {e}");
    }
    history.lock().await.record(entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{FixedDelay, FixedInterval};
    use async_trait::async_trait;
    use prcdrop_core::error::NotifyError;
    use prcdrop_core::selectors::SelectorTable;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    const URL: &str = "https://www.takealot.com/product/123";
    const EMAIL: &str = "bob@mail.com";

    #[derive(Default)]
    struct ScriptedProbe {
        script: std::sync::Mutex<VecDeque<std::result::Result<f64, ProbeFailure>>>,
        calls: AtomicUsize,
        urls: std::sync::Mutex<Vec<String>>,
        delay: Duration,
    }

    impl ScriptedProbe {
        fn new(script: Vec<std::result::Result<f64, ProbeFailure>>) -> Self {
            Self {
                script: std::sync::Mutex::new(script.into()),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn urls(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PriceProbe for ScriptedProbe {
        async fn probe(
            &self,
            url: &str,
            _selectors: &SelectorTable,
        ) -> std::result::Result<f64, ProbeFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ProbeFailure::NotFound("script exhausted".into())))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: std::sync::Mutex<Vec<(String, String, String)>>,
        fail_first: AtomicU32,
        attempts: AtomicU32,
        delay: Duration,
    }

    impl RecordingNotifier {
        fn failing(n: u32) -> Self {
            Self {
                fail_first: AtomicU32::new(n),
                ..Self::default()
            }
        }

        fn sent(&self) -> Vec<(String, String, String)> {
            self.sent.lock().unwrap().clone()
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            subject: &str,
            body: &str,
            recipient: &str,
        ) -> std::result::Result<(), NotifyError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(NotifyError::Smtp("connection refused".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((subject.into(), body.into(), recipient.into()));
            Ok(())
        }

        fn channel_name(&self) -> &str {
            "recording"
        }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            workers: 2,
            probe_timeout: Duration::from_secs(2),
            notify_attempts: 3,
            notify_retry_delay: Duration::ZERO,
            support_email: Some("support@prcdrop.co.za".into()),
            sweep_interval: Duration::from_secs(60),
        }
    }

    fn selectors() -> Arc<SelectorStore> {
        Arc::new(SelectorStore::fixed(SelectorTable::new([(
            "takealot.com",
            "span.currency",
        )])))
    }

    /// Scheduler whose retries and rechecks are due immediately.
    fn scheduler_with(
        store: Arc<SubscriptionStore>,
        probe: Arc<ScriptedProbe>,
        notifier: Arc<RecordingNotifier>,
    ) -> Scheduler {
        Scheduler::new(store, selectors(), probe, notifier)
            .with_settings(settings())
            .with_retry_policy(Arc::new(FixedDelay::new(Duration::ZERO, 5)))
            .with_reschedule_policy(Arc::new(FixedInterval::new(Duration::ZERO)))
    }

    fn harness(
        script: Vec<std::result::Result<f64, ProbeFailure>>,
    ) -> (Scheduler, Arc<ScriptedProbe>, Arc<RecordingNotifier>) {
        let store = Arc::new(SubscriptionStore::open_in_memory().unwrap());
        let probe = Arc::new(ScriptedProbe::new(script));
        let notifier = Arc::new(RecordingNotifier::default());
        (
            scheduler_with(store, probe.clone(), notifier.clone()),
            probe,
            notifier,
        )
    }

    async fn tracked(s: &Scheduler) -> SubscriptionId {
        match s.subscribe(URL, EMAIL).await.unwrap() {
            SubscribeOutcome::Tracking { id, created } => {
                assert!(created);
                id
            }
            other => panic!("expected tracking, got {other:?}"),
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_first_price_becomes_baseline() {
        let store = Arc::new(SubscriptionStore::open_in_memory().unwrap());
        let probe = Arc::new(ScriptedProbe::new(vec![Ok(500.0)]));
        let notifier = Arc::new(RecordingNotifier::default());
        let s = Scheduler::new(store, selectors(), probe, notifier.clone()).with_settings(settings());
        let id = tracked(&s).await;

        let effect = s.check(&id).await.unwrap().unwrap();
        assert!(matches!(effect, Effect::BaselineSet { price, .. } if price == 500.0));

        let sub = s.store().get(&id).unwrap().unwrap();
        assert_eq!(sub.state, SubscriptionState::Active);
        assert_eq!(sub.baseline, Some(500.0));
        assert!(sub.next_check.unwrap() > Utc::now() + chrono::Duration::minutes(19));
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_drop_notifies_exactly_once() {
        let (s, probe, notifier) = harness(vec![Ok(500.0), Ok(450.0), Ok(400.0)]);
        let id = tracked(&s).await;

        s.check(&id).await.unwrap();
        let effect = s.check(&id).await.unwrap().unwrap();
        assert_eq!(
            effect,
            Effect::Dropped {
                price: 450.0,
                baseline: 500.0
            }
        );

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "Price Drop Alert!");
        assert!(sent[0].1.contains("R450.00"));
        assert_eq!(sent[0].2, EMAIL);

        let sub = s.store().get(&id).unwrap().unwrap();
        assert_eq!(sub.state, SubscriptionState::Dropped);
        assert_eq!(sub.notify_status, NotifyStatus::Sent);
        assert_eq!(sub.baseline, Some(500.0));

        assert_eq!(s.check(&id).await.unwrap(), None);
        assert_eq!(probe.calls(), 2);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_submitted_url_is_fetched_and_linked() {
        let (s, probe, notifier) = harness(vec![Ok(500.0), Ok(450.0)]);
        let id = tracked(&s).await;
        assert_eq!(s.store().get(&id).unwrap().unwrap().url, URL);

        s.check(&id).await.unwrap();
        s.check(&id).await.unwrap();

        assert_eq!(probe.urls(), vec![URL.to_string(), URL.to_string()]);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.ends_with(&format!("\n{URL}")));
    }

    #[tokio::test]
    async fn test_www_variants_share_one_subscription() {
        let (s, _, _) = harness(vec![]);
        let id = tracked(&s).await;
        match s
            .subscribe("https://takealot.com/product/123", EMAIL)
            .await
            .unwrap()
        {
            SubscribeOutcome::Tracking { id: again, created } => {
                assert_eq!(again, id);
                assert!(!created);
            }
            other => panic!("expected tracking, got {other:?}"),
        }
        assert_eq!(s.store().get(&id).unwrap().unwrap().url, URL);
    }

    #[tokio::test]
    async fn test_price_rise_keeps_monitoring() {
        let (s, _, notifier) = harness(vec![Ok(500.0), Ok(650.0), Ok(500.0)]);
        let id = tracked(&s).await;
        for _ in 0..3 {
            s.check(&id).await.unwrap();
        }
        let sub = s.store().get(&id).unwrap().unwrap();
        assert_eq!(sub.state, SubscriptionState::Active);
        assert_eq!(sub.baseline, Some(500.0));
        assert_eq!(sub.last_price, Some(500.0));
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failures_exhaust_budget() {
        let (s, probe, notifier) = harness(vec![
            Err(ProbeFailure::Timeout(60)),
            Err(ProbeFailure::NotFound("span.currency".into())),
            Err(ProbeFailure::ParseError("Sold out".into())),
            Err(ProbeFailure::Timeout(60)),
            Err(ProbeFailure::Timeout(60)),
        ]);
        let id = tracked(&s).await;

        for n in 1..=4 {
            let effect = s.check(&id).await.unwrap().unwrap();
            assert!(matches!(effect, Effect::Retry { failures, .. } if failures == n));
        }
        assert_eq!(
            s.check(&id).await.unwrap(),
            Some(Effect::Abandoned { failures: 5 })
        );

        let sub = s.store().get(&id).unwrap().unwrap();
        assert_eq!(sub.state, SubscriptionState::Abandoned);
        assert_eq!(sub.baseline, None);
        assert_eq!(s.check(&id).await.unwrap(), None);
        assert_eq!(probe.calls(), 5);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let (s, _, _) = harness(vec![
            Err(ProbeFailure::Timeout(60)),
            Err(ProbeFailure::Timeout(60)),
            Ok(300.0),
        ]);
        let id = tracked(&s).await;
        for _ in 0..3 {
            s.check(&id).await.unwrap();
        }
        let sub = s.store().get(&id).unwrap().unwrap();
        assert_eq!(sub.failures, 0);
        assert_eq!(sub.baseline, Some(300.0));
    }

    #[tokio::test]
    async fn test_unsupported_domain_alerts_operator() {
        let (s, probe, notifier) = harness(vec![]);
        let outcome = s
            .subscribe("https://www.unknown-shop.co.za/item/9", EMAIL)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SubscribeOutcome::Unsupported {
                domain: "unknown-shop.co.za".into()
            }
        );

        wait_for(|| !notifier.sent().is_empty()).await;
        let sent = notifier.sent();
        assert_eq!(sent[0].0, "Website Support!");
        assert_eq!(sent[0].1, "Add website support for unknown-shop.co.za");
        assert_eq!(sent[0].2, "support@prcdrop.co.za");

        let counts = s.store().counts().unwrap();
        assert_eq!(counts.get("unsupported"), Some(&1));
        assert_eq!(counts.get("active"), None);
        assert!(s.store().list_due(Utc::now()).unwrap().is_empty());
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_subscribe_does_not_wait_for_mail() {
        let store = Arc::new(SubscriptionStore::open_in_memory().unwrap());
        let probe = Arc::new(ScriptedProbe::new(vec![]));
        let notifier = Arc::new(RecordingNotifier {
            delay: Duration::from_millis(300),
            ..RecordingNotifier::failing(10)
        });
        let s = scheduler_with(store, probe, notifier.clone());

        let outcome = tokio::time::timeout(
            Duration::from_millis(200),
            s.subscribe("https://unknown-shop.co.za/item/9", EMAIL),
        )
        .await
        .expect("subscribe waited on the support mail")
        .unwrap();
        assert_eq!(
            outcome,
            SubscribeOutcome::Unsupported {
                domain: "unknown-shop.co.za".into()
            }
        );
        assert!(notifier.sent().is_empty());

        wait_for(|| notifier.attempts() == 1).await;
        for _ in 0..100 {
            if !s.recent_notifications(10).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let history = s.recent_notifications(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, NotificationKind::UnsupportedSite);
        assert!(!history[0].delivered);
        assert_eq!(
            s.store().counts().unwrap().get("unsupported"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_invalid_request_creates_nothing() {
        let (s, _, _) = harness(vec![]);
        let err = s.subscribe("", EMAIL).await.unwrap_err();
        assert!(matches!(err, PrcDropError::InvalidRequest(_)));
        let err = s.subscribe(URL, "").await.unwrap_err();
        assert!(matches!(err, PrcDropError::InvalidRequest(_)));
        assert!(s.store().counts().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_subscribe() {
        let (s, _, _) = harness(vec![]);
        let s = Arc::new(s);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = s.clone();
            handles.push(tokio::spawn(async move { s.subscribe(URL, EMAIL).await }));
        }
        let mut created = 0;
        let mut ids = HashSet::new();
        for h in handles {
            match h.await.unwrap().unwrap() {
                SubscribeOutcome::Tracking { id, created: c } => {
                    ids.insert(id);
                    if c {
                        created += 1;
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(s.store().counts().unwrap().get("active"), Some(&1));
    }

    #[tokio::test]
    async fn test_overlapping_checks_probe_once() {
        let store = Arc::new(SubscriptionStore::open_in_memory().unwrap());
        let probe = Arc::new(ScriptedProbe {
            delay: Duration::from_millis(100),
            ..ScriptedProbe::new(vec![Ok(500.0), Ok(500.0)])
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let s = scheduler_with(store, probe.clone(), notifier);
        let id = tracked(&s).await;

        let (a, b) = tokio::join!(s.check(&id), s.check(&id));
        let applied = [a.unwrap(), b.unwrap()].iter().filter(|e| e.is_some()).count();
        assert_eq!(applied, 1);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_failure() {
        let store = Arc::new(SubscriptionStore::open_in_memory().unwrap());
        let probe = Arc::new(ScriptedProbe {
            delay: Duration::from_secs(5),
            ..ScriptedProbe::new(vec![Ok(500.0)])
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let s = scheduler_with(store, probe, notifier).with_settings(SchedulerSettings {
            probe_timeout: Duration::from_millis(50),
            ..settings()
        });
        let id = tracked(&s).await;

        let effect = s.check(&id).await.unwrap().unwrap();
        assert!(matches!(effect, Effect::Retry { failures: 1, .. }));
        let sub = s.store().get(&id).unwrap().unwrap();
        assert!(sub.last_error.unwrap().contains("timed out"));
        assert_eq!(s.active_probes(), 0);
    }

    /// Bumps the stored version mid-probe, as a competing writer would.
    struct InterferingProbe {
        store: Arc<SubscriptionStore>,
        id: std::sync::Mutex<Option<SubscriptionId>>,
    }

    #[async_trait]
    impl PriceProbe for InterferingProbe {
        async fn probe(
            &self,
            _url: &str,
            _selectors: &SelectorTable,
        ) -> std::result::Result<f64, ProbeFailure> {
            let id = self.id.lock().unwrap().clone().unwrap();
            let current = self.store.get(&id).unwrap().unwrap();
            let mut next = current.clone();
            next.last_error = Some("touched".into());
            self.store.compare_and_update(&current, &next).unwrap();
            Ok(500.0)
        }

        fn name(&self) -> &str {
            "interfering"
        }
    }

    #[tokio::test]
    async fn test_conflict_is_resolved_by_rereading() {
        let store = Arc::new(SubscriptionStore::open_in_memory().unwrap());
        let probe = Arc::new(InterferingProbe {
            store: store.clone(),
            id: std::sync::Mutex::new(None),
        });
        let s = Scheduler::new(
            store.clone(),
            selectors(),
            probe.clone(),
            Arc::new(RecordingNotifier::default()),
        )
        .with_settings(settings());
        let id = tracked(&s).await;
        *probe.id.lock().unwrap() = Some(id.clone());

        let effect = s.check(&id).await.unwrap().unwrap();
        assert!(matches!(effect, Effect::BaselineSet { .. }));
        let sub = store.get(&id).unwrap().unwrap();
        assert_eq!(sub.baseline, Some(500.0));
        assert_eq!(sub.version, 3);
    }

    #[tokio::test]
    async fn test_alert_retried_then_sent() {
        let store = Arc::new(SubscriptionStore::open_in_memory().unwrap());
        let probe = Arc::new(ScriptedProbe::new(vec![Ok(500.0), Ok(100.0)]));
        let notifier = Arc::new(RecordingNotifier::failing(2));
        let s = scheduler_with(store, probe, notifier.clone());
        let id = tracked(&s).await;
        s.check(&id).await.unwrap();
        s.check(&id).await.unwrap();

        assert_eq!(notifier.sent().len(), 1);
        let sub = s.store().get(&id).unwrap().unwrap();
        assert_eq!(sub.notify_status, NotifyStatus::Sent);
        assert_eq!(sub.notify_attempts, 3);

        let history = s.recent_notifications(10).await;
        assert_eq!(history.len(), 3);
        assert!(history[0].delivered);
        assert!(!history[2].delivered);
        assert_eq!(s.store().recent_notifications(10).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_undeliverable_alert_stays_dropped() {
        let store = Arc::new(SubscriptionStore::open_in_memory().unwrap());
        let probe = Arc::new(ScriptedProbe::new(vec![Ok(500.0), Ok(100.0), Ok(50.0)]));
        let notifier = Arc::new(RecordingNotifier::failing(10));
        let s = scheduler_with(store, probe.clone(), notifier.clone());
        let id = tracked(&s).await;
        s.check(&id).await.unwrap();
        s.check(&id).await.unwrap();

        let sub = s.store().get(&id).unwrap().unwrap();
        assert_eq!(sub.state, SubscriptionState::Dropped);
        assert_eq!(sub.notify_status, NotifyStatus::Failed);
        assert_eq!(sub.notify_attempts, 3);
        assert!(notifier.sent().is_empty());

        assert_eq!(s.check(&id).await.unwrap(), None);
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn test_restart_resumes_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.db");

        let id = {
            let store = Arc::new(SubscriptionStore::open(&path).unwrap());
            let probe = Arc::new(ScriptedProbe::new(vec![Ok(500.0)]));
            let s = scheduler_with(store, probe, Arc::new(RecordingNotifier::default()));
            let id = tracked(&s).await;
            s.check(&id).await.unwrap();
            id
        };

        let store = Arc::new(SubscriptionStore::open(&path).unwrap());
        let probe = Arc::new(ScriptedProbe::new(vec![Ok(450.0)]));
        let notifier = Arc::new(RecordingNotifier::default());
        let s = scheduler_with(store, probe, notifier.clone());

        let report = s.recover().await.unwrap();
        assert_eq!(report.rescheduled, 1);
        assert_eq!(report.pending_alerts, 0);
        assert_eq!(s.status().await.unwrap().queued, 1);

        let effect = s.check(&id).await.unwrap().unwrap();
        assert!(matches!(effect, Effect::Dropped { baseline, .. } if baseline == 500.0));
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_delivers_owed_alert_once() {
        let (s, _, notifier) = harness(vec![]);
        let id = tracked(&s).await;
        let current = s.store().get(&id).unwrap().unwrap();
        let mut dropped = current.clone();
        dropped.baseline = Some(500.0);
        dropped.last_price = Some(450.0);
        dropped.state = SubscriptionState::Dropped;
        dropped.next_check = None;
        dropped.notify_status = NotifyStatus::Pending;
        s.store().compare_and_update(&current, &dropped).unwrap();

        let report = s.recover().await.unwrap();
        assert_eq!(report.pending_alerts, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(notifier.sent().len(), 1);

        let report = s.recover().await.unwrap();
        assert_eq!(report.pending_alerts, 0);
        assert_eq!(notifier.sent().len(), 1);
        assert_eq!(
            s.store().get(&id).unwrap().unwrap().notify_status,
            NotifyStatus::Sent
        );
    }

    #[tokio::test]
    async fn test_recovery_failure_is_not_retried() {
        let store = Arc::new(SubscriptionStore::open_in_memory().unwrap());
        let probe = Arc::new(ScriptedProbe::new(vec![]));
        let notifier = Arc::new(RecordingNotifier::failing(10));
        let s = scheduler_with(store, probe, notifier.clone());
        let id = tracked(&s).await;
        let current = s.store().get(&id).unwrap().unwrap();
        let mut dropped = current.clone();
        dropped.baseline = Some(500.0);
        dropped.last_price = Some(450.0);
        dropped.state = SubscriptionState::Dropped;
        dropped.next_check = None;
        dropped.notify_status = NotifyStatus::Pending;
        s.store().compare_and_update(&current, &dropped).unwrap();

        let report = s.recover().await.unwrap();
        assert_eq!(report.pending_alerts, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(notifier.attempts(), 1);

        let sub = s.store().get(&id).unwrap().unwrap();
        assert_eq!(sub.state, SubscriptionState::Dropped);
        assert_eq!(sub.notify_status, NotifyStatus::Failed);
        assert_eq!(sub.notify_attempts, 1);

        let report = s.recover().await.unwrap();
        assert_eq!(report.pending_alerts, 0);
        assert_eq!(report.delivered, 0);
        assert_eq!(notifier.attempts(), 1);
        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = PrcDropConfig::default();
        config.scheduler.sweep_interval_secs = 15;
        assert_eq!(
            SchedulerSettings::from_config(&config).sweep_interval,
            Duration::from_secs(15)
        );
        config.scheduler.sweep_interval_secs = 0;
        assert_eq!(
            SchedulerSettings::from_config(&config).sweep_interval,
            Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn test_run_loop_drives_subscription_to_drop() {
        let (s, _, notifier) = harness(vec![Ok(500.0), Ok(700.0), Ok(450.0)]);
        let s = Arc::new(s);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let runner = tokio::spawn(s.clone().run(async {
            let _ = rx.await;
        }));

        let id = tracked(&s).await;
        wait_for(|| notifier.sent().len() == 1).await;
        tx.send(()).unwrap();
        runner.await.unwrap();

        let sub = s.store().get(&id).unwrap().unwrap();
        assert_eq!(sub.state, SubscriptionState::Dropped);
        assert_eq!(sub.last_price, Some(450.0));
        assert_eq!(notifier.sent().len(), 1);
    }
}

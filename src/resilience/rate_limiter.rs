//! Per-resource admission control.
//!
//! Every resource owns four token buckets (requests and tokens, per minute and
//! per hour) refilled lazily on access, plus a FIFO wait queue drained by a
//! periodic sweep.
//!
//! Admission reserves one request and the caller's estimate up front, either
//! through [`RateGovernor::try_reserve`] or when the sweep releases a queued
//! caller. Once the call completes, [`RateGovernor::settle`] charges the
//! difference between realized and reserved cost.

use super::hooks::{GovernanceObserver, Observers};
use crate::errors::{GovernorError, GovernorResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Quotas of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuotaConfig {
    /// Requests admitted per minute
    pub requests_per_minute: u32,
    /// Requests admitted per hour
    pub requests_per_hour: u32,
    /// Token units admitted per minute
    pub tokens_per_minute: u64,
    /// Token units admitted per hour
    pub tokens_per_hour: u64,
    /// Multiplier applied to bucket capacity, never to the refill rate
    pub burst_allowance: f64,
}

impl ResourceQuotaConfig {
    /// Create quotas with no burst headroom
    pub fn new(
        requests_per_minute: u32,
        requests_per_hour: u32,
        tokens_per_minute: u64,
        tokens_per_hour: u64,
    ) -> Self {
        Self {
            requests_per_minute,
            requests_per_hour,
            tokens_per_minute,
            tokens_per_hour,
            burst_allowance: 1.0,
        }
    }

    /// Set burst allowance
    pub fn burst_allowance(mut self, burst: f64) -> Self {
        self.burst_allowance = burst;
        self
    }

    /// Apply the fields set in `overrides`
    pub fn merge(mut self, overrides: &QuotaOverrides) -> Self {
        if let Some(v) = overrides.requests_per_minute {
            self.requests_per_minute = v;
        }
        if let Some(v) = overrides.requests_per_hour {
            self.requests_per_hour = v;
        }
        if let Some(v) = overrides.tokens_per_minute {
            self.tokens_per_minute = v;
        }
        if let Some(v) = overrides.tokens_per_hour {
            self.tokens_per_hour = v;
        }
        if let Some(v) = overrides.burst_allowance {
            self.burst_allowance = v;
        }
        self
    }

    pub(crate) fn validate(&self, resource: &str) -> GovernorResult<()> {
        if self.requests_per_minute == 0
            || self.requests_per_hour == 0
            || self.tokens_per_minute == 0
            || self.tokens_per_hour == 0
        {
            return Err(GovernorError::configuration(format!(
                "resource '{}' has a zero rate",
                resource
            )));
        }
        if self.burst_allowance.is_nan() || self.burst_allowance < 1.0 {
            return Err(GovernorError::configuration(format!(
                "resource '{}' burst allowance must be at least 1, got {}",
                resource, self.burst_allowance
            )));
        }
        Ok(())
    }
}

/// Partial quota settings merged onto a base configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuotaOverrides {
    /// Requests per minute
    pub requests_per_minute: Option<u32>,
    /// Requests per hour
    pub requests_per_hour: Option<u32>,
    /// Tokens per minute
    pub tokens_per_minute: Option<u64>,
    /// Tokens per hour
    pub tokens_per_hour: Option<u64>,
    /// Burst allowance
    pub burst_allowance: Option<f64>,
}

/// Configuration of the rate governor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateGovernorConfig {
    /// Quotas keyed by resource name
    pub resources: BTreeMap<String, ResourceQuotaConfig>,
    /// Period of the queue sweep
    #[serde(rename = "sweepIntervalMs", with = "crate::config::duration_ms")]
    pub sweep_interval: Duration,
    /// Token level under which a resource reports itself as limited
    pub low_watermark_tokens: u64,
}

impl Default for RateGovernorConfig {
    fn default() -> Self {
        let mut resources = BTreeMap::new();
        resources.insert(
            "claude-3-opus".to_string(),
            ResourceQuotaConfig::new(50, 1000, 20_000, 300_000).burst_allowance(1.5),
        );
        resources.insert(
            "claude-3-5-sonnet".to_string(),
            ResourceQuotaConfig::new(50, 1000, 40_000, 400_000).burst_allowance(1.5),
        );
        resources.insert(
            "claude-3-haiku".to_string(),
            ResourceQuotaConfig::new(50, 1000, 100_000, 1_000_000).burst_allowance(2.0),
        );

        Self {
            resources,
            sweep_interval: Duration::from_secs(1),
            low_watermark_tokens: 100,
        }
    }
}

impl RateGovernorConfig {
    /// Configuration with no resources
    pub fn empty() -> Self {
        Self {
            resources: BTreeMap::new(),
            ..Self::default()
        }
    }

    /// Add or replace a resource
    pub fn resource(mut self, name: impl Into<String>, quota: ResourceQuotaConfig) -> Self {
        self.resources.insert(name.into(), quota);
        self
    }

    /// Merge partial settings onto an existing resource
    pub fn override_resource(mut self, name: &str, overrides: &QuotaOverrides) -> Self {
        if let Some(quota) = self.resources.remove(name) {
            self.resources
                .insert(name.to_string(), quota.merge(overrides));
        }
        self
    }

    /// Set sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set low watermark
    pub fn low_watermark_tokens(mut self, tokens: u64) -> Self {
        self.low_watermark_tokens = tokens;
        self
    }

    pub(crate) fn validate(&self) -> GovernorResult<()> {
        if self.resources.is_empty() {
            return Err(GovernorError::configuration("no resources configured"));
        }
        if self.sweep_interval.is_zero() {
            return Err(GovernorError::configuration(
                "sweep interval must be non-zero",
            ));
        }
        for (name, quota) in &self.resources {
            quota.validate(name)?;
        }
        Ok(())
    }
}

/// Token bucket refilled lazily from elapsed time
#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    level: f64,
    rate: f64,
    window_ms: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Starts at the steady-state level; burst only raises the ceiling
    fn new(rate: f64, window: Duration, burst: f64, now: Instant) -> Self {
        Self {
            capacity: rate * burst,
            level: rate,
            rate,
            window_ms: window.as_secs_f64() * 1000.0,
            last_refill: now,
        }
    }

    fn refill_at(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_secs_f64() * 1000.0;
        self.level = (self.level + elapsed_ms * self.rate / self.window_ms).min(self.capacity);
        self.last_refill = now;
    }

    fn has(&self, amount: f64) -> bool {
        self.level >= amount
    }

    fn drain(&mut self, amount: f64) {
        self.level = (self.level - amount).max(0.0);
    }

    fn refund(&mut self, amount: f64) {
        self.level = (self.level + amount).min(self.capacity);
    }

    fn fill(&mut self, now: Instant) {
        self.level = self.capacity;
        self.last_refill = now;
    }

    fn time_until_full(&self) -> Duration {
        let missing = self.capacity - self.level;
        if missing <= 0.0 || self.rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(missing * self.window_ms / self.rate / 1000.0)
    }

    fn remaining(&self) -> u64 {
        self.level.floor() as u64
    }

    fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            level: self.level,
            capacity: self.capacity,
        }
    }
}

#[derive(Debug)]
struct BucketSet {
    requests_minute: TokenBucket,
    requests_hour: TokenBucket,
    tokens_minute: TokenBucket,
    tokens_hour: TokenBucket,
}

impl BucketSet {
    fn new(quota: &ResourceQuotaConfig, now: Instant) -> Self {
        let burst = quota.burst_allowance;
        Self {
            requests_minute: TokenBucket::new(quota.requests_per_minute as f64, MINUTE, burst, now),
            requests_hour: TokenBucket::new(quota.requests_per_hour as f64, HOUR, burst, now),
            tokens_minute: TokenBucket::new(quota.tokens_per_minute as f64, MINUTE, burst, now),
            tokens_hour: TokenBucket::new(quota.tokens_per_hour as f64, HOUR, burst, now),
        }
    }

    fn each_mut(&mut self) -> [&mut TokenBucket; 4] {
        [
            &mut self.requests_minute,
            &mut self.requests_hour,
            &mut self.tokens_minute,
            &mut self.tokens_hour,
        ]
    }

    fn refill(&mut self, now: Instant) {
        for bucket in self.each_mut() {
            bucket.refill_at(now);
        }
    }

    fn admits(&self, tokens: f64) -> bool {
        self.requests_minute.has(1.0)
            && self.requests_hour.has(1.0)
            && self.tokens_minute.has(tokens)
            && self.tokens_hour.has(tokens)
    }

    fn drain(&mut self, tokens: f64) {
        self.requests_minute.drain(1.0);
        self.requests_hour.drain(1.0);
        self.tokens_minute.drain(tokens);
        self.tokens_hour.drain(tokens);
    }

    /// Return one request and `tokens` units, capped at capacity
    fn refund(&mut self, tokens: f64) {
        self.requests_minute.refund(1.0);
        self.requests_hour.refund(1.0);
        self.refund_tokens(tokens);
    }

    fn refund_tokens(&mut self, tokens: f64) {
        self.tokens_minute.refund(tokens);
        self.tokens_hour.refund(tokens);
    }

    /// Charge (positive) or return (negative) token units only
    fn adjust_tokens(&mut self, delta: f64) {
        if delta >= 0.0 {
            self.tokens_minute.drain(delta);
            self.tokens_hour.drain(delta);
        } else {
            self.refund_tokens(-delta);
        }
    }

    fn token_ceiling(&self) -> f64 {
        self.tokens_minute.capacity.min(self.tokens_hour.capacity)
    }
}

#[derive(Debug, Clone, Copy)]
struct UsageSample {
    at: Instant,
    tokens: u64,
}

struct Waiter {
    id: u64,
    estimated: u64,
    release: oneshot::Sender<()>,
}

struct ResourceInner {
    buckets: BucketSet,
    usage: VecDeque<UsageSample>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl ResourceInner {
    fn prune_usage(&mut self, now: Instant) {
        while let Some(sample) = self.usage.front() {
            if now.saturating_duration_since(sample.at) > HOUR {
                self.usage.pop_front();
            } else {
                break;
            }
        }
    }
}

struct ResourceState {
    name: String,
    inner: Mutex<ResourceInner>,
}

/// Aggregation window for usage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageWindow {
    /// Last 60 seconds
    Minute,
    /// Last 60 minutes
    Hour,
}

impl UsageWindow {
    fn duration(&self) -> Duration {
        match self {
            UsageWindow::Minute => MINUTE,
            UsageWindow::Hour => HOUR,
        }
    }
}

/// Consumption recorded within a window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    /// Requests charged
    pub requests: u64,
    /// Token units charged
    pub tokens: u64,
    /// Mean token units per request, zero without requests
    pub average_tokens_per_request: f64,
}

/// Remaining amount per window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowRemaining {
    /// Minute bucket
    pub per_minute: u64,
    /// Hour bucket
    pub per_hour: u64,
}

/// Estimated instants at which each window's buckets are full again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowResets {
    /// Minute buckets
    pub minute: DateTime<Utc>,
    /// Hour buckets
    pub hour: DateTime<Utc>,
}

/// Point-in-time admission status of a resource
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    /// Resource name
    pub resource: String,
    /// Whole requests left
    pub requests_remaining: WindowRemaining,
    /// Whole token units left
    pub tokens_remaining: WindowRemaining,
    /// Sliding reset estimates
    pub next_reset: WindowResets,
    /// True when a request bucket is empty or a token bucket is under the low watermark
    pub is_limited: bool,
    /// Callers waiting for admission
    pub queue_length: usize,
}

/// Level and capacity of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BucketSnapshot {
    /// Current level
    pub level: f64,
    /// Maximum level
    pub capacity: f64,
}

/// Levels of the four buckets of a resource
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketLevels {
    /// Requests per minute
    pub requests_per_minute: BucketSnapshot,
    /// Requests per hour
    pub requests_per_hour: BucketSnapshot,
    /// Tokens per minute
    pub tokens_per_minute: BucketSnapshot,
    /// Tokens per hour
    pub tokens_per_hour: BucketSnapshot,
}

impl BucketLevels {
    /// All four snapshots
    pub fn all(&self) -> [BucketSnapshot; 4] {
        [
            self.requests_per_minute,
            self.requests_per_hour,
            self.tokens_per_minute,
            self.tokens_per_hour,
        ]
    }
}

/// Place in a resource's wait queue.
///
/// A release carries a reservation of one request and the stored estimate.
/// Dropping the ticket before it is released removes the entry; dropping it
/// after a release it never observed returns the reservation.
#[must_use = "a queued request is only admitted by awaiting its ticket"]
pub struct QueueTicket {
    state: Arc<ResourceState>,
    id: u64,
    estimated: u64,
    receiver: oneshot::Receiver<()>,
}

impl QueueTicket {
    /// Resource the ticket is queued on
    pub fn resource(&self) -> &str {
        &self.state.name
    }

    /// Estimate stored with the entry
    pub fn estimated(&self) -> u64 {
        self.estimated
    }

    /// Suspend until the sweep releases this entry with its quota reserved
    pub async fn wait(mut self) -> GovernorResult<()> {
        (&mut self.receiver)
            .await
            .map_err(|_| GovernorError::QueueClosed {
                resource: self.state.name.clone(),
            })
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        // the sweep sends under this lock
        let mut inner = self.state.inner.lock();
        if self.receiver.try_recv().is_ok() {
            inner.buckets.refill(Instant::now());
            inner.buckets.refund(self.estimated as f64);
            debug!(resource = %self.state.name, "Unclaimed reservation returned");
            return;
        }

        let before = inner.queue.len();
        inner.queue.retain(|waiter| waiter.id != self.id);
        if inner.queue.len() < before {
            debug!(resource = %self.state.name, "Abandoned request removed from queue");
        }
    }
}

impl std::fmt::Debug for QueueTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTicket")
            .field("resource", &self.state.name)
            .field("id", &self.id)
            .field("estimated", &self.estimated)
            .finish()
    }
}

/// Handle to the background sweep task; aborts the task on drop
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// True once the task stopped
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Dual-window token-bucket limiter over named resources
pub struct RateGovernor {
    config: RateGovernorConfig,
    resources: BTreeMap<String, Arc<ResourceState>>,
    observers: Observers,
}

impl RateGovernor {
    /// Create a governor with full steady-state quota for every resource
    pub fn new(config: RateGovernorConfig) -> Self {
        let now = Instant::now();
        let resources = config
            .resources
            .iter()
            .map(|(name, quota)| {
                let state = ResourceState {
                    name: name.clone(),
                    inner: Mutex::new(ResourceInner {
                        buckets: BucketSet::new(quota, now),
                        usage: VecDeque::new(),
                        queue: VecDeque::new(),
                        next_ticket: 0,
                    }),
                };
                (name.clone(), Arc::new(state))
            })
            .collect();

        Self {
            config,
            resources,
            observers: Observers::default(),
        }
    }

    /// Register an observer for queue and consumption events
    pub fn with_observer(mut self, observer: Arc<dyn GovernanceObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub(crate) fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    /// Configuration in effect
    pub fn config(&self) -> &RateGovernorConfig {
        &self.config
    }

    /// Names of the configured resources
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// True if `resource` is configured
    pub fn contains(&self, resource: &str) -> bool {
        self.resources.contains_key(resource)
    }

    fn state(&self, resource: &str) -> GovernorResult<&Arc<ResourceState>> {
        self.resources.get(resource).ok_or_else(|| {
            GovernorError::configuration(format!("unknown resource '{}'", resource))
        })
    }

    /// Whether one request of `estimated` token units fits in every bucket.
    ///
    /// Only refills; levels are otherwise untouched.
    pub fn check_limit(&self, resource: &str, estimated: u64) -> GovernorResult<bool> {
        let state = self.state(resource)?;
        let mut inner = state.inner.lock();
        inner.buckets.refill(Instant::now());
        Ok(inner.buckets.admits(estimated as f64))
    }

    /// Charge one request and `actual` token units, saturating at zero
    pub fn consume_limit(&self, resource: &str, actual: u64) -> GovernorResult<()> {
        let state = self.state(resource)?;
        let now = Instant::now();
        {
            let mut inner = state.inner.lock();
            inner.buckets.refill(now);
            inner.buckets.drain(actual as f64);
            inner.usage.push_back(UsageSample { at: now, tokens: actual });
            inner.prune_usage(now);
        }

        debug!(resource, units = actual, "Rate limit consumed");
        self.observers
            .notify(|o| o.on_limit_consumed(resource, actual));
        Ok(())
    }

    /// Reserve one request and `estimated` token units if they fit now.
    ///
    /// Check and deduction happen under one lock. Refuses while callers are
    /// queued on the resource so a new arrival cannot overtake them.
    pub fn try_reserve(&self, resource: &str, estimated: u64) -> GovernorResult<bool> {
        let state = self.state(resource)?;
        let mut inner = state.inner.lock();
        inner.buckets.refill(Instant::now());
        if !inner.queue.is_empty() || !inner.buckets.admits(estimated as f64) {
            return Ok(false);
        }
        inner.buckets.drain(estimated as f64);
        debug!(resource, estimated, "Rate limit reserved");
        Ok(true)
    }

    /// Settle a reservation against the realized cost.
    ///
    /// An underestimate drains the difference, saturating at zero; an
    /// overestimate is returned, capped at capacity. The request unit stays
    /// charged.
    pub fn settle(&self, resource: &str, reserved: u64, actual: u64) -> GovernorResult<()> {
        let state = self.state(resource)?;
        let now = Instant::now();
        {
            let mut inner = state.inner.lock();
            inner.buckets.refill(now);
            inner.buckets.adjust_tokens(actual as f64 - reserved as f64);
            inner.usage.push_back(UsageSample { at: now, tokens: actual });
            inner.prune_usage(now);
        }

        debug!(resource, reserved, units = actual, "Rate limit settled");
        self.observers
            .notify(|o| o.on_limit_consumed(resource, actual));
        Ok(())
    }

    /// Return the token units of a reservation whose call produced nothing
    pub fn release_tokens(&self, resource: &str, reserved: u64) -> GovernorResult<()> {
        let state = self.state(resource)?;
        let mut inner = state.inner.lock();
        inner.buckets.refill(Instant::now());
        inner.buckets.refund_tokens(reserved as f64);
        Ok(())
    }

    /// Append a waiter carrying its estimate to the resource's queue
    pub fn queue_request(&self, resource: &str, estimated: u64) -> GovernorResult<QueueTicket> {
        let state = self.state(resource)?.clone();
        let (release, receiver) = oneshot::channel();

        let (id, queue_length) = {
            let mut inner = state.inner.lock();
            let id = inner.next_ticket;
            inner.next_ticket += 1;
            inner.queue.push_back(Waiter {
                id,
                estimated,
                release,
            });
            (id, inner.queue.len())
        };

        info!(resource, queue_length, estimated, "Request queued for rate limit");
        self.observers
            .notify(|o| o.on_request_queued(resource, queue_length));

        Ok(QueueTicket {
            state,
            id,
            estimated,
            receiver,
        })
    }

    /// Release at most one waiter per resource whose head entry now fits.
    ///
    /// The head is checked against its own estimate, clamped to the smallest
    /// token capacity so an oversized request is not starved. Its reservation
    /// is deducted under the same lock as the release. Returns the number of
    /// waiters released.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut released = 0;

        for state in self.resources.values() {
            let remaining = {
                let mut guard = state.inner.lock();
                let inner = &mut *guard;
                inner.buckets.refill(now);

                let mut remaining = None;
                while let Some(head) = inner.queue.front() {
                    let needed = (head.estimated as f64).min(inner.buckets.token_ceiling());
                    if !inner.buckets.admits(needed) {
                        break;
                    }
                    let Some(waiter) = inner.queue.pop_front() else {
                        break;
                    };
                    if waiter.release.send(()).is_ok() {
                        inner.buckets.drain(waiter.estimated as f64);
                        remaining = Some(inner.queue.len());
                        break;
                    }
                }
                remaining
            };

            if let Some(remaining) = remaining {
                released += 1;
                debug!(resource = %state.name, remaining, "Queued request released");
                self.observers
                    .notify(|o| o.on_request_dequeued(&state.name, remaining));
            }
        }

        released
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` on the current runtime.
    ///
    /// The task holds a weak reference and stops once the governor is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let governor = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        let task = tokio::spawn(run_sweeper(governor, period));
        SweeperHandle { task }
    }

    /// Admission status of one resource
    pub fn get_status(&self, resource: &str) -> GovernorResult<RateLimitStatus> {
        let state = self.state(resource)?;
        let mut inner = state.inner.lock();
        inner.buckets.refill(Instant::now());
        Ok(self.status_of(&state.name, &inner))
    }

    /// Admission status of every resource
    pub fn get_all_statuses(&self) -> BTreeMap<String, RateLimitStatus> {
        let now = Instant::now();
        self.resources
            .iter()
            .map(|(name, state)| {
                let mut inner = state.inner.lock();
                inner.buckets.refill(now);
                (name.clone(), self.status_of(name, &inner))
            })
            .collect()
    }

    fn status_of(&self, resource: &str, inner: &ResourceInner) -> RateLimitStatus {
        let buckets = &inner.buckets;
        let watermark = self.config.low_watermark_tokens as f64;
        let now = Utc::now();
        let reset_at = |a: &TokenBucket, b: &TokenBucket| {
            let wait = a.time_until_full().max(b.time_until_full());
            now + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero())
        };

        RateLimitStatus {
            resource: resource.to_string(),
            requests_remaining: WindowRemaining {
                per_minute: buckets.requests_minute.remaining(),
                per_hour: buckets.requests_hour.remaining(),
            },
            tokens_remaining: WindowRemaining {
                per_minute: buckets.tokens_minute.remaining(),
                per_hour: buckets.tokens_hour.remaining(),
            },
            next_reset: WindowResets {
                minute: reset_at(&buckets.requests_minute, &buckets.tokens_minute),
                hour: reset_at(&buckets.requests_hour, &buckets.tokens_hour),
            },
            is_limited: !buckets.requests_minute.has(1.0)
                || !buckets.requests_hour.has(1.0)
                || !buckets.tokens_minute.has(watermark)
                || !buckets.tokens_hour.has(watermark),
            queue_length: inner.queue.len(),
        }
    }

    /// Usage charged to `resource` within `window`
    pub fn get_usage_stats(
        &self,
        resource: &str,
        window: UsageWindow,
    ) -> GovernorResult<UsageStats> {
        let state = self.state(resource)?;
        let now = Instant::now();
        let mut inner = state.inner.lock();
        inner.prune_usage(now);

        let (requests, tokens) = inner
            .usage
            .iter()
            .filter(|s| now.saturating_duration_since(s.at) <= window.duration())
            .fold((0u64, 0u64), |(r, t), s| (r + 1, t + s.tokens));

        Ok(UsageStats {
            requests,
            tokens,
            average_tokens_per_request: if requests == 0 {
                0.0
            } else {
                tokens as f64 / requests as f64
            },
        })
    }

    /// Current bucket levels of `resource`
    pub fn levels(&self, resource: &str) -> GovernorResult<BucketLevels> {
        let state = self.state(resource)?;
        let mut inner = state.inner.lock();
        inner.buckets.refill(Instant::now());
        let b = &inner.buckets;
        Ok(BucketLevels {
            requests_per_minute: b.requests_minute.snapshot(),
            requests_per_hour: b.requests_hour.snapshot(),
            tokens_per_minute: b.tokens_minute.snapshot(),
            tokens_per_hour: b.tokens_hour.snapshot(),
        })
    }

    /// Waiters queued on `resource`, zero for unknown resources
    pub fn queue_length(&self, resource: &str) -> usize {
        self.resources
            .get(resource)
            .map_or(0, |state| state.inner.lock().queue.len())
    }

    /// Waiters queued across all resources
    pub fn total_queued(&self) -> usize {
        self.resources
            .values()
            .map(|state| state.inner.lock().queue.len())
            .sum()
    }

    /// Fill every bucket, clear usage history and drop all waiters
    pub fn reset(&self) {
        let now = Instant::now();
        let mut dropped = 0;
        for state in self.resources.values() {
            let mut inner = state.inner.lock();
            for bucket in inner.buckets.each_mut() {
                bucket.fill(now);
            }
            inner.usage.clear();
            dropped += inner.queue.len();
            inner.queue.clear();
        }
        if dropped > 0 {
            warn!(dropped, "Rate governor reset dropped queued requests");
        } else {
            info!("Rate governor reset");
        }
    }
}

impl Drop for RateGovernor {
    fn drop(&mut self) {
        for state in self.resources.values() {
            state.inner.lock().queue.clear();
        }
    }
}

impl std::fmt::Debug for RateGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGovernor")
            .field("config", &self.config)
            .field("queued", &self.total_queued())
            .field("observers", &self.observers)
            .finish()
    }
}

async fn run_sweeper(governor: Weak<RateGovernor>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(governor) = governor.upgrade() else {
            debug!("Rate governor dropped, sweeper stopping");
            return;
        };
        governor.sweep();
    }
}

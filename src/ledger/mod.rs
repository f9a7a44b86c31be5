//! Request ledger: one entry per submitted request, finalized on completion
//! and aggregated into running totals.

use crate::errors::GovernorError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Lifecycle state of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Submitted and not yet finished
    InFlight,
    /// Finished with a response
    Succeeded,
    /// Finished with an error
    Failed,
    /// The caller dropped the request before it finished
    Abandoned,
}

/// Bookkeeping for one request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Request identifier
    pub request_id: String,
    /// Resource charged
    pub resource: String,
    /// Units estimated at submission
    pub estimated_cost: u64,
    /// Units charged after completion
    pub actual_cost: Option<u64>,
    /// Cost in USD
    pub cost_usd: f64,
    /// Submission time
    pub started_at: DateTime<Utc>,
    /// Time from submission to finalization
    #[serde(skip_serializing_if = "Option::is_none", with = "optional_ms")]
    pub duration: Option<Duration>,
    /// Current state
    pub status: EntryStatus,
    /// Error kind of a failed request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    started: Option<Instant>,
}

/// Aggregates over every finalized request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    /// Finalized requests
    pub total_requests: u64,
    /// Requests that returned a response
    pub succeeded: u64,
    /// Requests that returned an error
    pub failed: u64,
    /// Requests dropped by their caller
    pub abandoned: u64,
    /// Requests still running
    pub in_flight: usize,
    /// Units charged across all requests
    pub total_units: u64,
    /// USD charged across all requests
    pub total_cost_usd: f64,
    /// Mean time from submission to finalization
    #[serde(with = "crate::config::duration_ms")]
    pub mean_duration: Duration,
    /// Units charged per resource
    pub units_by_resource: BTreeMap<String, u64>,
}

#[derive(Default)]
struct Totals {
    finalized: u64,
    succeeded: u64,
    failed: u64,
    abandoned: u64,
    units: u64,
    cost_usd: f64,
    duration: Duration,
    units_by_resource: BTreeMap<String, u64>,
}

struct LedgerInner {
    in_flight: HashMap<String, LedgerEntry>,
    recent: VecDeque<LedgerEntry>,
    totals: Totals,
}

/// In-memory ledger retaining the most recent finalized entries
pub struct UsageLedger {
    capacity: usize,
    inner: Mutex<LedgerInner>,
}

impl UsageLedger {
    /// Create a ledger retaining up to `capacity` finalized entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LedgerInner {
                in_flight: HashMap::new(),
                recent: VecDeque::new(),
                totals: Totals::default(),
            }),
        }
    }

    /// Record a submission. The returned guard marks the entry abandoned if it
    /// is dropped before being completed or failed.
    pub fn open(
        &self,
        request_id: impl Into<String>,
        resource: impl Into<String>,
        estimated_cost: u64,
    ) -> LedgerGuard<'_> {
        let request_id = request_id.into();
        let entry = LedgerEntry {
            request_id: request_id.clone(),
            resource: resource.into(),
            estimated_cost,
            actual_cost: None,
            cost_usd: 0.0,
            started_at: Utc::now(),
            duration: None,
            status: EntryStatus::InFlight,
            error: None,
            started: Some(Instant::now()),
        };
        self.inner.lock().in_flight.insert(request_id.clone(), entry);

        LedgerGuard {
            ledger: self,
            request_id,
            finalized: false,
        }
    }

    fn finalize(
        &self,
        request_id: &str,
        status: EntryStatus,
        charge: Option<(u64, f64)>,
        error: Option<String>,
    ) -> Option<LedgerEntry> {
        let mut inner = self.inner.lock();
        let mut entry = inner.in_flight.remove(request_id)?;

        let duration = entry
            .started
            .map(|s| Instant::now().saturating_duration_since(s))
            .unwrap_or_default();
        entry.duration = Some(duration);
        entry.status = status;
        entry.error = error;
        if let Some((units, cost_usd)) = charge {
            entry.actual_cost = Some(units);
            entry.cost_usd = cost_usd;
        }

        let totals = &mut inner.totals;
        totals.finalized += 1;
        totals.duration += duration;
        match status {
            EntryStatus::Succeeded => totals.succeeded += 1,
            EntryStatus::Failed => totals.failed += 1,
            EntryStatus::Abandoned => totals.abandoned += 1,
            EntryStatus::InFlight => {}
        }
        if let Some(units) = entry.actual_cost {
            totals.units += units;
            totals.cost_usd += entry.cost_usd;
            *totals
                .units_by_resource
                .entry(entry.resource.clone())
                .or_insert(0) += units;
        }

        if inner.recent.len() == self.capacity {
            inner.recent.pop_front();
        }
        inner.recent.push_back(entry.clone());
        Some(entry)
    }

    /// Aggregated totals
    pub fn summary(&self) -> LedgerSummary {
        let inner = self.inner.lock();
        let totals = &inner.totals;
        LedgerSummary {
            total_requests: totals.finalized,
            succeeded: totals.succeeded,
            failed: totals.failed,
            abandoned: totals.abandoned,
            in_flight: inner.in_flight.len(),
            total_units: totals.units,
            total_cost_usd: totals.cost_usd,
            mean_duration: mean(totals.duration, totals.finalized),
            units_by_resource: totals.units_by_resource.clone(),
        }
    }

    /// Up to `limit` most recently finalized entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<LedgerEntry> {
        self.inner
            .lock()
            .recent
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Entry of a request still running
    pub fn in_flight(&self, request_id: &str) -> Option<LedgerEntry> {
        self.inner.lock().in_flight.get(request_id).cloned()
    }
}

impl std::fmt::Debug for UsageLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("UsageLedger")
            .field("capacity", &self.capacity)
            .field("in_flight", &inner.in_flight.len())
            .field("retained", &inner.recent.len())
            .finish()
    }
}

/// Open ledger entry owned by the request being processed
#[derive(Debug)]
pub struct LedgerGuard<'a> {
    ledger: &'a UsageLedger,
    request_id: String,
    finalized: bool,
}

impl LedgerGuard<'_> {
    /// Identifier of the entry
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Finalize as succeeded with the realized charge
    pub fn complete(mut self, units: u64, cost_usd: f64) -> Option<LedgerEntry> {
        self.finalized = true;
        self.ledger.finalize(
            &self.request_id,
            EntryStatus::Succeeded,
            Some((units, cost_usd)),
            None,
        )
    }

    /// Finalize as failed
    pub fn fail(mut self, error: &GovernorError) -> Option<LedgerEntry> {
        self.finalized = true;
        self.ledger.finalize(
            &self.request_id,
            EntryStatus::Failed,
            None,
            Some(error.kind().as_str().to_string()),
        )
    }
}

impl Drop for LedgerGuard<'_> {
    fn drop(&mut self) {
        if !self.finalized {
            debug!(request_id = %self.request_id, "Request abandoned before completion");
            self.ledger
                .finalize(&self.request_id, EntryStatus::Abandoned, None, None);
        }
    }
}

mod optional_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }
}

fn mean(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

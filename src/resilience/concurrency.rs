use super::hooks::{GovernanceObserver, Observers};
use crate::errors::{GovernorError, GovernorResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

/// Global ceiling on in-flight provider calls.
///
/// Backed by a semaphore whose permit count follows the limit. Raising the
/// limit adds permits; lowering it retires free permits at once and the rest
/// as held ones are returned.
pub struct ConcurrencyGate {
    semaphore: Semaphore,
    state: Mutex<GateState>,
    active: AtomicUsize,
    min_limit: usize,
    max_limit: usize,
    observers: Observers,
}

#[derive(Debug)]
struct GateState {
    limit: usize,
    // held permits to retire on return
    debt: usize,
}

impl ConcurrencyGate {
    /// Create a gate admitting `limit` calls, adjustable within `[min_limit, max_limit]`
    pub fn new(limit: usize, min_limit: usize, max_limit: usize) -> Self {
        let min_limit = min_limit.max(1);
        let max_limit = max_limit.max(min_limit);
        let limit = limit.clamp(min_limit, max_limit);
        Self {
            semaphore: Semaphore::new(limit),
            state: Mutex::new(GateState { limit, debt: 0 }),
            active: AtomicUsize::new(0),
            min_limit,
            max_limit,
            observers: Observers::default(),
        }
    }

    /// Register an observer for limit changes
    pub fn with_observer(mut self, observer: Arc<dyn GovernanceObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub(crate) fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    /// Wait for a free slot, in arrival order
    pub async fn acquire(&self) -> GovernorResult<ConcurrencyPermit<'_>> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| GovernorError::configuration("concurrency gate closed"))?;
        Ok(self.hold(permit))
    }

    /// Take a slot if one is free
    pub fn try_acquire(&self) -> Option<ConcurrencyPermit<'_>> {
        self.semaphore.try_acquire().ok().map(|permit| self.hold(permit))
    }

    fn hold<'a>(&'a self, permit: SemaphorePermit<'a>) -> ConcurrencyPermit<'a> {
        self.active.fetch_add(1, Ordering::Relaxed);
        ConcurrencyPermit {
            gate: self,
            permit: Some(permit),
        }
    }

    /// Change the ceiling, clamped to the configured bounds; returns the effective value
    pub fn set_limit(&self, limit: usize) -> usize {
        let effective = limit.clamp(self.min_limit, self.max_limit);
        let previous = {
            let mut state = self.state.lock();
            let previous = std::mem::replace(&mut state.limit, effective);

            if effective > previous {
                let raise = effective - previous;
                let cancelled = raise.min(state.debt);
                state.debt -= cancelled;
                self.semaphore.add_permits(raise - cancelled);
            } else {
                let mut shrink = previous - effective;
                while shrink > 0 {
                    match self.semaphore.try_acquire() {
                        Ok(permit) => {
                            permit.forget();
                            shrink -= 1;
                        }
                        Err(_) => break,
                    }
                }
                state.debt += shrink;
            }
            previous
        };

        if effective != previous {
            debug!(previous, limit = effective, "Concurrency limit changed");
            self.observers
                .notify(|o| o.on_concurrency_limit_changed(effective));
        }
        effective
    }

    /// Current ceiling
    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }

    /// Slots currently held
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Slots free right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Bounds accepted by [`set_limit`](Self::set_limit)
    pub fn bounds(&self) -> (usize, usize) {
        (self.min_limit, self.max_limit)
    }
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("state", &*self.state.lock())
            .field("active", &self.active())
            .field("available", &self.available())
            .field("min_limit", &self.min_limit)
            .field("max_limit", &self.max_limit)
            .finish()
    }
}

/// Slot held for one provider call; released on drop
#[derive(Debug)]
pub struct ConcurrencyPermit<'a> {
    gate: &'a ConcurrencyGate,
    permit: Option<SemaphorePermit<'a>>,
}

impl Drop for ConcurrencyPermit<'_> {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::Relaxed);
        let mut state = self.gate.state.lock();
        match self.permit.take() {
            Some(permit) if state.debt > 0 => {
                state.debt -= 1;
                permit.forget();
            }
            permit => drop(permit),
        }
    }
}

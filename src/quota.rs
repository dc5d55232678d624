//! Quota tracking: tier definitions, the tracker interface, and the default
//! fixed-window implementation.
//!
//! The admission engine in [`crate::limiter`] never does its own accounting.
//! It asks a [`QuotaTracker`] three things: register a tier, "is any tier
//! exhausted right now?", and "record one consumed call" — and it subscribes
//! to the tracker's replenishment channel so it knows when to drain deferred
//! calls. Swapping the tracker swaps the replenishment semantics without
//! touching the engine.

use crate::LimitError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// One quota constraint: at most `capacity` calls per `interval`.
///
/// Tiers are immutable once built; stacking several on one limiter means the
/// strictest tier governs at any moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier {
    capacity: u32,
    interval: Duration,
}

impl Tier {
    /// Validate and build a tier definition.
    pub fn new(capacity: u32, interval: Duration) -> Result<Self, LimitError> {
        if capacity == 0 {
            return Err(LimitError::ZeroCapacity);
        }
        if interval.is_zero() {
            return Err(LimitError::ZeroInterval);
        }
        Ok(Self { capacity, interval })
    }

    /// Maximum calls allowed per window.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Window duration.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Accounting interface the admission engine relies on.
///
/// Implementations own their own timing (timers, windows, refill math); the
/// engine only observes exhaustion, records consumption, and listens for
/// replenishment.
pub trait QuotaTracker: Send + Sync + 'static {
    /// Register an additional tier. Tiers accumulate; none is ever replaced.
    fn register_tier(&self, tier: Tier);

    /// True when any registered tier has no capacity left.
    ///
    /// With no tiers registered this must report `false`: a limiter without
    /// tiers admits every call immediately.
    fn is_exhausted(&self) -> bool;

    /// Record one unit of usage against every registered tier.
    fn consume(&self);

    /// Channel that changes whenever any tier regains capacity.
    fn replenished(&self) -> watch::Receiver<()>;
}

/// Default tracker with fixed-window semantics.
///
/// Each tier counts calls in a window of its own `interval`; a tokio timer
/// resets the count to zero at every window boundary and fires the
/// replenishment channel. This admits bursts of up to `capacity` right at a
/// boundary, which is the accepted trade-off of fixed windows.
#[derive(Debug, Clone)]
pub struct FixedWindowTracker {
    state: Arc<TrackerState>,
}

#[derive(Debug)]
struct TrackerState {
    tiers: Mutex<Vec<TierUsage>>,
    replenish_tx: watch::Sender<()>,
}

#[derive(Debug)]
struct TierUsage {
    capacity: u32,
    used: u32,
}

impl FixedWindowTracker {
    pub fn new() -> Self {
        let (replenish_tx, _) = watch::channel(());
        Self {
            state: Arc::new(TrackerState { tiers: Mutex::new(Vec::new()), replenish_tx }),
        }
    }
}

impl Default for FixedWindowTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerState {
    fn tiers(&self) -> MutexGuard<'_, Vec<TierUsage>> {
        // Tier bookkeeping stays consistent even if a holder panicked.
        self.tiers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl QuotaTracker for FixedWindowTracker {
    fn register_tier(&self, tier: Tier) {
        let index = {
            let mut tiers = self.state.tiers();
            tiers.push(TierUsage { capacity: tier.capacity(), used: 0 });
            tiers.len() - 1
        };
        tracing::debug!(
            capacity = tier.capacity(),
            interval_ms = tier.interval().as_millis() as u64,
            "quota tier registered"
        );
        let state = Arc::downgrade(&self.state);
        tokio::spawn(reset_windows(state, index, tier.interval()));
    }

    fn is_exhausted(&self) -> bool {
        self.state.tiers().iter().any(|tier| tier.used >= tier.capacity)
    }

    fn consume(&self) {
        for tier in self.state.tiers().iter_mut() {
            tier.used = tier.used.saturating_add(1);
        }
    }

    fn replenished(&self) -> watch::Receiver<()> {
        self.state.replenish_tx.subscribe()
    }
}

/// Timer task for one tier: reset its usage every `interval` and fire the
/// replenishment channel. Exits once the tracker has been dropped.
async fn reset_windows(state: Weak<TrackerState>, index: usize, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the first real window boundary
    // is one interval out.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else { break };
        {
            let mut tiers = state.tiers();
            if let Some(tier) = tiers.get_mut(index) {
                tier.used = 0;
            }
        }
        state.replenish_tx.send_replace(());
    }
}

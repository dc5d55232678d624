//! The admission engine: decides per call whether to execute immediately or
//! defer, and drains deferred calls in FIFO order as quota replenishes.

use crate::quota::{FixedWindowTracker, QuotaTracker, Tier};
use crate::LimitError;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A deferred call: the wrapped target and its captured arguments, boxed as
/// one ready-to-run unit of work. Owned by the queue until dequeued.
type DeferredCall = Box<dyn FnOnce() + Send>;

/// A call-rate limiter over one shared set of quota tiers.
///
/// Wrap any number of callables with [`wrap`](Self::wrap); every invocation
/// of a wrapped callable either runs immediately (quota available) or is
/// appended to a FIFO queue and run later, once quota replenishes. All
/// callables wrapped by one limiter share its queue and its tiers, so
/// throttling aggregates across them.
///
/// Guarantees: each call executes exactly once, deferred calls run in the
/// exact order they were deferred, and a directly admitted call never
/// overtakes calls already waiting in the queue.
///
/// # Example
///
/// ```
/// use spillway::RateLimiter;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), spillway::LimitError> {
/// let limiter = RateLimiter::new();
/// limiter
///     .add_tier(10, Duration::from_secs(1))?
///     .add_tier(100, Duration::from_secs(60))?;
///
/// let fetch = limiter.wrap(|page: u32| {
///     println!("fetching page {page}");
/// });
/// fetch(1); // runs now; pages beyond the quota queue up
/// # Ok(())
/// # }
/// ```
pub struct RateLimiter<T: QuotaTracker = FixedWindowTracker> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    tracker: T,
    // One lock covers the exhaustion check and the execute-or-enqueue step,
    // so two concurrent admissions cannot both observe spare capacity.
    queue: Mutex<VecDeque<DeferredCall>>,
}

impl RateLimiter<FixedWindowTracker> {
    /// Create a limiter with the default fixed-window tracker and no tiers.
    ///
    /// Until a tier is added, every wrapped call is admitted immediately.
    /// Must be called within a tokio runtime: the drain task and the
    /// tracker's window timers run on it.
    pub fn new() -> Self {
        Self::with_tracker(FixedWindowTracker::new())
    }
}

impl Default for RateLimiter<FixedWindowTracker> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QuotaTracker> std::fmt::Debug for RateLimiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("queued", &self.shared.queue().len())
            .finish()
    }
}

impl<T: QuotaTracker> Clone for RateLimiter<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: QuotaTracker> RateLimiter<T> {
    /// Create a limiter driven by a custom quota tracker.
    ///
    /// The engine subscribes to the tracker's replenishment channel here;
    /// every notification triggers a drain of the deferred-call queue. The
    /// drain task exits when the limiter or the tracker's channel is gone.
    pub fn with_tracker(tracker: T) -> Self {
        let mut replenished = tracker.replenished();
        let shared = Arc::new(Shared { tracker, queue: Mutex::new(VecDeque::new()) });
        let weak = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while replenished.changed().await.is_ok() {
                let Some(shared) = weak.upgrade() else { break };
                shared.drain();
            }
        });
        Self { shared }
    }

    /// Add a quota tier: at most `capacity` calls per `interval`.
    ///
    /// Tiers accumulate; the limiter is exhausted as soon as any one of them
    /// is, so the strictest tier governs. Tiers may be added while calls are
    /// already queued. Returns the limiter again so registrations chain.
    ///
    /// Validation errors come from the quota side (see [`Tier::new`]) and
    /// are propagated unchanged.
    pub fn add_tier(&self, capacity: u32, interval: Duration) -> Result<&Self, LimitError> {
        let tier = Tier::new(capacity, interval)?;
        self.shared.tracker.register_tier(tier);
        Ok(self)
    }

    /// Wrap `target` so every invocation runs through this limiter.
    ///
    /// The returned closure takes the same argument as `target` (use a tuple
    /// for several). When quota is available it calls `target` synchronously
    /// on the caller's thread; otherwise it captures the arguments and
    /// defers the call, returning immediately. Deferred calls produce no
    /// return value at call time, so `target` should report results through
    /// its own continuation arguments.
    ///
    /// A wrapped call must not synchronously invoke another callable wrapped
    /// by the same limiter: the admission lock is held across execution.
    pub fn wrap<A, F>(&self, target: F) -> impl Fn(A) + Clone
    where
        F: Fn(A) + Send + Sync + 'static,
        A: Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let target = Arc::new(target);
        move |args: A| {
            let target = Arc::clone(&target);
            shared.admit(Box::new(move || target(args)));
        }
    }

    /// Number of calls currently waiting for quota.
    pub fn queued(&self) -> usize {
        self.shared.queue().len()
    }
}

impl<T: QuotaTracker> Shared<T> {
    fn queue(&self) -> MutexGuard<'_, VecDeque<DeferredCall>> {
        // A wrapped call panicking poisons the lock without ever leaving the
        // queue half-mutated; keep serving.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-call admission: execute now, or defer. Exactly one of the two
    /// happens for every call.
    fn admit(&self, call: DeferredCall) {
        let mut queue = self.queue();
        if self.tracker.is_exhausted() {
            queue.push_back(call);
            tracing::debug!(depth = queue.len(), "quota exhausted, call deferred");
        } else if queue.is_empty() {
            // Execute, then record the consumption; the lock held across
            // both keeps the pair atomic to other admissions. A panic in
            // `call` propagates to the caller before anything is consumed.
            call();
            self.tracker.consume();
        } else {
            // Quota came back before the drain task got scheduled. Queue
            // behind the residents so nothing is overtaken, then drain.
            queue.push_back(call);
            self.drain_queue(&mut queue);
        }
    }

    fn drain(&self) {
        let mut queue = self.queue();
        self.drain_queue(&mut queue);
    }

    /// Pop and execute from the front while quota lasts. Runs to completion
    /// under the lock, so a drain is never interleaved with an admission.
    fn drain_queue(&self, queue: &mut VecDeque<DeferredCall>) {
        while !self.tracker.is_exhausted() {
            let Some(call) = queue.pop_front() else { break };
            // One record panicking must not strand the rest of the queue.
            let outcome = panic::catch_unwind(AssertUnwindSafe(call));
            self.tracker.consume();
            if outcome.is_err() {
                tracing::error!("deferred call panicked during drain");
            }
        }
        if !queue.is_empty() {
            tracing::debug!(remaining = queue.len(), "drain paused until next replenishment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn no_tiers_admits_every_call_immediately() {
        let limiter = RateLimiter::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let counted = limiter.wrap(move |()| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            counted(());
        }

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test]
    async fn arguments_reach_the_target_unchanged() {
        let limiter = RateLimiter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let record = limiter.wrap(move |(id, name): (u64, String)| {
            seen_clone.lock().unwrap().push((id, name));
        });

        record((7, "seven".to_string()));
        record((11, "eleven".to_string()));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![(7, "seven".to_string()), (11, "eleven".to_string())]
        );
    }

    #[tokio::test]
    async fn second_call_defers_until_replenishment() {
        let limiter = RateLimiter::new();
        limiter.add_tier(1, Duration::from_millis(40)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let counted = limiter.wrap(move |()| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        counted(());
        counted(());

        assert_eq!(counter.load(Ordering::SeqCst), 1, "second call should be deferred");
        assert_eq!(limiter.queued(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test]
    async fn invalid_tiers_are_rejected_and_chaining_works() {
        let limiter = RateLimiter::new();

        let err = limiter.add_tier(0, Duration::from_secs(1)).unwrap_err();
        assert!(err.is_capacity());

        let err = limiter.add_tier(1, Duration::ZERO).unwrap_err();
        assert!(err.is_interval());

        limiter
            .add_tier(1, Duration::from_secs(1))
            .unwrap()
            .add_tier(10, Duration::from_secs(60))
            .unwrap();
    }

    #[tokio::test]
    async fn strictest_tier_governs() {
        let limiter = RateLimiter::new();
        limiter
            .add_tier(5, Duration::from_millis(40))
            .unwrap()
            .add_tier(1, Duration::from_millis(300))
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let counted = limiter.wrap(move |()| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        counted(());
        counted(());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // The 40ms tier resets several times, but the capacity-1 tier is
        // still inside its window.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1, "slow tier still exhausted");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn immediate_panic_propagates_and_limiter_survives() {
        let limiter = RateLimiter::new();
        limiter.add_tier(10, Duration::from_secs(60)).unwrap();

        let faulty = limiter.wrap(|()| panic!("boom"));
        let result = panic::catch_unwind(AssertUnwindSafe(|| faulty(())));
        assert!(result.is_err());

        // The limiter keeps working after a payload panic.
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let counted = limiter.wrap(move |()| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        counted(());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_deferred_call_does_not_strand_the_queue() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let limiter = RateLimiter::new();
        limiter.add_tier(1, Duration::from_millis(30)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let warmup = limiter.wrap(|()| {});
        let faulty = limiter.wrap(|()| panic!("boom"));
        let counted = limiter.wrap(move |()| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        warmup(()); // consumes the only slot
        faulty(()); // deferred
        counted(()); // deferred behind the faulty call

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1, "call behind the panic still ran");
        assert_eq!(limiter.queued(), 0);
    }
}

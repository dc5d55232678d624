#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Spillway
//!
//! A generic call-rate limiter for async Rust: wrap any callable so its
//! invocations are throttled against stacked quota tiers (N calls per
//! interval), with excess calls deferred into a FIFO queue and released as
//! quota replenishes.
//!
//! ## Features
//!
//! - **Transparent wrapping**: `wrap` returns a closure with the same call
//!   shape as the original; callers don't change.
//! - **Stacked tiers**: register any number of (capacity, interval) tiers;
//!   the strictest one governs.
//! - **FIFO deferral**: excess calls queue up and run in exact arrival
//!   order, exactly once each.
//! - **Pluggable accounting**: the default [`FixedWindowTracker`] resets
//!   usage on tokio timers; any [`QuotaTracker`] implementation can replace
//!   it.
//!
//! ## Quick Start
//!
//! ```rust
//! use spillway::RateLimiter;
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), spillway::LimitError> {
//!     let limiter = RateLimiter::new();
//!     limiter.add_tier(2, Duration::from_millis(50))?;
//!
//!     let send = limiter.wrap(|msg: &'static str| {
//!         println!("{msg}");
//!     });
//!
//!     send("first");  // runs now
//!     send("second"); // runs now
//!     send("third");  // deferred until the window resets
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod limiter;
pub mod quota;

// Re-exports
pub use error::LimitError;
pub use limiter::RateLimiter;
pub use quota::{FixedWindowTracker, QuotaTracker, Tier};

//! Error types for quota tier registration

use thiserror::Error;

/// Error returned when a quota tier definition is rejected.
///
/// Validation is owned by the quota side; [`RateLimiter::add_tier`] only
/// propagates these unchanged.
///
/// [`RateLimiter::add_tier`]: crate::RateLimiter::add_tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LimitError {
    /// Tier capacity must allow at least one call per interval.
    #[error("tier capacity must be at least 1")]
    ZeroCapacity,
    /// Tier interval must be a non-zero duration.
    #[error("tier interval must be non-zero")]
    ZeroInterval,
}

impl LimitError {
    /// Check if this error is a capacity validation failure.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::ZeroCapacity)
    }

    /// Check if this error is an interval validation failure.
    pub fn is_interval(&self) -> bool {
        matches!(self, Self::ZeroInterval)
    }
}

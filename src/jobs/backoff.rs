//! # Backoff policy for rescheduling failed work.
//!
//! [`BackoffPolicy`] controls how far a failed record is pushed out before it
//! may run again. It is parameterized by:
//! - [`BackoffPolicy::kind`] linear or exponential growth;
//! - [`BackoffPolicy::initial`] the delay after the first failure.
//!
//! For `n` failures (1-based) the delay is `initial × n` (linear) or
//! `initial × 2^(n-1)` (exponential), clamped to [`MAX_BACKOFF`].
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use workvisor::{BackoffKind, BackoffPolicy};
//!
//! let backoff = BackoffPolicy::new(BackoffKind::Exponential, Duration::from_secs(10));
//!
//! assert_eq!(backoff.next_delay(1), Duration::from_secs(10));
//! assert_eq!(backoff.next_delay(2), Duration::from_secs(20));
//! assert_eq!(backoff.next_delay(3), Duration::from_secs(40));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound for any computed backoff delay (5 hours).
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60 * 60);

/// Initial delay used when the caller does not set one (30 seconds).
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(30);

/// Growth curve of the backoff delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `initial × failures`.
    Linear,
    /// `initial × 2^(failures-1)`.
    Exponential,
}

/// Retry backoff policy attached to a work description.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackoffPolicy {
    /// Growth curve.
    pub kind: BackoffKind,
    /// Delay after the first failure.
    pub initial: Duration,
}

impl Default for BackoffPolicy {
    /// Exponential, 30s initial.
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial: DEFAULT_INITIAL_BACKOFF,
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy.
    pub fn new(kind: BackoffKind, initial: Duration) -> Self {
        Self { kind, initial }
    }

    /// Returns true if this is the default policy (not written to disk).
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Computes the delay after `failures` consecutive failures.
    ///
    /// `failures == 0` yields [`Duration::ZERO`]. Overflow and non-finite
    /// intermediate values clamp to [`MAX_BACKOFF`].
    pub fn next_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let initial = self.initial.as_secs_f64();
        let unclamped = match self.kind {
            BackoffKind::Linear => initial * f64::from(failures),
            BackoffKind::Exponential => {
                let exp = (failures - 1).min(i32::MAX as u32) as i32;
                initial * 2f64.powi(exp)
            }
        };

        if !unclamped.is_finite() || unclamped < 0.0 || unclamped > MAX_BACKOFF.as_secs_f64() {
            MAX_BACKOFF
        } else {
            Duration::from_secs_f64(unclamped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_failures_has_no_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(0), Duration::ZERO);
    }

    #[test]
    fn linear_growth() {
        let policy = BackoffPolicy::new(BackoffKind::Linear, Duration::from_secs(10));
        assert_eq!(policy.next_delay(1), Duration::from_secs(10));
        assert_eq!(policy.next_delay(2), Duration::from_secs(20));
        assert_eq!(policy.next_delay(5), Duration::from_secs(50));
    }

    #[test]
    fn exponential_growth() {
        let policy = BackoffPolicy::new(BackoffKind::Exponential, Duration::from_millis(500));
        assert_eq!(policy.next_delay(1), Duration::from_millis(500));
        assert_eq!(policy.next_delay(2), Duration::from_millis(1000));
        assert_eq!(policy.next_delay(4), Duration::from_millis(4000));
    }

    #[test]
    fn clamped_to_max() {
        let policy = BackoffPolicy::new(BackoffKind::Exponential, Duration::from_secs(60));
        assert_eq!(policy.next_delay(40), MAX_BACKOFF);

        let linear = BackoffPolicy::new(BackoffKind::Linear, Duration::from_secs(3600));
        assert_eq!(linear.next_delay(6), MAX_BACKOFF);
    }

    #[test]
    fn huge_failure_count_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn default_is_recognised() {
        assert!(BackoffPolicy::default().is_default());
        assert!(!BackoffPolicy::new(BackoffKind::Linear, DEFAULT_INITIAL_BACKOFF).is_default());
    }
}

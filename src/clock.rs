//! # Time sources.
//!
//! Two time bases are used throughout the crate:
//! - **wall** time ([`Clock::wall_ms`]): milliseconds since UNIX epoch. Survives
//!   reboots, so it is what goes to disk.
//! - **elapsed** time ([`Clock::elapsed_ms`]): monotonic milliseconds since the
//!   clock's origin. Run-time windows of in-memory records are expressed in it.
//!
//! Production code injects [`SystemClock`]; tests inject [`ManualClock`] for
//! deterministic behaviour.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Shared handle to a clock.
pub type ClockRef = Arc<dyn Clock>;

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time in milliseconds since UNIX epoch.
    fn wall_ms(&self) -> u64;

    /// Monotonic milliseconds since this clock's origin.
    fn elapsed_ms(&self) -> u64;
}

/// Production clock: `SystemTime` for wall time, an `Instant` anchor for elapsed time.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose elapsed origin is "now".
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn wall_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Settable clock for tests and simulations.
///
/// Both time bases move together through [`ManualClock::advance`]; they can
/// also be set independently to simulate a reboot (elapsed resets, wall keeps going).
#[derive(Debug, Default)]
pub struct ManualClock {
    wall: AtomicU64,
    elapsed: AtomicU64,
}

impl ManualClock {
    /// Creates a clock at the given wall and elapsed instants.
    pub fn new(wall_ms: u64, elapsed_ms: u64) -> Self {
        Self {
            wall: AtomicU64::new(wall_ms),
            elapsed: AtomicU64::new(elapsed_ms),
        }
    }

    /// Advances both time bases by `ms`.
    pub fn advance(&self, ms: u64) {
        self.wall.fetch_add(ms, Ordering::SeqCst);
        self.elapsed.fetch_add(ms, Ordering::SeqCst);
    }

    /// Sets the wall time.
    pub fn set_wall(&self, ms: u64) {
        self.wall.store(ms, Ordering::SeqCst);
    }

    /// Sets the elapsed time.
    pub fn set_elapsed(&self, ms: u64) {
        self.elapsed.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn wall_ms(&self) -> u64 {
        self.wall.load(Ordering::SeqCst)
    }

    fn elapsed_ms(&self) -> u64 {
        self.elapsed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_both_bases() {
        let clock = ManualClock::new(1_000, 10);
        clock.advance(5);
        assert_eq!(clock.wall_ms(), 1_005);
        assert_eq!(clock.elapsed_ms(), 15);

        clock.set_elapsed(0);
        assert_eq!(clock.wall_ms(), 1_005);
        assert_eq!(clock.elapsed_ms(), 0);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.elapsed_ms();
        let b = clock.elapsed_ms();
        assert!(b >= a);
        assert!(clock.wall_ms() > 0);
    }
}

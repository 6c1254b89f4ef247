//! # Global runtime configuration.
//!
//! Provides [`Config`], the settings shared by every service the
//! [`Runtime`](crate::Runtime) owns.
//!
//! ## Sentinel values
//! - `bus_capacity = 0` → clamped to 1
//! - `command_capacity = 0` → clamped to 1
//! - `grace = 0s` → shutdown does not wait for components at all
//! - `callback_timeout = 0s` → clamped to 1ms

use std::path::PathBuf;
use std::time::Duration;

/// Global configuration for the workvisor runtime.
///
/// ## Field semantics
/// - `data_dir`: root of every durable file (jobs and enrollments)
/// - `grace`: maximum wait for components to stop during shutdown
/// - `bus_capacity`: event bus ring buffer size (min 1)
/// - `command_capacity`: bounded queue of each actor (min 1)
/// - `max_file_size`: read cap for persisted files
/// - `enroll_timeout`: enrollment timeout used when a request passes none
/// - `callback_timeout`: longest wait for one listener or receiver callback
///
/// ## Notes
/// All fields are public for flexibility. Prefer the helper accessors to
/// avoid sprinkling sentinel checks across the codebase.
#[derive(Clone, Debug)]
pub struct Config {
    /// Root directory of persisted state.
    pub data_dir: PathBuf,

    /// Maximum time to wait for graceful shutdown.
    ///
    /// When shutdown starts:
    /// - every actor is cancelled via `CancellationToken`
    /// - the work store performs its final write
    /// - the runtime waits up to `grace` for all of them
    /// - if that times out, `RuntimeError::GraceExceeded` is returned
    pub grace: Duration,

    /// Capacity of the event bus broadcast channel ring buffer.
    ///
    /// Slow subscribers that lag behind more than `bus_capacity` messages
    /// skip older items.
    pub bus_capacity: usize,

    /// Capacity of the sensor and listener command queues.
    ///
    /// Backend events and item dispatches that find the queue full are
    /// dropped with `SubmitError::Full`.
    pub command_capacity: usize,

    /// Largest persisted file the runtime agrees to read, in bytes.
    pub max_file_size: u64,

    /// Default enrollment timeout.
    pub enroll_timeout: Duration,

    /// Deadline of a single listener or receiver callback.
    ///
    /// A callback still pending after this long is abandoned and treated as
    /// failed: the hub reports `ListenerFailed`, the sensor prunes the session.
    pub callback_timeout: Duration,
}

impl Config {
    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Returns an actor queue capacity clamped to a minimum of 1.
    #[inline]
    pub fn command_capacity_clamped(&self) -> usize {
        self.command_capacity.max(1)
    }

    /// Returns the callback deadline clamped to a minimum of 1ms.
    #[inline]
    pub fn callback_timeout_clamped(&self) -> Duration {
        self.callback_timeout.max(Duration::from_millis(1))
    }

    /// Path of the persisted job file.
    pub fn jobs_file(&self) -> PathBuf {
        self.data_dir.join("system").join("job").join("jobs.json")
    }

    /// Path of the persisted enrollment records.
    pub fn enrollments_file(&self) -> PathBuf {
        self.data_dir
            .join("system")
            .join("sensor")
            .join("enrollments.json")
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `data_dir = ./data`
    /// - `grace = 60s`
    /// - `bus_capacity = 1024`
    /// - `command_capacity = 256`
    /// - `max_file_size = 16 MiB`
    /// - `enroll_timeout = 60s`
    /// - `callback_timeout = 5s`
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            grace: Duration::from_secs(60),
            bus_capacity: 1024,
            command_capacity: 256,
            max_file_size: 16 * 1024 * 1024,
            enroll_timeout: Duration::from_secs(60),
            callback_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_live_under_data_dir() {
        let cfg = Config {
            data_dir: PathBuf::from("/var/lib/wv"),
            ..Config::default()
        };
        assert_eq!(cfg.jobs_file(), PathBuf::from("/var/lib/wv/system/job/jobs.json"));
        assert_eq!(
            cfg.enrollments_file(),
            PathBuf::from("/var/lib/wv/system/sensor/enrollments.json")
        );
    }

    #[test]
    fn zero_capacities_are_clamped() {
        let cfg = Config {
            bus_capacity: 0,
            command_capacity: 0,
            callback_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert_eq!(cfg.bus_capacity_clamped(), 1);
        assert_eq!(cfg.command_capacity_clamped(), 1);
        assert_eq!(cfg.callback_timeout_clamped(), Duration::from_millis(1));
    }
}

//! # Work descriptions and scheduled records.
//!
//! [`WorkSpec`] is the immutable description a caller submits. [`WorkRecord`]
//! binds a spec to the uid that owns it and to concrete run-time bounds on
//! the elapsed (monotonic, boot-relative) clock.
//!
//! ```text
//!   WorkSpec::builder(id, component)
//!        │  .min_latency / .override_deadline / .periodic / ...
//!        ▼
//!    WorkSpec ──► WorkRecord::new(spec, uid, now)
//!                    earliest_run_ms / latest_run_ms
//! ```
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use workvisor::{ComponentRef, WorkRecord, WorkSpec};
//!
//! let spec = WorkSpec::builder(7, ComponentRef::new("com.example", "Sync"))
//!     .periodic(Duration::from_secs(3600))
//!     .persisted(true)
//!     .build();
//! let rec = WorkRecord::new(spec, 1_010_123, 5_000);
//!
//! assert_eq!(rec.user_id(), 10);
//! assert_eq!(rec.earliest_run_ms(), Some(5_000));
//! assert_eq!(rec.latest_run_ms(), Some(5_000 + 3_600_000));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SpecError;
use crate::jobs::backoff::BackoffPolicy;
use crate::jobs::extras::Extras;

/// Number of uids reserved per user.
pub const PER_USER_RANGE: u32 = 100_000;

/// Component that executes the work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentRef {
    pub package: String,
    pub class: String,
}

impl ComponentRef {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }
}

/// Network requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    None,
    Any,
    Unmetered,
}

/// Device-state requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Constraints {
    pub requires_charging: bool,
    pub requires_idle: bool,
    pub network: NetworkType,
}

/// When the work may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timing {
    /// Runs once, optionally after a delay and/or before a deadline.
    OneShot {
        min_latency: Option<Duration>,
        deadline: Option<Duration>,
    },
    /// Runs once per interval.
    Periodic { interval: Duration },
}

impl Timing {
    pub fn is_periodic(&self) -> bool {
        matches!(self, Timing::Periodic { .. })
    }
}

/// Immutable description of a unit of deferrable work.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkSpec {
    id: i32,
    component: ComponentRef,
    constraints: Constraints,
    timing: Timing,
    backoff: BackoffPolicy,
    extras: Extras,
    persisted: bool,
}

impl WorkSpec {
    /// Starts a builder for work `id` executed by `component`.
    pub fn builder(id: i32, component: ComponentRef) -> WorkSpecBuilder {
        WorkSpecBuilder {
            id,
            component,
            constraints: Constraints::default(),
            min_latency: None,
            deadline: None,
            interval: None,
            backoff: BackoffPolicy::default(),
            extras: Extras::new(),
            persisted: false,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn component(&self) -> &ComponentRef {
        &self.component
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn extras(&self) -> &Extras {
        &self.extras
    }

    /// Whether the record survives restarts.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }
}

/// Builder for [`WorkSpec`].
#[derive(Debug, Clone)]
pub struct WorkSpecBuilder {
    id: i32,
    component: ComponentRef,
    constraints: Constraints,
    min_latency: Option<Duration>,
    deadline: Option<Duration>,
    interval: Option<Duration>,
    backoff: BackoffPolicy,
    extras: Extras,
    persisted: bool,
}

impl WorkSpecBuilder {
    pub fn requires_charging(mut self, on: bool) -> Self {
        self.constraints.requires_charging = on;
        self
    }

    pub fn requires_idle(mut self, on: bool) -> Self {
        self.constraints.requires_idle = on;
        self
    }

    pub fn network(mut self, network: NetworkType) -> Self {
        self.constraints.network = network;
        self
    }

    /// Earliest start, relative to scheduling time.
    pub fn min_latency(mut self, d: Duration) -> Self {
        self.min_latency = Some(d);
        self
    }

    /// Deadline after which the work runs regardless of constraints.
    pub fn override_deadline(mut self, d: Duration) -> Self {
        self.deadline = Some(d);
        self
    }

    /// Makes the work periodic with the given interval.
    pub fn periodic(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn extras(mut self, extras: Extras) -> Self {
        self.extras = extras;
        self
    }

    pub fn persisted(mut self, on: bool) -> Self {
        self.persisted = on;
        self
    }

    /// Validates and builds the spec.
    pub fn try_build(self) -> Result<WorkSpec, SpecError> {
        if self.backoff.initial.is_zero() {
            return Err(SpecError::ZeroBackoff);
        }
        let timing = match self.interval {
            Some(interval) => {
                if interval.is_zero() {
                    return Err(SpecError::ZeroInterval);
                }
                if self.min_latency.is_some() {
                    return Err(SpecError::PeriodicWithLatency);
                }
                if self.deadline.is_some() {
                    return Err(SpecError::PeriodicWithDeadline);
                }
                Timing::Periodic { interval }
            }
            None => Timing::OneShot {
                min_latency: self.min_latency,
                deadline: self.deadline,
            },
        };

        Ok(WorkSpec {
            id: self.id,
            component: self.component,
            constraints: self.constraints,
            timing,
            backoff: self.backoff,
            extras: self.extras,
            persisted: self.persisted,
        })
    }

    /// Builds the spec.
    ///
    /// # Panics
    /// On a combination that can never be scheduled (see [`SpecError`]).
    pub fn build(self) -> WorkSpec {
        match self.try_build() {
            Ok(spec) => spec,
            Err(e) => panic!("invalid work spec: {e}"),
        }
    }
}

/// Store identity of a record: the job id within its owning uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub uid: u32,
    pub job_id: i32,
}

/// A [`WorkSpec`] scheduled for a uid, with run-time bounds on the elapsed clock.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkRecord {
    spec: WorkSpec,
    uid: u32,
    earliest_run_ms: Option<u64>,
    latest_run_ms: Option<u64>,
    num_failures: u32,
}

fn add_ms(now: u64, d: Duration) -> u64 {
    now.saturating_add(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl WorkRecord {
    /// Schedules `spec` for `uid` relative to `now_elapsed`.
    pub fn new(spec: WorkSpec, uid: u32, now_elapsed: u64) -> Self {
        let (earliest, latest) = match spec.timing {
            Timing::OneShot {
                min_latency,
                deadline,
            } => (
                min_latency.map(|d| add_ms(now_elapsed, d)),
                deadline.map(|d| add_ms(now_elapsed, d)),
            ),
            Timing::Periodic { interval } => {
                (Some(now_elapsed), Some(add_ms(now_elapsed, interval)))
            }
        };
        Self::with_run_times(spec, uid, earliest, latest)
    }

    /// Builds a record with explicit run-time bounds.
    pub fn with_run_times(
        spec: WorkSpec,
        uid: u32,
        earliest_run_ms: Option<u64>,
        latest_run_ms: Option<u64>,
    ) -> Self {
        Self {
            spec,
            uid,
            earliest_run_ms,
            latest_run_ms,
            num_failures: 0,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            uid: self.uid,
            job_id: self.spec.id,
        }
    }

    pub fn spec(&self) -> &WorkSpec {
        &self.spec
    }

    pub fn job_id(&self) -> i32 {
        self.spec.id
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// User that owns the uid.
    pub fn user_id(&self) -> u32 {
        self.uid / PER_USER_RANGE
    }

    pub fn earliest_run_ms(&self) -> Option<u64> {
        self.earliest_run_ms
    }

    pub fn latest_run_ms(&self) -> Option<u64> {
        self.latest_run_ms
    }

    pub fn num_failures(&self) -> u32 {
        self.num_failures
    }

    pub fn is_persisted(&self) -> bool {
        self.spec.persisted
    }

    pub fn is_periodic(&self) -> bool {
        self.spec.timing.is_periodic()
    }

    /// Earliest bound reached (or none set).
    pub fn is_ready(&self, now_elapsed: u64) -> bool {
        self.earliest_run_ms.is_none_or(|e| now_elapsed >= e)
    }

    /// Deadline passed.
    pub fn is_overdue(&self, now_elapsed: u64) -> bool {
        self.latest_run_ms.is_some_and(|l| now_elapsed >= l)
    }

    /// Record rescheduled after a failed run: pushed out by the backoff
    /// delay, failure count incremented, deadline dropped.
    pub fn for_failure(&self, now_elapsed: u64) -> Self {
        let failures = self.num_failures.saturating_add(1);
        let delay = self.spec.backoff.next_delay(failures);
        Self {
            spec: self.spec.clone(),
            uid: self.uid,
            earliest_run_ms: Some(add_ms(now_elapsed, delay)),
            latest_run_ms: None,
            num_failures: failures,
        }
    }

    /// Next window of a periodic record; one-shot records are returned as is.
    pub fn for_next_period(&self, now_elapsed: u64) -> Self {
        let Timing::Periodic { interval } = self.spec.timing else {
            return self.clone();
        };
        let start = self
            .latest_run_ms
            .map_or(now_elapsed, |l| l.max(now_elapsed));
        Self {
            spec: self.spec.clone(),
            uid: self.uid,
            earliest_run_ms: Some(start),
            latest_run_ms: Some(add_ms(start, interval)),
            num_failures: 0,
        }
    }
}

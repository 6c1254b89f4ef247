//! # Runtime events emitted by the stores, registry, dispatcher and hub.
//!
//! The [`EventKind`] enum classifies event types across five groups:
//! - **Subscriber events**: observability plumbing itself (panic, overflow)
//! - **Shutdown events**: runtime teardown progress
//! - **Job events**: work store mutations, persistence and reload
//! - **Session events**: registry lifecycle (register, unregister, death, prune)
//! - **Sensor / listener events**: dispatcher state and fan-out failures
//!
//! The [`Event`] struct carries optional metadata (job id, uid, token, state, reason).
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use workvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::JobSkipped)
//!     .with_job(42, 10_001)
//!     .with_reason("missing package");
//!
//! assert_eq!(ev.kind, EventKind::JobSkipped);
//! assert_eq!(ev.job_id, Some(42));
//! assert_eq!(ev.reason.as_deref(), Some("missing package"));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::sensor::SensorState;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `subject`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `subject`: subscriber name
    /// - `reason`: "full" or "closed"
    SubscriberOverflow,

    // === Shutdown events ===
    /// Shutdown requested (explicit call or OS signal).
    ShutdownRequested,

    /// All components stopped within the configured grace period.
    AllStoppedWithin,

    /// Grace period exceeded; some components did not stop in time.
    ///
    /// Sets:
    /// - `reason`: names of stuck components
    GraceExceeded,

    // === Job events ===
    /// Record inserted (or replaced) in the work store.
    ///
    /// Sets:
    /// - `job_id`, `uid`
    JobAdded,

    /// Record removed from the work store.
    ///
    /// Sets:
    /// - `job_id`, `uid`
    JobRemoved,

    /// Persisted records written to disk.
    ///
    /// Sets:
    /// - `count`: number of records written
    JobsPersisted,

    /// Durable write failed; memory stays authoritative until the next write.
    ///
    /// Sets:
    /// - `reason`: error message
    PersistFailed,

    /// Records reloaded from disk.
    ///
    /// Sets:
    /// - `count`: number of records loaded
    JobsLoaded,

    /// A persisted record was malformed and skipped during reload.
    ///
    /// Sets:
    /// - `job_id`, `uid` when they could be read
    /// - `reason`: why the record was skipped
    JobSkipped,

    /// A periodic record's reloaded window was clamped.
    ///
    /// Sets:
    /// - `job_id`, `uid`
    /// - `reason`: original and clamped windows
    JobClamped,

    // === Session events ===
    /// Token registered.
    ///
    /// Sets:
    /// - `token`, `owner`
    SessionRegistered,

    /// Token unregistered by its owner.
    ///
    /// Sets:
    /// - `token`, `owner`
    SessionUnregistered,

    /// Owning process died; session removed.
    ///
    /// Sets:
    /// - `token`, `owner`
    SessionDied,

    /// Session removed after a failed delivery.
    ///
    /// Sets:
    /// - `token`, `owner`
    /// - `reason`: delivery failure
    SessionPruned,

    // === Sensor events ===
    /// Dispatcher state changed.
    ///
    /// Sets:
    /// - `state`: new state
    SensorStateChanged,

    /// Client request rejected (busy, unregistered, wrong owner, backend refusal).
    ///
    /// Sets:
    /// - `token`, `owner`
    /// - `reason`: error label
    RequestRejected,

    // === Listener events ===
    /// Listener registered with the hub.
    ///
    /// Sets:
    /// - `listener`: handle id
    ListenerAdded,

    /// Listener removed from the hub.
    ///
    /// Sets:
    /// - `listener`: handle id
    ListenerRemoved,

    /// Listener callback failed or panicked; delivery continued with others.
    ///
    /// Sets:
    /// - `listener`: handle id
    /// - `reason`: failure message
    ListenerFailed,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Caller-chosen job id.
    pub job_id: Option<i32>,
    /// Uid owning the job.
    pub uid: Option<u32>,
    /// Session token id.
    pub token: Option<u64>,
    /// User owning the session.
    pub owner: Option<u32>,
    /// Listener handle id.
    pub listener: Option<u64>,
    /// Dispatcher state (for `SensorStateChanged`).
    pub state: Option<SensorState>,
    /// Item count (records loaded/written).
    pub count: Option<u32>,
    /// Named subject (subscriber name).
    pub subject: Option<Arc<str>>,
    /// Human-readable reason (errors, overflow details, etc.).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            job_id: None,
            uid: None,
            token: None,
            owner: None,
            listener: None,
            state: None,
            count: None,
            subject: None,
            reason: None,
        }
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a named subject.
    #[inline]
    pub fn with_subject(mut self, subject: impl Into<Arc<str>>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Attaches a job identity.
    #[inline]
    pub fn with_job(mut self, job_id: i32, uid: u32) -> Self {
        self.job_id = Some(job_id);
        self.uid = Some(uid);
        self
    }

    /// Attaches a session token id and its owner.
    #[inline]
    pub fn with_session(mut self, token: u64, owner: u32) -> Self {
        self.token = Some(token);
        self.owner = Some(owner);
        self
    }

    /// Attaches a listener handle id.
    #[inline]
    pub fn with_listener(mut self, id: u64) -> Self {
        self.listener = Some(id);
        self
    }

    /// Attaches a dispatcher state.
    #[inline]
    pub fn with_state(mut self, state: SensorState) -> Self {
        self.state = Some(state);
        self
    }

    /// Attaches an item count (saturating at `u32::MAX`).
    #[inline]
    pub fn with_count(mut self, n: usize) -> Self {
        self.count = Some(u32::try_from(n).unwrap_or(u32::MAX));
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_subject(subscriber)
            .with_reason(reason)
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_subject(subscriber)
            .with_reason(info)
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }

    #[inline]
    pub fn is_subscriber_panic(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberPanicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotonic() {
        let a = Event::new(EventKind::JobAdded);
        let b = Event::new(EventKind::JobAdded);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn count_saturates() {
        let ev = Event::new(EventKind::JobsLoaded).with_count(usize::MAX);
        assert_eq!(ev.count, Some(u32::MAX));
    }
}

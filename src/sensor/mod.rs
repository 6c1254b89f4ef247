//! # Exclusive sensor dispatcher.
//!
//! One hardware sensor, many clients. [`SensorService`] serializes every
//! request and every backend notification through a single actor, enforces
//! that only one enroll/authenticate operation runs at a time, and broadcasts
//! backend results to all registered sessions.
//!
//! - [`SensorState`]: idle / enrolling / authenticating.
//! - [`SensorBackend`], [`Permissions`]: collaborators supplied by the host.
//! - [`SensorReceiver`]: per-session callback interface.
//! - [`EnrollmentStore`]: durable user ↔ template records.

mod backend;
mod enrollments;
mod receiver;
mod service;
mod state;

pub use backend::{AllowAll, Capability, Permissions, SensorBackend};
pub use enrollments::{Enrollment, EnrollmentStore, FileEnrollmentStore, MemoryEnrollmentStore};
pub use receiver::SensorReceiver;
pub use service::{BackendEvents, SensorHandle, SensorParams, SensorService};
pub use state::SensorState;

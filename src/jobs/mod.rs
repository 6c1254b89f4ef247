//! # Deferrable work: descriptions, records and the durable store.
//!
//! - [`WorkSpec`] / [`WorkSpecBuilder`]: what to run and under which constraints.
//! - [`WorkRecord`]: a spec bound to a uid with run-time bounds on the elapsed clock.
//! - [`WorkStore`]: the authoritative set of records, mirrored to disk.
//! - [`BackoffPolicy`] / [`Extras`]: retry curve and typed payload of a spec.

mod backoff;
mod codec;
mod extras;
mod record;
mod store;

pub use backoff::{BackoffKind, BackoffPolicy, DEFAULT_INITIAL_BACKOFF, MAX_BACKOFF};
pub use extras::{ExtraValue, Extras};
pub use record::{
    ComponentRef, Constraints, JobKey, NetworkType, PER_USER_RANGE, Timing, WorkRecord, WorkSpec,
    WorkSpecBuilder,
};
pub use store::WorkStore;

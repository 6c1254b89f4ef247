//! # Collaborators of the sensor dispatcher.
//!
//! - [`SensorBackend`]: the exclusive hardware resource. Calls are quick,
//!   synchronous and return a status code (`0` = accepted); outcomes arrive
//!   later through `BackendEvents`.
//! - [`Permissions`]: consulted before any session or sensor mutation.

use crate::sessions::UserId;

/// Exclusive hardware resource driven by the dispatcher.
///
/// Every method is called from the dispatcher's actor task only, so
/// implementations never see concurrent calls from it.
pub trait SensorBackend: Send + Sync + 'static {
    /// Starts enrolling a new template for `owner`.
    fn enroll(&self, owner: UserId, timeout_secs: u32) -> i32;

    /// Starts an authentication attempt.
    fn authenticate(&self) -> i32;

    /// Asks the backend to abort the current operation.
    ///
    /// Advisory: the backend confirms with an error event.
    fn cancel(&self) -> i32;

    /// Removes template `id` of `owner`.
    fn remove(&self, owner: UserId, id: i32) -> i32;

    /// Template ids the hardware holds for `owner`.
    fn enrollments(&self, owner: UserId) -> Vec<i32>;

    /// Number of samples one enrollment takes.
    fn enrollment_steps(&self) -> u32;
}

/// Capability a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Register listeners, authenticate, cancel, list enrollments.
    Use,
    /// Enroll, remove and rename templates.
    Manage,
}

/// Permission-check collaborator.
pub trait Permissions: Send + Sync + 'static {
    fn allows(&self, owner: UserId, capability: Capability) -> bool;
}

/// Grants every capability to every user.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Permissions for AllowAll {
    fn allows(&self, _owner: UserId, _capability: Capability) -> bool {
        true
    }
}

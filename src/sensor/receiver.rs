use async_trait::async_trait;

use crate::error::ListenerError;

/// Remote listener registered with the sensor dispatcher.
///
/// Every callback is delivered to every registered session. Returning `Err`
/// (or panicking) marks the session broken; the dispatcher prunes it and
/// keeps delivering to the others.
#[async_trait]
pub trait SensorReceiver: Send + Sync + 'static {
    /// Backend error; the sensor is idle again.
    async fn on_error(&self, code: i32) -> Result<(), ListenerError>;

    /// A sample was captured during authentication.
    async fn on_acquired(&self, info: i32) -> Result<(), ListenerError>;

    /// Authentication finished; `id` is the matched template (0 = no match).
    async fn on_processed(&self, id: i32) -> Result<(), ListenerError>;

    /// One enrollment step done; `remaining == 0` completes the enrollment.
    async fn on_enroll_result(&self, id: i32, remaining: u32) -> Result<(), ListenerError>;

    /// Template `id` was removed.
    async fn on_removed(&self, id: i32) -> Result<(), ListenerError>;
}

use async_trait::async_trait;

use crate::error::ListenerError;

/// Remote listener served by a [`ListenerHub`](crate::ListenerHub).
///
/// An `Err` or a panic from any callback is logged and reported as
/// `ListenerFailed`; the listener stays registered and the other listeners
/// still receive the item.
#[async_trait]
pub trait ItemListener<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    /// Called once, right after this listener was registered.
    async fn on_connected(&self) -> Result<(), ListenerError>;

    async fn on_item_posted(&self, item: &T) -> Result<(), ListenerError>;

    async fn on_item_removed(&self, item: &T) -> Result<(), ListenerError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str {
        "listener"
    }
}

//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to runtime events emitted by the work store, session
//! registry, sensor dispatcher, listener hub and subscriber workers.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `WorkStore` and its writer, `TokenRegistry` (and its death
//!   watches), `SensorService`, `ListenerHub`, `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: the runtime's subscriber listener, which fans out to `SubscriberSet`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};

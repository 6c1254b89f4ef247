//! # Event subscribers for the workvisor runtime.
//!
//! This module provides the [`Subscribe`] trait and the [`SubscriberSet`]
//! fan-out that feeds runtime events from the [`Bus`](crate::events::Bus)
//! to user observability code (metrics, audit, alerting).
//!
//! ## Architecture
//! ```text
//! WorkStore / TokenRegistry / SensorService / ListenerHub
//!        │ publish(Event)
//!        ▼
//!       Bus ──► subscriber_listener (Runtime) ──► SubscriberSet::emit
//!                                                   ├──► [queue] ──► metrics.on_event()
//!                                                   └──► [queue] ──► audit.on_event()
//! ```
//!
//! These are observers of the runtime, not the domain listeners served by
//! [`ListenerHub`](crate::ListenerHub) or [`SensorService`](crate::SensorService).

mod subscriber;
mod subscriber_set;

pub use subscriber::Subscribe;
pub use subscriber_set::SubscriberSet;

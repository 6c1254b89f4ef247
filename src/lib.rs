//! # workvisor
//!
//! **Workvisor** hosts three system services that share one runtime, one
//! event bus and one shutdown path:
//!
//! - a durable **work store** that keeps deferrable jobs across restarts and
//!   clamps run windows that drifted out of bounds while the process was down;
//! - a single-owner **sensor dispatcher** that arbitrates one exclusive
//!   hardware resource between many clients, with per-client sessions that
//!   clean themselves up when the client dies;
//! - a **listener hub** that fans posted/removed items out to remote
//!   listeners, isolating each listener's failures.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!  clients                      backend                       producers
//!     │ SensorHandle               │ BackendEvents               │ dispatch_*
//!     ▼                            ▼                             ▼
//! ┌───────────────────────────────────────┐   ┌───────────────────────────┐
//! │ SensorService (actor)                 │   │ ListenerHub<T> (actor)    │
//! │  - state: Idle/Enrolling/Auth         │   │  - listeners in order     │
//! │  - TokenRegistry (death watches)      │   │  - guarded callbacks      │
//! │  - EnrollmentStore                    │   └─────────────┬─────────────┘
//! └──────────────────┬────────────────────┘                 │
//!                    │       ┌────────────────────────┐     │
//!                    │       │ WorkStore              │     │
//!                    │       │  - records by key      │     │
//!                    │       │  - background writer   │     │
//!                    │       └───────────┬────────────┘     │
//!                    │ publish(Event)    │                  │
//!                    ▼                   ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Bus (broadcast channel)                    │
//! │                    (capacity: Config::bus_capacity)               │
//! └─────────────────────────────────┬─────────────────────────────────┘
//!                                   ▼
//!                       ┌────────────────────────┐
//!                       │  subscriber listener   │
//!                       │     (in Runtime)       │
//!                       └───────────┬────────────┘
//!                                   ▼
//!                             SubscriberSet
//!                                  ┌─────────┼─────────┐
//!                                  ▼         ▼         ▼
//!                               worker1   worker2   workerN
//! ```
//!
//! ### Persistence
//! ```text
//! add/remove ──► in-memory map ──► mark dirty ──► writer task
//!                                                   ├─ snapshot persisted records
//!                                                   ├─ elapsed → wall conversion
//!                                                   └─ atomic temp-file + rename
//! open ──► bounded read ──► per-record decode (skip bad ones)
//!                             └─ wall → elapsed, clamp periodic windows
//! ```
//!
//! ## Features
//! | Area              | Description                                              | Key types / traits                         |
//! |-------------------|----------------------------------------------------------|--------------------------------------------|
//! | **Jobs**          | Describe, record and persist deferrable work.            | [`WorkSpec`], [`WorkRecord`], [`WorkStore`] |
//! | **Sessions**      | Token-scoped sessions with death cleanup.                | [`ClientToken`], [`TokenRegistry`]         |
//! | **Sensor**        | Exclusive resource dispatcher and its collaborators.     | [`SensorService`], [`SensorBackend`]       |
//! | **Listeners**     | Fault-isolated fan-out of items.                         | [`ListenerHub`], [`ItemListener`]          |
//! | **Subscriber API**| Hook into runtime events (logging, metrics, alerting).   | [`Subscribe`]                              |
//! | **Errors**        | Typed errors per concern.                                | [`StoreError`], [`DispatchError`], ...     |
//! | **Configuration** | Centralize runtime settings.                             | [`Config`]                                 |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use workvisor::{Config, ItemListener, ListenerError, Runtime};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl ItemListener<String> for Printer {
//!     async fn on_connected(&self) -> Result<(), ListenerError> { Ok(()) }
//!     async fn on_item_posted(&self, item: &String) -> Result<(), ListenerError> {
//!         println!("posted {item}");
//!         Ok(())
//!     }
//!     async fn on_item_removed(&self, _item: &String) -> Result<(), ListenerError> { Ok(()) }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = tempfile::tempdir()?;
//!     let cfg = Config { data_dir: dir.path().to_path_buf(), ..Config::default() };
//!     let runtime = Runtime::<String>::builder(cfg).build().await?;
//!
//!     runtime.listeners().add_listener(Arc::new(Printer)).await?;
//!     runtime.listeners().dispatch_posted("hello".to_string())?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
mod core;
pub mod error;
pub mod events;
mod guard;
pub mod jobs;
pub mod listeners;
mod persist;
pub mod sensor;
pub mod sessions;
pub mod subscribers;

// ---- Public re-exports ----

pub use clock::{Clock, ClockRef, ManualClock, SystemClock};
pub use crate::core::{Config, Runtime, RuntimeBuilder};
pub use error::{
    DispatchError, ListenerError, RegistryError, RuntimeError, SpecError, StoreError, SubmitError,
};
pub use events::{Bus, Event, EventKind};
pub use jobs::{
    BackoffKind, BackoffPolicy, ComponentRef, Constraints, ExtraValue, Extras, JobKey, NetworkType,
    Timing, WorkRecord, WorkSpec, WorkSpecBuilder, WorkStore,
};
pub use listeners::{ItemListener, ListenerHandle, ListenerHub};
pub use sensor::{
    AllowAll, BackendEvents, Capability, Enrollment, EnrollmentStore, FileEnrollmentStore,
    MemoryEnrollmentStore, Permissions, SensorBackend, SensorHandle, SensorParams, SensorReceiver,
    SensorService, SensorState,
};
pub use sessions::{ClientToken, SessionEntry, TokenId, TokenRegistry, UserId};
pub use subscribers::{Subscribe, SubscriberSet};

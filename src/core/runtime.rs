//! # Runtime: owns every service, fans out events, shuts down within grace.
//!
//! The [`Runtime`] owns the event bus, a [`SubscriberSet`], the
//! [`WorkStore`], the optional [`SensorService`] and a [`ListenerHub`].
//!
//! ## High-level architecture
//! ```text
//! RuntimeBuilder::build()
//!   ├─► Bus::new(bus_capacity)
//!   ├─► SubscriberSet::new(subscribers)
//!   ├─► WorkStore::open(jobs_file)          (reload + clamp)
//!   ├─► SensorService::spawn(backend, ..)   (if a backend was given)
//!   └─► ListenerHub::spawn(command_capacity, callback_timeout)
//!
//! Event flow:
//!   WorkStore / TokenRegistry / SensorService / ListenerHub
//!        └── publish(Event) ──► Bus ──► subscriber listener ──► SubscriberSet::emit(&Event)
//!
//! Shutdown path:
//!   shutdown()
//!     └─► Bus.publish(ShutdownRequested)
//!     └─► runtime_token.cancel()
//!     └─► stop components, waiting up to cfg.grace:
//!            ├─ all stopped     → Bus.publish(AllStoppedWithin)
//!            └─ grace exceeded  → Bus.publish(GraceExceeded) + RuntimeError::GraceExceeded
//!     └─► drain the bus into subscribers, stop subscriber workers
//! ```
//!
//! ## Example
//! ```rust
//! use workvisor::{Clock, ComponentRef, Config, Runtime, WorkRecord, WorkSpec};
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = tempfile::tempdir()?;
//!     let cfg = Config { data_dir: dir.path().to_path_buf(), ..Config::default() };
//!
//!     let runtime = Runtime::<String>::builder(cfg).build().await?;
//!
//!     let spec = WorkSpec::builder(1, ComponentRef::new("com.example", "SyncService"))
//!         .periodic(Duration::from_secs(3600))
//!         .persisted(true)
//!         .build();
//!     let now = runtime.store().clock().elapsed_ms();
//!     runtime.store().add(WorkRecord::new(spec, 10_001, now)).await;
//!     runtime.store().flush().await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{Config, RuntimeBuilder, shutdown};
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};
use crate::jobs::WorkStore;
use crate::listeners::ListenerHub;
use crate::sensor::{BackendEvents, SensorHandle, SensorService};
use crate::subscribers::SubscriberSet;

type StopFuture<'a> = Pin<Box<dyn Future<Output = &'static str> + Send + 'a>>;

/// Owns the services and drives their lifecycle.
pub struct Runtime<T: Clone + Send + Sync + 'static> {
    cfg: Config,
    bus: Bus,
    store: WorkStore,
    sensor: Option<SensorService>,
    hub: ListenerHub<T>,
    token: CancellationToken,
    subscriber_stop: CancellationToken,
    subscriber_listener: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> Runtime<T> {
    /// Starts building a runtime with the given configuration.
    pub fn builder(cfg: Config) -> RuntimeBuilder<T> {
        RuntimeBuilder::new(cfg)
    }

    pub(crate) fn new_internal(
        cfg: Config,
        bus: Bus,
        (listener, subscriber_stop): (JoinHandle<()>, CancellationToken),
        store: WorkStore,
        sensor: Option<SensorService>,
        hub: ListenerHub<T>,
    ) -> Self {
        Self {
            cfg,
            bus,
            store,
            sensor,
            hub,
            token: CancellationToken::new(),
            subscriber_stop,
            subscriber_listener: Mutex::new(Some(listener)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Event bus shared by every service.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn store(&self) -> &WorkStore {
        &self.store
    }

    /// Client handle of the sensor dispatcher, if a backend was configured.
    pub fn sensor(&self) -> Option<SensorHandle> {
        self.sensor.as_ref().map(SensorService::handle)
    }

    /// Entry points for the sensor backend, if one was configured.
    pub fn backend_events(&self) -> Option<BackendEvents> {
        self.sensor.as_ref().map(SensorService::backend_events)
    }

    pub fn listeners(&self) -> &ListenerHub<T> {
        &self.hub
    }

    /// Token cancelled when shutdown starts; host tasks may tie their
    /// lifetime to it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits for SIGINT/SIGTERM/SIGQUIT (Ctrl-C elsewhere), or for another
    /// caller to start shutdown, then shuts down.
    pub async fn run_until_signal(&self) -> Result<(), RuntimeError> {
        tokio::select! {
            res = shutdown::wait_for_shutdown_signal() => {
                if let Err(e) = res {
                    warn!(error = %e, "Failed to install signal handlers; shutting down");
                }
                info!("Shutdown signal received");
            }
            _ = self.token.cancelled() => {}
        }
        self.shutdown().await
    }

    /// Stops every component, waiting up to [`Config::grace`].
    ///
    /// Only the first call does the work; later calls return `Ok(())`.
    ///
    /// # Errors
    /// [`RuntimeError::GraceExceeded`] naming the components that did not
    /// stop in time.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let listener = self.subscriber_listener.lock().await.take();
        let Some(listener) = listener else {
            return Ok(());
        };

        self.bus.publish(Event::new(EventKind::ShutdownRequested));
        self.token.cancel();
        let res = self.stop_components().await;

        self.subscriber_stop.cancel();
        if let Err(e) = listener.await {
            warn!(error = %e, "Subscriber listener ended abnormally");
        }
        res
    }

    async fn stop_components(&self) -> Result<(), RuntimeError> {
        let grace = self.cfg.grace;
        let mut pending: FuturesUnordered<StopFuture<'_>> = FuturesUnordered::new();
        pending.push(Box::pin(async {
            self.store.shutdown().await;
            "work_store"
        }));
        pending.push(Box::pin(async {
            self.hub.shutdown().await;
            "listener_hub"
        }));
        if let Some(sensor) = &self.sensor {
            pending.push(Box::pin(async move {
                sensor.shutdown().await;
                "sensor"
            }));
        }

        let mut stuck: Vec<&'static str> = vec!["work_store", "listener_hub"];
        if self.sensor.is_some() {
            stuck.push("sensor");
        }
        let done = async {
            while let Some(name) = pending.next().await {
                debug!(component = name, "Component stopped");
                stuck.retain(|n| *n != name);
            }
        };

        let outcome = tokio::time::timeout(grace, done).await;
        match outcome {
            Ok(()) => {
                self.bus.publish(Event::new(EventKind::AllStoppedWithin));
                Ok(())
            }
            Err(_) => {
                warn!(?grace, ?stuck, "Shutdown grace exceeded");
                self.bus.publish(
                    Event::new(EventKind::GraceExceeded).with_reason(stuck.join(",")),
                );
                Err(RuntimeError::GraceExceeded { grace, stuck })
            }
        }
    }
}

/// Forwards bus events to the subscriber set until the returned token is
/// cancelled, then drains what is already queued and shuts the workers down.
pub(crate) fn subscriber_listener(bus: &Bus, set: SubscriberSet) -> (JoinHandle<()>, CancellationToken) {
    let stop = CancellationToken::new();
    let stop_rx = stop.clone();
    let mut rx = bus.subscribe();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                ev = rx.recv() => match ev {
                    Ok(ev) => set.emit(&ev),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Subscriber listener lagged behind the bus");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = stop_rx.cancelled() => {
                    while let Ok(ev) = rx.try_recv() {
                        set.emit(&ev);
                    }
                    break;
                }
            }
        }
        set.shutdown().await;
    });
    (handle, stop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ListenerError;
    use crate::jobs::{ComponentRef, WorkRecord, WorkSpec};
    use crate::listeners::ItemListener;
    use crate::sensor::{MemoryEnrollmentStore, SensorBackend, SensorState};
    use crate::sessions::ClientToken;
    use crate::subscribers::Subscribe;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct KindRecorder {
        kinds: StdMutex<Vec<EventKind>>,
    }

    #[async_trait]
    impl Subscribe for KindRecorder {
        async fn on_event(&self, event: &Event) {
            self.kinds.lock().unwrap().push(event.kind);
        }

        fn name(&self) -> &'static str {
            "kind-recorder"
        }
    }

    struct NullBackend;

    impl SensorBackend for NullBackend {
        fn enroll(&self, _owner: u32, _timeout_secs: u32) -> i32 {
            0
        }
        fn authenticate(&self) -> i32 {
            0
        }
        fn cancel(&self) -> i32 {
            0
        }
        fn remove(&self, _owner: u32, _id: i32) -> i32 {
            0
        }
        fn enrollments(&self, _owner: u32) -> Vec<i32> {
            Vec::new()
        }
        fn enrollment_steps(&self) -> u32 {
            3
        }
    }

    #[derive(Default)]
    struct Posted {
        items: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ItemListener<String> for Posted {
        async fn on_connected(&self) -> Result<(), ListenerError> {
            Ok(())
        }

        async fn on_item_posted(&self, item: &String) -> Result<(), ListenerError> {
            self.items.lock().unwrap().push(item.clone());
            Ok(())
        }

        async fn on_item_removed(&self, _item: &String) -> Result<(), ListenerError> {
            Ok(())
        }
    }

    fn config(dir: &TempDir) -> Config {
        Config {
            data_dir: dir.path().to_path_buf(),
            grace: Duration::from_secs(5),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn jobs_survive_a_restart() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000, 5_000));

        let runtime = Runtime::<String>::builder(config(&dir))
            .with_clock(clock.clone())
            .build()
            .await
            .unwrap();
        let spec = WorkSpec::builder(7, ComponentRef::new("pkg", "Svc"))
            .override_deadline(Duration::from_secs(60))
            .persisted(true)
            .build();
        runtime.store().add(WorkRecord::new(spec, 10_001, 5_000)).await;
        runtime.shutdown().await.unwrap();

        let restarted = Runtime::<String>::builder(config(&dir))
            .with_clock(clock)
            .build()
            .await
            .unwrap();
        assert!(restarted.store().contains_job_id_for_uid(7, 10_001).await);
        restarted.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn subscribers_see_the_shutdown_sequence() {
        let dir = TempDir::new().unwrap();
        let rec = Arc::new(KindRecorder::default());
        let runtime = Runtime::<String>::builder(config(&dir))
            .with_subscribers(vec![rec.clone() as Arc<dyn Subscribe>])
            .build()
            .await
            .unwrap();

        runtime.shutdown().await.unwrap();
        // Second call is a no-op.
        runtime.shutdown().await.unwrap();

        let kinds = rec.kinds.lock().unwrap().clone();
        let requested = kinds.iter().position(|k| *k == EventKind::ShutdownRequested);
        let stopped = kinds.iter().position(|k| *k == EventKind::AllStoppedWithin);
        assert!(requested.is_some());
        assert!(stopped > requested);
        assert!(runtime.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn sensor_is_wired_only_with_a_backend() {
        let dir = TempDir::new().unwrap();
        let plain = Runtime::<String>::builder(config(&dir)).build().await.unwrap();
        assert!(plain.sensor().is_none());
        assert!(plain.backend_events().is_none());
        plain.shutdown().await.unwrap();

        let runtime = Runtime::<String>::builder(config(&dir))
            .with_backend(Arc::new(NullBackend))
            .with_enrollment_store(Arc::new(MemoryEnrollmentStore::new()))
            .build()
            .await
            .unwrap();
        let sensor = runtime.sensor().unwrap();
        let token = ClientToken::new();
        struct Quiet;
        #[async_trait]
        impl crate::sensor::SensorReceiver for Quiet {
            async fn on_error(&self, _: i32) -> Result<(), ListenerError> {
                Ok(())
            }
            async fn on_acquired(&self, _: i32) -> Result<(), ListenerError> {
                Ok(())
            }
            async fn on_processed(&self, _: i32) -> Result<(), ListenerError> {
                Ok(())
            }
            async fn on_enroll_result(&self, _: i32, _: u32) -> Result<(), ListenerError> {
                Ok(())
            }
            async fn on_removed(&self, _: i32) -> Result<(), ListenerError> {
                Ok(())
            }
        }
        sensor.add_listener(&token, Arc::new(Quiet), 0).await.unwrap();
        sensor.start_authenticate(&token, 0).await.unwrap();
        assert_eq!(sensor.state(), SensorState::Authenticating);
        assert_eq!(sensor.enrollment_steps().await.unwrap(), 3);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn listener_hub_is_served() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::<String>::builder(config(&dir)).build().await.unwrap();
        let posted = Arc::new(Posted::default());
        runtime.listeners().add_listener(posted.clone()).await.unwrap();

        runtime.listeners().dispatch_posted("hello".into()).unwrap();
        runtime.listeners().len().await.unwrap();
        assert_eq!(*posted.items.lock().unwrap(), vec!["hello".to_string()]);

        runtime.shutdown().await.unwrap();
    }
}

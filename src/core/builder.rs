use std::marker::PhantomData;
use std::sync::Arc;

use crate::clock::{ClockRef, SystemClock};
use crate::core::runtime::subscriber_listener;
use crate::core::{Config, Runtime};
use crate::error::StoreError;
use crate::events::Bus;
use crate::jobs::WorkStore;
use crate::listeners::ListenerHub;
use crate::sensor::{
    AllowAll, EnrollmentStore, FileEnrollmentStore, Permissions, SensorBackend, SensorParams,
    SensorService,
};
use crate::subscribers::{Subscribe, SubscriberSet};

/// Builder for constructing a [`Runtime`] with optional services.
///
/// `T` is the item type fanned out by the runtime's [`ListenerHub`].
pub struct RuntimeBuilder<T> {
    cfg: Config,
    clock: Option<ClockRef>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    backend: Option<Arc<dyn SensorBackend>>,
    permissions: Option<Arc<dyn Permissions>>,
    enrollments: Option<Arc<dyn EnrollmentStore>>,
    _items: PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> RuntimeBuilder<T> {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            clock: None,
            subscribers: Vec::new(),
            backend: None,
            permissions: None,
            enrollments: None,
            _items: PhantomData,
        }
    }

    /// Sets the time source. Defaults to [`SystemClock`].
    pub fn with_clock(mut self, clock: ClockRef) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets event subscribers for observability.
    ///
    /// Subscribers receive runtime events (job persistence, session churn,
    /// sensor state, listener failures) through dedicated workers with
    /// bounded queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Enables the sensor dispatcher on top of `backend`.
    pub fn with_backend(mut self, backend: Arc<dyn SensorBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sets the permission check of the sensor dispatcher. Defaults to [`AllowAll`].
    pub fn with_permissions(mut self, permissions: Arc<dyn Permissions>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Sets the enrollment records of the sensor dispatcher.
    ///
    /// Defaults to a [`FileEnrollmentStore`] at [`Config::enrollments_file`].
    pub fn with_enrollment_store(mut self, store: Arc<dyn EnrollmentStore>) -> Self {
        self.enrollments = Some(store);
        self
    }

    /// Builds the runtime and loads persisted state.
    ///
    /// This initializes:
    /// - event bus and subscriber workers
    /// - work store, loaded from [`Config::jobs_file`]
    /// - sensor dispatcher (only if a backend was given)
    /// - listener hub
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// The enrollment file exists but cannot be read. A damaged job file is
    /// not an error: its readable records are loaded and the rest logged.
    pub async fn build(self) -> Result<Runtime<T>, StoreError> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let subs = SubscriberSet::new(self.subscribers, bus.clone());
        // Subscribe before loading so subscribers see the reload events.
        let listener = subscriber_listener(&bus, subs);
        let clock: ClockRef = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock::new()),
        };

        let store = WorkStore::open(
            self.cfg.jobs_file(),
            self.cfg.max_file_size,
            clock,
            bus.clone(),
        )
        .await;

        let sensor = match self.backend {
            Some(backend) => {
                let enrollments: Arc<dyn EnrollmentStore> = match self.enrollments {
                    Some(store) => store,
                    None => Arc::new(
                        FileEnrollmentStore::open(self.cfg.enrollments_file(), self.cfg.max_file_size)
                            .await?,
                    ),
                };
                let permissions: Arc<dyn Permissions> = match self.permissions {
                    Some(permissions) => permissions,
                    None => Arc::new(AllowAll),
                };
                Some(SensorService::spawn(
                    backend,
                    permissions,
                    enrollments,
                    SensorParams {
                        command_capacity: self.cfg.command_capacity_clamped(),
                        enroll_timeout: self.cfg.enroll_timeout,
                        callback_timeout: self.cfg.callback_timeout_clamped(),
                    },
                    bus.clone(),
                ))
            }
            None => None,
        };

        let hub = ListenerHub::spawn(
            self.cfg.command_capacity_clamped(),
            self.cfg.callback_timeout_clamped(),
            bus.clone(),
        );

        Ok(Runtime::new_internal(self.cfg, bus, listener, store, sensor, hub))
    }
}

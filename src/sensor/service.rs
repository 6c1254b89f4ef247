//! # Single-owner dispatcher for the exclusive sensor.
//!
//! [`SensorService`] runs one actor task that owns the state machine, the
//! session registry and the backend. Client requests ([`SensorHandle`]) and
//! backend notifications ([`BackendEvents`]) share one bounded queue, so they
//! are processed strictly in arrival order and never concurrently.
//!
//! ## Architecture
//! ```text
//! SensorHandle ──send().await──┐
//!                              ├──► [command queue] ──► actor
//! BackendEvents ──try_send()───┘                          │
//!                                   ┌─────────────────────┤
//!                                   ▼                     ▼
//!                        state machine + backend    broadcast to sessions
//!                                                   (registration order,
//!                                                    failed → pruned)
//! ```
//!
//! ## State machine
//! ```text
//!            start_enroll                    start_authenticate
//!   Enrolling ◄──────────── Idle ──────────────────► Authenticating
//!       │                  ▲   ▲                          │
//!       │ enroll_result(0) │   │ processed / error        │
//!       └──── or error ────┘   └──────────────────────────┘
//! ```
//! `start_cancel` is advisory: it asks the backend to stop and leaves the
//! state alone until the backend confirms with an event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{DispatchError, ListenerError, SubmitError};
use crate::events::{Bus, Event, EventKind};
use crate::guard::guarded;
use crate::sensor::backend::{Capability, Permissions, SensorBackend};
use crate::sensor::enrollments::{Enrollment, EnrollmentStore};
use crate::sensor::receiver::SensorReceiver;
use crate::sensor::state::SensorState;
use crate::sessions::{ClientToken, TokenId, TokenRegistry, UserId};

/// Tunables of the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct SensorParams {
    /// Capacity of the command queue (clamped to at least 1).
    pub command_capacity: usize,
    /// Enrollment timeout used when the caller passes none.
    pub enroll_timeout: Duration,
    /// Longest wait for one receiver callback before its session is pruned.
    pub callback_timeout: Duration,
}

impl Default for SensorParams {
    fn default() -> Self {
        Self {
            command_capacity: 256,
            enroll_timeout: Duration::from_secs(60),
            callback_timeout: Duration::from_secs(5),
        }
    }
}

/// Notification raised by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notification {
    Error(i32),
    Acquired(i32),
    Processed(i32),
    EnrollResult { id: i32, remaining: u32 },
    Removed(i32),
}

impl Notification {
    fn name(&self) -> &'static str {
        match self {
            Notification::Error(_) => "error",
            Notification::Acquired(_) => "acquired",
            Notification::Processed(_) => "processed",
            Notification::EnrollResult { .. } => "enroll_result",
            Notification::Removed(_) => "removed",
        }
    }

    async fn deliver(self, receiver: &dyn SensorReceiver) -> Result<(), ListenerError> {
        match self {
            Notification::Error(code) => receiver.on_error(code).await,
            Notification::Acquired(info) => receiver.on_acquired(info).await,
            Notification::Processed(id) => receiver.on_processed(id).await,
            Notification::EnrollResult { id, remaining } => {
                receiver.on_enroll_result(id, remaining).await
            }
            Notification::Removed(id) => receiver.on_removed(id).await,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, DispatchError>>;

enum Command {
    AddListener {
        token: ClientToken,
        receiver: Arc<dyn SensorReceiver>,
        owner: UserId,
        reply: Reply<bool>,
    },
    RemoveListener {
        token: TokenId,
        owner: UserId,
        reply: Reply<()>,
    },
    StartEnroll {
        token: TokenId,
        owner: UserId,
        timeout: Option<Duration>,
        reply: Reply<()>,
    },
    StartAuthenticate {
        token: TokenId,
        owner: UserId,
        reply: Reply<()>,
    },
    StartCancel {
        token: TokenId,
        owner: UserId,
        reply: Reply<()>,
    },
    StartRemove {
        token: TokenId,
        owner: UserId,
        id: i32,
        reply: Reply<()>,
    },
    Enrolled {
        owner: UserId,
        reply: Reply<Vec<Enrollment>>,
    },
    SetName {
        owner: UserId,
        id: i32,
        name: String,
        reply: Reply<bool>,
    },
    EnrollmentSteps {
        reply: Reply<u32>,
    },
    Backend(Notification),
}

/// Session driving the current non-idle state.
#[derive(Debug, Clone, Copy)]
struct ActiveRequest {
    owner: UserId,
}

/// Actor state; lives on the dispatcher task only.
struct Dispatcher {
    state: SensorState,
    active: Option<ActiveRequest>,
    pending_removals: HashMap<i32, UserId>,
    registry: Arc<TokenRegistry<dyn SensorReceiver>>,
    backend: Arc<dyn SensorBackend>,
    permissions: Arc<dyn Permissions>,
    enrollments: Arc<dyn EnrollmentStore>,
    enroll_timeout: Duration,
    callback_timeout: Duration,
    state_tx: watch::Sender<SensorState>,
    bus: Bus,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
            }
        }
        self.registry.clear().await;
        debug!("Sensor dispatcher stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::AddListener {
                token,
                receiver,
                owner,
                reply,
            } => {
                let res = self.add_listener(&token, receiver, owner).await;
                self.answer(reply, res, "add_listener", token.id(), owner);
            }
            Command::RemoveListener {
                token,
                owner,
                reply,
            } => {
                let res = self
                    .registry
                    .unregister(token, owner)
                    .await
                    .map_err(DispatchError::from);
                self.answer(reply, res, "remove_listener", token, owner);
            }
            Command::StartEnroll {
                token,
                owner,
                timeout,
                reply,
            } => {
                let res = self.start_enroll(token, owner, timeout).await;
                self.answer(reply, res, "start_enroll", token, owner);
            }
            Command::StartAuthenticate {
                token,
                owner,
                reply,
            } => {
                let res = self.start_authenticate(token, owner).await;
                self.answer(reply, res, "start_authenticate", token, owner);
            }
            Command::StartCancel {
                token,
                owner,
                reply,
            } => {
                let res = self.start_cancel(token, owner).await;
                self.answer(reply, res, "start_cancel", token, owner);
            }
            Command::StartRemove {
                token,
                owner,
                id,
                reply,
            } => {
                let res = self.start_remove(token, owner, id).await;
                self.answer(reply, res, "start_remove", token, owner);
            }
            Command::Enrolled { owner, reply } => {
                let res = self.enrolled(owner).await;
                let _ = reply.send(res);
            }
            Command::SetName {
                owner,
                id,
                name,
                reply,
            } => {
                let res = self.set_name(owner, id, &name).await;
                let _ = reply.send(res);
            }
            Command::EnrollmentSteps { reply } => {
                let _ = reply.send(Ok(self.backend.enrollment_steps()));
            }
            Command::Backend(n) => self.on_notification(n).await,
        }
    }

    /// Sends the reply; a rejection is logged and published first.
    fn answer<T>(
        &self,
        reply: Reply<T>,
        res: Result<T, DispatchError>,
        op: &'static str,
        token: TokenId,
        owner: UserId,
    ) {
        if let Err(e) = &res {
            warn!(op, token = token.get(), owner, error = %e, "Sensor request rejected");
            self.bus.publish(
                Event::new(EventKind::RequestRejected)
                    .with_session(token.get(), owner)
                    .with_subject(op)
                    .with_reason(e.as_label()),
            );
        }
        let _ = reply.send(res);
    }

    fn check(&self, owner: UserId, capability: Capability) -> Result<(), DispatchError> {
        if self.permissions.allows(owner, capability) {
            Ok(())
        } else {
            Err(DispatchError::PermissionDenied)
        }
    }

    /// Session must exist and belong to `owner`.
    async fn authorize(&self, token: TokenId, owner: UserId) -> Result<(), DispatchError> {
        match self.registry.lookup(token).await {
            None => Err(DispatchError::NotRegistered),
            Some(entry) if entry.owner != owner => Err(DispatchError::InvalidOwner),
            Some(_) => Ok(()),
        }
    }

    fn backend_result(code: i32) -> Result<(), DispatchError> {
        if code == 0 {
            Ok(())
        } else {
            Err(DispatchError::Backend { code })
        }
    }

    async fn add_listener(
        &self,
        token: &ClientToken,
        receiver: Arc<dyn SensorReceiver>,
        owner: UserId,
    ) -> Result<bool, DispatchError> {
        self.check(owner, Capability::Use)?;
        Ok(self.registry.register(token, receiver, owner).await)
    }

    async fn start_enroll(
        &mut self,
        token: TokenId,
        owner: UserId,
        timeout: Option<Duration>,
    ) -> Result<(), DispatchError> {
        self.check(owner, Capability::Manage)?;
        self.authorize(token, owner).await?;
        if !self.state.is_idle() {
            return Err(DispatchError::Busy);
        }
        let timeout = timeout.unwrap_or(self.enroll_timeout);
        let secs = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);
        Self::backend_result(self.backend.enroll(owner, secs))?;

        self.active = Some(ActiveRequest { owner });
        self.set_state(SensorState::Enrolling);
        Ok(())
    }

    async fn start_authenticate(&mut self, token: TokenId, owner: UserId) -> Result<(), DispatchError> {
        self.check(owner, Capability::Use)?;
        self.authorize(token, owner).await?;
        if !self.state.is_idle() {
            return Err(DispatchError::Busy);
        }
        Self::backend_result(self.backend.authenticate())?;

        self.active = Some(ActiveRequest { owner });
        self.set_state(SensorState::Authenticating);
        Ok(())
    }

    async fn start_cancel(&mut self, token: TokenId, owner: UserId) -> Result<(), DispatchError> {
        self.check(owner, Capability::Use)?;
        self.authorize(token, owner).await?;
        if self.state.is_idle() {
            return Ok(());
        }
        if self.active.is_some_and(|a| a.owner != owner) {
            return Err(DispatchError::Busy);
        }
        Self::backend_result(self.backend.cancel())
    }

    async fn start_remove(&mut self, token: TokenId, owner: UserId, id: i32) -> Result<(), DispatchError> {
        self.check(owner, Capability::Manage)?;
        self.authorize(token, owner).await?;
        Self::backend_result(self.backend.remove(owner, id))?;
        self.pending_removals.insert(id, owner);
        Ok(())
    }

    /// Reconciles stored and hardware enrollments of `owner`.
    async fn enrolled(&self, owner: UserId) -> Result<Vec<Enrollment>, DispatchError> {
        self.check(owner, Capability::Use)?;
        let hardware = self.backend.enrollments(owner);
        let stored = self.enrollments.list(owner).await;

        let (kept, stale): (Vec<Enrollment>, Vec<Enrollment>) = stored
            .into_iter()
            .partition(|e| hardware.contains(&e.id));
        if !stale.is_empty() {
            warn!(owner, stale = stale.len(), "Dropping enrollments unknown to the sensor");
            if let Err(e) = self.enrollments.replace(owner, kept.clone()).await {
                warn!(owner, error = %e, "Failed to rewrite enrollment records");
            }
        }

        for id in hardware.iter().filter(|id| !kept.iter().any(|e| e.id == **id)) {
            warn!(owner, id, "Removing orphaned sensor template");
            let code = self.backend.remove(owner, *id);
            if code != 0 {
                warn!(owner, id, code, "Sensor refused to remove orphaned template");
            }
        }
        Ok(kept)
    }

    async fn set_name(&self, owner: UserId, id: i32, name: &str) -> Result<bool, DispatchError> {
        self.check(owner, Capability::Manage)?;
        self.enrollments.set_name(owner, id, name).await.map_err(|e| {
            warn!(owner, id, error = %e, "Failed to persist enrollment name");
            DispatchError::Persist
        })
    }

    async fn on_notification(&mut self, n: Notification) {
        match n {
            Notification::Error(code) => {
                debug!(code, state = %self.state, "Sensor error");
                self.broadcast(n).await;
                self.set_state(SensorState::Idle);
            }
            Notification::Acquired(_) => {
                if self.expect_state(SensorState::Authenticating, n) {
                    self.broadcast(n).await;
                }
            }
            Notification::Processed(_) => {
                if self.expect_state(SensorState::Authenticating, n) {
                    self.broadcast(n).await;
                    self.set_state(SensorState::Idle);
                }
            }
            Notification::EnrollResult { id, remaining } => {
                if !self.expect_state(SensorState::Enrolling, n) {
                    return;
                }
                if remaining == 0 {
                    self.persist_enrollment(id).await;
                }
                self.broadcast(n).await;
                if remaining == 0 {
                    self.set_state(SensorState::Idle);
                }
            }
            Notification::Removed(0) => {
                error!("Sensor reported removal of template 0; ignoring");
            }
            Notification::Removed(id) => {
                match self.pending_removals.remove(&id) {
                    Some(owner) => {
                        if let Err(e) = self.enrollments.remove(owner, id).await {
                            warn!(owner, id, error = %e, "Failed to forget removed template");
                        }
                    }
                    None => warn!(id, "Removal confirmed without a pending request"),
                }
                self.broadcast(n).await;
            }
        }
    }

    fn expect_state(&self, expected: SensorState, n: Notification) -> bool {
        if self.state == expected {
            return true;
        }
        warn!(event = n.name(), state = %self.state, "Ignoring sensor event in wrong state");
        false
    }

    async fn persist_enrollment(&self, id: i32) {
        let Some(active) = self.active else {
            warn!(id, "Enrollment finished without an active request");
            return;
        };
        match self.enrollments.add(active.owner, id).await {
            Ok(()) => debug!(owner = active.owner, id, "Enrollment recorded"),
            Err(e) => warn!(owner = active.owner, id, error = %e, "Failed to record enrollment"),
        }
    }

    /// Delivers `n` to every session in registration order, pruning failures.
    ///
    /// A receiver that does not answer within `callback_timeout` counts as
    /// failed.
    async fn broadcast(&self, n: Notification) {
        for session in self.registry.sessions().await {
            let token = session.token.id();
            let delivery = n.deliver(session.listener.as_ref());
            if let Err(fault) = guarded(self.callback_timeout, delivery).await {
                warn!(
                    token = token.get(),
                    owner = session.owner,
                    event = n.name(),
                    error = %fault.describe(),
                    "Sensor listener failed; pruning session"
                );
                self.registry.prune(token).await;
            }
        }
    }

    fn set_state(&mut self, next: SensorState) {
        if next.is_idle() {
            self.active = None;
        }
        if self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "Sensor state changed");
        self.state = next;
        self.state_tx.send_replace(next);
        self.bus
            .publish(Event::new(EventKind::SensorStateChanged).with_state(next));
    }
}

/// Client-side handle of the dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct SensorHandle {
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<SensorState>,
}

impl SensorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::Closed)?
    }

    /// Registers `receiver` for `owner` under `token`.
    ///
    /// Returns `false` if the token was already registered (nothing changes).
    pub async fn add_listener(
        &self,
        token: &ClientToken,
        receiver: Arc<dyn SensorReceiver>,
        owner: UserId,
    ) -> Result<bool, DispatchError> {
        self.request(|reply| Command::AddListener {
            token: token.clone(),
            receiver,
            owner,
            reply,
        })
        .await
    }

    pub async fn remove_listener(&self, token: &ClientToken, owner: UserId) -> Result<(), DispatchError> {
        self.request(|reply| Command::RemoveListener {
            token: token.id(),
            owner,
            reply,
        })
        .await
    }

    /// Starts enrolling; `timeout` defaults to the configured enrollment timeout.
    pub async fn start_enroll(
        &self,
        token: &ClientToken,
        owner: UserId,
        timeout: Option<Duration>,
    ) -> Result<(), DispatchError> {
        self.request(|reply| Command::StartEnroll {
            token: token.id(),
            owner,
            timeout,
            reply,
        })
        .await
    }

    pub async fn start_authenticate(&self, token: &ClientToken, owner: UserId) -> Result<(), DispatchError> {
        self.request(|reply| Command::StartAuthenticate {
            token: token.id(),
            owner,
            reply,
        })
        .await
    }

    /// Asks the backend to abort; the state changes only when it confirms.
    pub async fn start_cancel(&self, token: &ClientToken, owner: UserId) -> Result<(), DispatchError> {
        self.request(|reply| Command::StartCancel {
            token: token.id(),
            owner,
            reply,
        })
        .await
    }

    pub async fn start_remove(&self, token: &ClientToken, owner: UserId, id: i32) -> Result<(), DispatchError> {
        self.request(|reply| Command::StartRemove {
            token: token.id(),
            owner,
            id,
            reply,
        })
        .await
    }

    /// Enrollments of `owner`, reconciled against the hardware.
    pub async fn enrolled(&self, owner: UserId) -> Result<Vec<Enrollment>, DispatchError> {
        self.request(|reply| Command::Enrolled { owner, reply }).await
    }

    /// Renames an enrollment; `Ok(false)` if `owner` has no template `id`.
    pub async fn set_name(&self, owner: UserId, id: i32, name: impl Into<String>) -> Result<bool, DispatchError> {
        let name = name.into();
        self.request(|reply| Command::SetName {
            owner,
            id,
            name,
            reply,
        })
        .await
    }

    pub async fn enrollment_steps(&self) -> Result<u32, DispatchError> {
        self.request(|reply| Command::EnrollmentSteps { reply }).await
    }

    /// Current state, as last published by the dispatcher.
    pub fn state(&self) -> SensorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SensorState> {
        self.state.clone()
    }
}

/// Backend-side entry points. Never block; callable from any thread.
#[derive(Clone)]
pub struct BackendEvents {
    tx: mpsc::Sender<Command>,
}

impl BackendEvents {
    fn submit(&self, n: Notification) -> Result<(), SubmitError> {
        self.tx.try_send(Command::Backend(n)).map_err(|e| {
            let err = SubmitError::from(e);
            warn!(event = n.name(), error = %err, "Dropping sensor event");
            err
        })
    }

    pub fn on_error(&self, code: i32) -> Result<(), SubmitError> {
        self.submit(Notification::Error(code))
    }

    pub fn on_acquired(&self, info: i32) -> Result<(), SubmitError> {
        self.submit(Notification::Acquired(info))
    }

    pub fn on_processed(&self, id: i32) -> Result<(), SubmitError> {
        self.submit(Notification::Processed(id))
    }

    pub fn on_enroll_result(&self, id: i32, remaining: u32) -> Result<(), SubmitError> {
        self.submit(Notification::EnrollResult { id, remaining })
    }

    pub fn on_removed(&self, id: i32) -> Result<(), SubmitError> {
        self.submit(Notification::Removed(id))
    }
}

/// Running dispatcher: owns the actor task.
pub struct SensorService {
    handle: SensorHandle,
    events: BackendEvents,
    registry: Arc<TokenRegistry<dyn SensorReceiver>>,
    token: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SensorService {
    /// Spawns the dispatcher actor. Must be called inside a tokio runtime.
    pub fn spawn(
        backend: Arc<dyn SensorBackend>,
        permissions: Arc<dyn Permissions>,
        enrollments: Arc<dyn EnrollmentStore>,
        params: SensorParams,
        bus: Bus,
    ) -> Self {
        let (tx, rx) = mpsc::channel(params.command_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(SensorState::Idle);
        let registry = TokenRegistry::new(bus.clone());
        let token = CancellationToken::new();

        let dispatcher = Dispatcher {
            state: SensorState::Idle,
            active: None,
            pending_removals: HashMap::new(),
            registry: Arc::clone(&registry),
            backend,
            permissions,
            enrollments,
            enroll_timeout: params.enroll_timeout,
            callback_timeout: params.callback_timeout,
            state_tx,
            bus,
        };
        let join = tokio::spawn(dispatcher.run(rx, token.clone()));

        Self {
            handle: SensorHandle {
                tx: tx.clone(),
                state: state_rx,
            },
            events: BackendEvents { tx },
            registry,
            token,
            join: Mutex::new(Some(join)),
        }
    }

    pub fn handle(&self) -> SensorHandle {
        self.handle.clone()
    }

    pub fn backend_events(&self) -> BackendEvents {
        self.events.clone()
    }

    /// Sessions currently registered.
    pub fn registry(&self) -> &Arc<TokenRegistry<dyn SensorReceiver>> {
        &self.registry
    }

    /// Stops the actor and drops every session.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let join = self.join.lock().await.take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                warn!(error = %e, "Sensor dispatcher ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::backend::AllowAll;
    use crate::sensor::enrollments::MemoryEnrollmentStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    #[derive(Default)]
    struct FakeBackend {
        calls: StdMutex<Vec<String>>,
        code: AtomicI32,
        templates: StdMutex<BTreeMap<UserId, Vec<i32>>>,
    }

    impl FakeBackend {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> i32 {
            self.calls.lock().unwrap().push(call);
            self.code.load(Ordering::SeqCst)
        }
    }

    impl SensorBackend for FakeBackend {
        fn enroll(&self, owner: UserId, timeout_secs: u32) -> i32 {
            self.record(format!("enroll({owner},{timeout_secs})"))
        }

        fn authenticate(&self) -> i32 {
            self.record("authenticate".into())
        }

        fn cancel(&self) -> i32 {
            self.record("cancel".into())
        }

        fn remove(&self, owner: UserId, id: i32) -> i32 {
            if let Some(ids) = self.templates.lock().unwrap().get_mut(&owner) {
                ids.retain(|t| *t != id);
            }
            self.record(format!("remove({owner},{id})"))
        }

        fn enrollments(&self, owner: UserId) -> Vec<i32> {
            self.templates
                .lock()
                .unwrap()
                .get(&owner)
                .cloned()
                .unwrap_or_default()
        }

        fn enrollment_steps(&self) -> u32 {
            5
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl Recorder {
        fn failing() -> Arc<Self> {
            let r = Self::default();
            r.fail.store(true, Ordering::SeqCst);
            Arc::new(r)
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }

        fn push(&self, what: String) -> Result<(), ListenerError> {
            self.seen.lock().unwrap().push(what);
            if self.fail.load(Ordering::SeqCst) {
                Err(ListenerError::Disconnected)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SensorReceiver for Recorder {
        async fn on_error(&self, code: i32) -> Result<(), ListenerError> {
            self.push(format!("error({code})"))
        }

        async fn on_acquired(&self, info: i32) -> Result<(), ListenerError> {
            self.push(format!("acquired({info})"))
        }

        async fn on_processed(&self, id: i32) -> Result<(), ListenerError> {
            self.push(format!("processed({id})"))
        }

        async fn on_enroll_result(&self, id: i32, remaining: u32) -> Result<(), ListenerError> {
            self.push(format!("enroll({id},{remaining})"))
        }

        async fn on_removed(&self, id: i32) -> Result<(), ListenerError> {
            self.push(format!("removed({id})"))
        }
    }

    struct DenyAll;

    impl Permissions for DenyAll {
        fn allows(&self, _owner: UserId, _capability: Capability) -> bool {
            false
        }
    }

    struct Fixture {
        service: SensorService,
        handle: SensorHandle,
        events: BackendEvents,
        backend: Arc<FakeBackend>,
        store: Arc<MemoryEnrollmentStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_permissions(Arc::new(AllowAll))
        }

        fn with_permissions(permissions: Arc<dyn Permissions>) -> Self {
            Self::build(permissions, SensorParams::default())
        }

        fn build(permissions: Arc<dyn Permissions>, params: SensorParams) -> Self {
            let backend = Arc::new(FakeBackend::default());
            let store = Arc::new(MemoryEnrollmentStore::new());
            let service = SensorService::spawn(
                backend.clone(),
                permissions,
                store.clone(),
                params,
                Bus::new(256),
            );
            Self {
                handle: service.handle(),
                events: service.backend_events(),
                service,
                backend,
                store,
            }
        }

        async fn session(&self, owner: UserId) -> (ClientToken, Arc<Recorder>) {
            let token = ClientToken::new();
            let rec = Arc::new(Recorder::default());
            assert!(self.handle.add_listener(&token, rec.clone(), owner).await.unwrap());
            (token, rec)
        }

        /// Round-trips the queue so that every earlier event has been handled.
        async fn settle(&self) {
            self.handle.enrollment_steps().await.unwrap();
        }
    }

    #[tokio::test]
    async fn enroll_is_rejected_while_authenticating() {
        let fx = Fixture::new();
        let (token, _rec) = fx.session(0).await;

        fx.handle.start_authenticate(&token, 0).await.unwrap();
        assert_eq!(fx.handle.state(), SensorState::Authenticating);

        let err = fx.handle.start_enroll(&token, 0, None).await.unwrap_err();
        assert_eq!(err, DispatchError::Busy);
        assert_eq!(fx.handle.state(), SensorState::Authenticating);
        assert_eq!(fx.backend.calls(), vec!["authenticate"]);
    }

    #[tokio::test]
    async fn enroll_from_idle_calls_backend_once() {
        let fx = Fixture::new();
        let (token, _rec) = fx.session(0).await;

        fx.handle
            .start_enroll(&token, 0, Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(fx.handle.state(), SensorState::Enrolling);
        assert_eq!(fx.backend.calls(), vec!["enroll(0,30)"]);
    }

    #[tokio::test]
    async fn unknown_token_and_wrong_owner_are_rejected() {
        let fx = Fixture::new();
        let stranger = ClientToken::new();
        assert_eq!(
            fx.handle.start_authenticate(&stranger, 0).await,
            Err(DispatchError::NotRegistered)
        );

        let (token, _rec) = fx.session(10).await;
        assert_eq!(
            fx.handle.start_authenticate(&token, 11).await,
            Err(DispatchError::InvalidOwner)
        );
        assert_eq!(
            fx.handle.remove_listener(&token, 11).await,
            Err(DispatchError::InvalidOwner)
        );
        assert!(fx.backend.calls().is_empty());
        assert_eq!(fx.handle.state(), SensorState::Idle);
    }

    #[tokio::test]
    async fn backend_refusal_keeps_state() {
        let fx = Fixture::new();
        let (token, _rec) = fx.session(0).await;
        fx.backend.code.store(-3, Ordering::SeqCst);

        assert_eq!(
            fx.handle.start_authenticate(&token, 0).await,
            Err(DispatchError::Backend { code: -3 })
        );
        assert_eq!(fx.handle.state(), SensorState::Idle);
    }

    #[tokio::test]
    async fn error_reaches_every_session_and_forces_idle() {
        let fx = Fixture::new();
        let (token, a) = fx.session(0).await;
        let (_other, b) = fx.session(0).await;
        fx.handle.start_authenticate(&token, 0).await.unwrap();

        fx.events.on_error(5).unwrap();
        fx.settle().await;

        assert_eq!(fx.handle.state(), SensorState::Idle);
        assert_eq!(a.seen(), vec!["error(5)"]);
        assert_eq!(b.seen(), vec!["error(5)"]);
    }

    struct Unresponsive;

    #[async_trait]
    impl SensorReceiver for Unresponsive {
        async fn on_error(&self, _code: i32) -> Result<(), ListenerError> {
            std::future::pending().await
        }

        async fn on_acquired(&self, _info: i32) -> Result<(), ListenerError> {
            std::future::pending().await
        }

        async fn on_processed(&self, _id: i32) -> Result<(), ListenerError> {
            std::future::pending().await
        }

        async fn on_enroll_result(&self, _id: i32, _remaining: u32) -> Result<(), ListenerError> {
            std::future::pending().await
        }

        async fn on_removed(&self, _id: i32) -> Result<(), ListenerError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn unresponsive_session_is_pruned_after_timeout() {
        let fx = Fixture::build(
            Arc::new(AllowAll),
            SensorParams {
                callback_timeout: Duration::from_millis(50),
                ..SensorParams::default()
            },
        );
        let hung_token = ClientToken::new();
        fx.handle
            .add_listener(&hung_token, Arc::new(Unresponsive), 0)
            .await
            .unwrap();
        let (token, healthy) = fx.session(0).await;
        fx.handle.start_authenticate(&token, 0).await.unwrap();

        fx.events.on_acquired(1).unwrap();
        fx.events.on_acquired(2).unwrap();
        tokio::time::timeout(Duration::from_secs(2), fx.settle())
            .await
            .expect("dispatcher keeps serving requests");

        assert_eq!(healthy.seen(), vec!["acquired(1)", "acquired(2)"]);
        assert_eq!(fx.service.registry().len().await, 1);
        assert!(fx.service.registry().lookup(hung_token.id()).await.is_none());
    }

    #[tokio::test]
    async fn failing_session_is_pruned_and_others_still_served() {
        let fx = Fixture::new();
        let broken = Recorder::failing();
        let broken_token = ClientToken::new();
        fx.handle
            .add_listener(&broken_token, broken.clone(), 0)
            .await
            .unwrap();
        let (token, healthy) = fx.session(0).await;
        fx.handle.start_authenticate(&token, 0).await.unwrap();

        fx.events.on_acquired(1).unwrap();
        fx.events.on_acquired(2).unwrap();
        fx.settle().await;

        assert_eq!(broken.seen(), vec!["acquired(1)"]);
        assert_eq!(healthy.seen(), vec!["acquired(1)", "acquired(2)"]);
        assert!(fx.service.registry().lookup(broken_token.id()).await.is_none());
        assert_eq!(fx.service.registry().len().await, 1);
    }

    #[tokio::test]
    async fn events_outside_their_state_are_ignored() {
        let fx = Fixture::new();
        let (_token, rec) = fx.session(0).await;

        fx.events.on_acquired(1).unwrap();
        fx.events.on_processed(1).unwrap();
        fx.events.on_enroll_result(1, 0).unwrap();
        fx.settle().await;

        assert!(rec.seen().is_empty());
        assert!(fx.store.list(0).await.is_empty());
    }

    #[tokio::test]
    async fn completed_enrollment_is_persisted_for_owner() {
        let fx = Fixture::new();
        let (token, rec) = fx.session(10).await;
        fx.handle.start_enroll(&token, 10, None).await.unwrap();

        fx.events.on_enroll_result(42, 1).unwrap();
        fx.settle().await;
        assert_eq!(fx.handle.state(), SensorState::Enrolling);
        assert!(fx.store.list(10).await.is_empty());

        fx.events.on_enroll_result(42, 0).unwrap();
        fx.settle().await;
        assert_eq!(fx.handle.state(), SensorState::Idle);
        assert_eq!(rec.seen(), vec!["enroll(42,1)", "enroll(42,0)"]);
        let ids: Vec<i32> = fx.store.list(10).await.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![42]);
    }

    #[tokio::test]
    async fn cancel_is_advisory() {
        let fx = Fixture::new();
        let (token, _rec) = fx.session(0).await;
        let (intruder, _rec2) = fx.session(7).await;

        // Idle: nothing to cancel.
        fx.handle.start_cancel(&token, 0).await.unwrap();
        assert!(fx.backend.calls().is_empty());

        fx.handle.start_authenticate(&token, 0).await.unwrap();
        assert_eq!(
            fx.handle.start_cancel(&intruder, 7).await,
            Err(DispatchError::Busy)
        );
        fx.handle.start_cancel(&token, 0).await.unwrap();
        assert_eq!(fx.handle.state(), SensorState::Authenticating);

        fx.events.on_error(5).unwrap();
        fx.settle().await;
        assert_eq!(fx.handle.state(), SensorState::Idle);
        assert_eq!(fx.backend.calls(), vec!["authenticate", "cancel"]);
    }

    #[tokio::test]
    async fn removal_updates_the_requesters_records() {
        let fx = Fixture::new();
        let (token, rec) = fx.session(10).await;
        fx.store.add(10, 3).await.unwrap();

        fx.handle.start_remove(&token, 10, 3).await.unwrap();
        fx.events.on_removed(0).unwrap();
        fx.events.on_removed(3).unwrap();
        fx.settle().await;

        assert_eq!(rec.seen(), vec!["removed(3)"]);
        assert!(fx.store.list(10).await.is_empty());
    }

    #[tokio::test]
    async fn enrolled_reconciles_both_sides() {
        let fx = Fixture::new();
        fx.backend.templates.lock().unwrap().insert(10, vec![1, 2]);
        fx.store.add(10, 2).await.unwrap();
        fx.store.add(10, 3).await.unwrap();
        fx.store.set_name(10, 2, "thumb").await.unwrap();

        let got = fx.handle.enrolled(10).await.unwrap();
        assert_eq!(
            got,
            vec![Enrollment {
                id: 2,
                name: "thumb".into()
            }]
        );
        assert_eq!(fx.store.list(10).await, got);
        assert_eq!(fx.backend.calls(), vec!["remove(10,1)"]);
    }

    #[tokio::test]
    async fn dead_client_receives_nothing_more() {
        let fx = Fixture::new();
        let (token, rec) = fx.session(0).await;
        let (driver, _) = fx.session(0).await;
        fx.handle.start_authenticate(&driver, 0).await.unwrap();

        token.mark_dead();
        let registry = Arc::clone(fx.service.registry());
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.lookup(token.id()).await.is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("dead session should be removed");

        fx.events.on_acquired(1).unwrap();
        fx.settle().await;
        assert!(rec.seen().is_empty());
    }

    #[tokio::test]
    async fn permissions_are_checked_first() {
        let fx = Fixture::with_permissions(Arc::new(DenyAll));
        let token = ClientToken::new();
        let err = fx
            .handle
            .add_listener(&token, Arc::new(Recorder::default()), 0)
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::PermissionDenied);
        assert!(fx.service.registry().is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_closes_the_handle() {
        let fx = Fixture::new();
        fx.service.shutdown().await;
        assert_eq!(fx.handle.enrollment_steps().await, Err(DispatchError::Closed));
        assert_eq!(fx.events.on_error(1), Err(SubmitError::Closed));
    }
}

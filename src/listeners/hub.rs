//! # Listener hub: fan-out of posted/removed items.
//!
//! [`ListenerHub`] owns an actor task and a bounded command queue. Producers
//! call [`ListenerHub::dispatch_posted`] / [`ListenerHub::dispatch_removed`]
//! without blocking; the actor delivers each item to every listener in
//! registration order.
//!
//! ## Architecture
//! ```text
//! add_listener / remove_listener ──send().await──┐
//!                                                ├──► [queue] ──► actor
//! dispatch_posted / dispatch_removed ──try_send──┘                  │
//!                                                                   ▼
//!                                            for listener in registration order:
//!                                              guarded(callback_timeout, callback)
//!                                                └─ Err/panic/timeout → warn + ListenerFailed
//! ```
//!
//! ## Rules
//! - The same `Arc` registered twice yields the same [`ListenerHandle`].
//! - `on_connected` goes to the newly added listener only, before any item
//!   dispatched after the registration.
//! - A failing listener is never removed by the hub.
//! - A callback that does not answer within `callback_timeout` is abandoned
//!   and reported like any other failure, so a hung listener delays the
//!   others by at most that long.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SubmitError;
use crate::events::{Bus, Event, EventKind};
use crate::guard::guarded;
use crate::listeners::ItemListener;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque registration handle returned by [`ListenerHub::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerHandle(u64);

impl ListenerHandle {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

enum Command<T: Send + Sync + 'static> {
    Add {
        listener: Arc<dyn ItemListener<T>>,
        reply: oneshot::Sender<ListenerHandle>,
    },
    Remove {
        handle: ListenerHandle,
        reply: oneshot::Sender<bool>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
    Posted(T),
    Removed(T),
}

/// Item callbacks fanned out to every listener.
#[derive(Debug, Clone, Copy)]
enum ItemCallback {
    Posted,
    Removed,
}

impl ItemCallback {
    fn as_str(self) -> &'static str {
        match self {
            ItemCallback::Posted => "on_item_posted",
            ItemCallback::Removed => "on_item_removed",
        }
    }
}

const ON_CONNECTED: &str = "on_connected";

struct Registered<T: Send + Sync + 'static> {
    handle: ListenerHandle,
    listener: Arc<dyn ItemListener<T>>,
}

struct HubActor<T: Send + Sync + 'static> {
    listeners: Vec<Registered<T>>,
    callback_timeout: Duration,
    bus: Bus,
}

impl<T: Send + Sync + 'static> HubActor<T> {
    async fn run(mut self, mut rx: mpsc::Receiver<Command<T>>, token: CancellationToken) {
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
        debug!(listeners = self.listeners.len(), "Listener hub stopped");
    }

    async fn handle(&mut self, cmd: Command<T>) {
        match cmd {
            Command::Add { listener, reply } => {
                let handle = self.add(listener).await;
                let _ = reply.send(handle);
            }
            Command::Remove { handle, reply } => {
                let _ = reply.send(self.remove(handle));
            }
            Command::Len { reply } => {
                let _ = reply.send(self.listeners.len());
            }
            Command::Posted(item) => self.fan_out(ItemCallback::Posted, &item).await,
            Command::Removed(item) => self.fan_out(ItemCallback::Removed, &item).await,
        }
    }

    async fn add(&mut self, listener: Arc<dyn ItemListener<T>>) -> ListenerHandle {
        if let Some(existing) = self
            .listeners
            .iter()
            .find(|r| Arc::ptr_eq(&r.listener, &listener))
        {
            return existing.handle;
        }

        let handle = ListenerHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        self.listeners.push(Registered {
            handle,
            listener: Arc::clone(&listener),
        });
        debug!(listener = %handle, name = listener.name(), "Listener added");
        self.bus
            .publish(Event::new(EventKind::ListenerAdded).with_listener(handle.get()));

        if let Err(fault) = guarded(self.callback_timeout, listener.on_connected()).await {
            self.report(handle, listener.name(), ON_CONNECTED, fault.describe());
        }
        handle
    }

    fn remove(&mut self, handle: ListenerHandle) -> bool {
        let Some(pos) = self.listeners.iter().position(|r| r.handle == handle) else {
            return false;
        };
        self.listeners.remove(pos);
        debug!(listener = %handle, "Listener removed");
        self.bus
            .publish(Event::new(EventKind::ListenerRemoved).with_listener(handle.get()));
        true
    }

    async fn fan_out(&self, callback: ItemCallback, item: &T) {
        for r in &self.listeners {
            let res = match callback {
                ItemCallback::Posted => {
                    guarded(self.callback_timeout, r.listener.on_item_posted(item)).await
                }
                ItemCallback::Removed => {
                    guarded(self.callback_timeout, r.listener.on_item_removed(item)).await
                }
            };
            if let Err(fault) = res {
                self.report(r.handle, r.listener.name(), callback.as_str(), fault.describe());
            }
        }
    }

    fn report(&self, handle: ListenerHandle, name: &'static str, callback: &'static str, reason: String) {
        warn!(
            listener = %handle,
            name,
            callback,
            error = %reason,
            "Listener callback failed"
        );
        self.bus.publish(
            Event::new(EventKind::ListenerFailed)
                .with_listener(handle.get())
                .with_subject(callback)
                .with_reason(reason),
        );
    }
}

/// Fan-out service for items of type `T`.
pub struct ListenerHub<T: Send + Sync + 'static> {
    tx: mpsc::Sender<Command<T>>,
    token: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> ListenerHub<T> {
    /// Spawns the hub actor. Must be called inside a tokio runtime.
    ///
    /// Each listener callback gets at most `callback_timeout` before it is
    /// abandoned and reported as failed.
    pub fn spawn(capacity: usize, callback_timeout: Duration, bus: Bus) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let token = CancellationToken::new();
        let actor = HubActor {
            listeners: Vec::new(),
            callback_timeout,
            bus,
        };
        let join = tokio::spawn(actor.run(rx, token.clone()));
        Self {
            tx,
            token,
            join: Mutex::new(Some(join)),
        }
    }

    /// Registers `listener` and sends it `on_connected`.
    ///
    /// Registering the same `Arc` again returns its existing handle and does
    /// not repeat `on_connected`.
    pub async fn add_listener(&self, listener: Arc<dyn ItemListener<T>>) -> Result<ListenerHandle, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Add { listener, reply })
            .await
            .map_err(|_| SubmitError::Closed)?;
        rx.await.map_err(|_| SubmitError::Closed)
    }

    /// Unregisters `handle`; returns whether it was registered.
    pub async fn remove_listener(&self, handle: ListenerHandle) -> Result<bool, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Remove { handle, reply })
            .await
            .map_err(|_| SubmitError::Closed)?;
        rx.await.map_err(|_| SubmitError::Closed)
    }

    /// Number of registered listeners.
    pub async fn len(&self) -> Result<usize, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Len { reply })
            .await
            .map_err(|_| SubmitError::Closed)?;
        rx.await.map_err(|_| SubmitError::Closed)
    }

    /// Queues `item` for `on_item_posted` delivery. Never blocks.
    pub fn dispatch_posted(&self, item: T) -> Result<(), SubmitError> {
        self.submit(Command::Posted(item), "posted")
    }

    /// Queues `item` for `on_item_removed` delivery. Never blocks.
    pub fn dispatch_removed(&self, item: T) -> Result<(), SubmitError> {
        self.submit(Command::Removed(item), "removed")
    }

    fn submit(&self, cmd: Command<T>, what: &'static str) -> Result<(), SubmitError> {
        self.tx.try_send(cmd).map_err(|e| {
            let err = SubmitError::from(e);
            warn!(item = what, error = %err, "Dropping listener dispatch");
            err
        })
    }

    /// Stops the actor. Queued but undelivered items are dropped.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let join = self.join.lock().await.take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                warn!(error = %e, "Listener hub ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ListenerError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<String>>,
        fail: bool,
        panic: bool,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }

        fn record(&self, what: String) -> Result<(), ListenerError> {
            self.seen.lock().unwrap().push(what);
            if self.panic {
                panic!("listener exploded");
            }
            if self.fail {
                return Err(ListenerError::Failed("rejected".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ItemListener<String> for Recorder {
        async fn on_connected(&self) -> Result<(), ListenerError> {
            self.record("connected".into())
        }

        async fn on_item_posted(&self, item: &String) -> Result<(), ListenerError> {
            self.record(format!("posted:{item}"))
        }

        async fn on_item_removed(&self, item: &String) -> Result<(), ListenerError> {
            self.record(format!("removed:{item}"))
        }
    }

    fn hub(bus: Bus) -> ListenerHub<String> {
        ListenerHub::spawn(16, Duration::from_secs(5), bus)
    }

    /// Round-trips the queue so every earlier dispatch has been delivered.
    async fn settle(hub: &ListenerHub<String>) {
        hub.len().await.unwrap();
    }

    #[tokio::test]
    async fn connected_goes_to_the_new_listener_only() {
        let hub = hub(Bus::new(64));
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        hub.add_listener(a.clone()).await.unwrap();
        hub.add_listener(b.clone()).await.unwrap();

        assert_eq!(a.seen(), vec!["connected"]);
        assert_eq!(b.seen(), vec!["connected"]);
    }

    #[tokio::test]
    async fn same_listener_is_registered_once() {
        let hub = hub(Bus::new(64));
        let a = Arc::new(Recorder::default());

        let first = hub.add_listener(a.clone()).await.unwrap();
        let second = hub.add_listener(a.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(hub.len().await.unwrap(), 1);
        assert_eq!(a.seen(), vec!["connected"]);

        hub.dispatch_posted("n1".into()).unwrap();
        settle(&hub).await;
        assert_eq!(a.seen(), vec!["connected", "posted:n1"]);
    }

    #[tokio::test]
    async fn failing_listener_does_not_block_others() {
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let hub = hub(bus);
        let broken = Arc::new(Recorder {
            panic: true,
            ..Default::default()
        });
        let rejecting = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let healthy = Arc::new(Recorder::default());

        hub.add_listener(broken.clone()).await.unwrap();
        hub.add_listener(rejecting.clone()).await.unwrap();
        hub.add_listener(healthy.clone()).await.unwrap();

        hub.dispatch_posted("n1".into()).unwrap();
        hub.dispatch_removed("n1".into()).unwrap();
        settle(&hub).await;

        assert_eq!(healthy.seen(), vec!["connected", "posted:n1", "removed:n1"]);
        assert_eq!(rejecting.seen(), vec!["connected", "posted:n1", "removed:n1"]);
        // Failing listeners stay registered.
        assert_eq!(hub.len().await.unwrap(), 3);

        let failed = tokio::time::timeout(Duration::from_secs(1), async {
            let mut n = 0;
            while n < 6 {
                if rx.recv().await.unwrap().kind == EventKind::ListenerFailed {
                    n += 1;
                }
            }
            n
        })
        .await
        .expect("failures should be reported");
        assert_eq!(failed, 6);
    }

    struct Stuck;

    #[async_trait]
    impl ItemListener<String> for Stuck {
        async fn on_connected(&self) -> Result<(), ListenerError> {
            Ok(())
        }

        async fn on_item_posted(&self, _item: &String) -> Result<(), ListenerError> {
            std::future::pending().await
        }

        async fn on_item_removed(&self, _item: &String) -> Result<(), ListenerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn hung_listener_is_abandoned_after_timeout() {
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let hub = ListenerHub::spawn(4, Duration::from_millis(50), bus);
        let healthy = Arc::new(Recorder::default());

        hub.add_listener(Arc::new(Stuck)).await.unwrap();
        hub.add_listener(healthy.clone()).await.unwrap();

        for n in 0..3 {
            hub.dispatch_posted(format!("n{n}")).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), settle(&hub))
            .await
            .expect("hub keeps serving commands");

        assert_eq!(healthy.seen(), vec!["connected", "posted:n0", "posted:n1", "posted:n2"]);
        // Still registered; a timeout is a reported failure, not a removal.
        assert_eq!(hub.len().await.unwrap(), 2);

        let mut timeouts = 0;
        while let Ok(ev) = rx.try_recv() {
            if ev.kind == EventKind::ListenerFailed {
                assert_eq!(ev.subject.as_deref(), Some("on_item_posted"));
                timeouts += 1;
            }
        }
        assert_eq!(timeouts, 3);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let hub = hub(Bus::new(64));
        let a = Arc::new(Recorder::default());
        let handle = hub.add_listener(a.clone()).await.unwrap();

        assert!(hub.remove_listener(handle).await.unwrap());
        assert!(!hub.remove_listener(handle).await.unwrap());

        hub.dispatch_posted("n1".into()).unwrap();
        settle(&hub).await;
        assert_eq!(a.seen(), vec!["connected"]);
    }

    #[tokio::test]
    async fn delivery_follows_registration_order() {
        let order = Arc::new(StdMutex::new(Vec::new()));

        struct Tagged {
            tag: &'static str,
            order: Arc<StdMutex<Vec<&'static str>>>,
        }

        #[async_trait]
        impl ItemListener<String> for Tagged {
            async fn on_connected(&self) -> Result<(), ListenerError> {
                Ok(())
            }

            async fn on_item_posted(&self, _item: &String) -> Result<(), ListenerError> {
                self.order.lock().unwrap().push(self.tag);
                Ok(())
            }

            async fn on_item_removed(&self, _item: &String) -> Result<(), ListenerError> {
                Ok(())
            }
        }

        let hub = hub(Bus::new(64));
        for tag in ["a", "b", "c"] {
            hub.add_listener(Arc::new(Tagged {
                tag,
                order: Arc::clone(&order),
            }))
            .await
            .unwrap();
        }
        hub.dispatch_posted("x".into()).unwrap();
        settle(&hub).await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn shutdown_closes_the_queue() {
        let hub = hub(Bus::new(64));
        hub.shutdown().await;
        assert_eq!(hub.dispatch_posted("late".into()), Err(SubmitError::Closed));
        assert!(hub.add_listener(Arc::new(Recorder::default())).await.is_err());
    }
}

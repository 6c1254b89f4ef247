//! # Token registry: per-client sessions with automatic death cleanup.
//!
//! Maps a [`TokenId`] to the listener and owning user registered under it.
//! Every entry carries a death watch: a small task that waits on the client
//! token's liveness and removes the entry when the client goes away.
//!
//! ## Architecture
//! ```text
//! register(token, listener, owner)
//!     ├─► sessions[token.id] = Slot { entry, watch }
//!     └─► spawn watch ──► select { disarm, token.dead() }
//!                                         │
//!                                         ▼
//!                              Weak<registry>.upgrade()
//!                                └─► remove (same registration only)
//!                                    └─► SessionDied
//! ```
//!
//! ## Rules
//! - At most one entry per token id; `register` is idempotent.
//! - The watch is disarmed before its entry leaves the map, on every path
//!   (unregister, prune, clear).
//! - The watch holds only a `Weak` reference; it never keeps the registry alive.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::events::{Bus, Event, EventKind};
use crate::sessions::UserId;
use crate::sessions::token::{ClientToken, TokenId};

/// A registered session, as returned by lookups.
#[derive(Debug)]
pub struct SessionEntry<L: ?Sized> {
    pub token: ClientToken,
    pub listener: Arc<L>,
    pub owner: UserId,
    /// Monotonic registration order.
    pub registered_seq: u64,
}

impl<L: ?Sized> Clone for SessionEntry<L> {
    fn clone(&self) -> Self {
        Self {
            token: self.token.clone(),
            listener: Arc::clone(&self.listener),
            owner: self.owner,
            registered_seq: self.registered_seq,
        }
    }
}

/// Handle to the task watching one token's liveness.
struct DeathWatch {
    disarm: CancellationToken,
    join: JoinHandle<()>,
}

struct Slot<L: ?Sized> {
    entry: SessionEntry<L>,
    watch: DeathWatch,
}

/// Registry of live client sessions.
pub struct TokenRegistry<L: ?Sized> {
    sessions: RwLock<HashMap<TokenId, Slot<L>>>,
    next_seq: AtomicU64,
    bus: Bus,
}

impl<L: ?Sized + Send + Sync + 'static> TokenRegistry<L> {
    /// Creates an empty registry.
    pub fn new(bus: Bus) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            bus,
        })
    }

    /// Registers `listener` under `token` for `owner` and arms the death watch.
    ///
    /// Returns `false` (and changes nothing) if the token is already registered.
    /// Must be called inside a tokio runtime.
    pub async fn register(self: &Arc<Self>, token: &ClientToken, listener: Arc<L>, owner: UserId) -> bool {
        let id = token.id();
        let seq = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&id) {
                return false;
            }
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let disarm = CancellationToken::new();
            let join = tokio::spawn(watch_death(
                Arc::downgrade(self),
                token.clone(),
                seq,
                disarm.clone(),
            ));
            sessions.insert(
                id,
                Slot {
                    entry: SessionEntry {
                        token: token.clone(),
                        listener,
                        owner,
                        registered_seq: seq,
                    },
                    watch: DeathWatch { disarm, join },
                },
            );
            seq
        };

        debug!(token = id.get(), owner, seq, "Session registered");
        self.bus
            .publish(Event::new(EventKind::SessionRegistered).with_session(id.get(), owner));
        true
    }

    /// Removes the session for `id` on behalf of `owner`.
    ///
    /// # Errors
    /// - [`RegistryError::NotRegistered`] if no session exists for `id`;
    /// - [`RegistryError::InvalidOwner`] if it belongs to another user (the
    ///   session stays registered).
    pub async fn unregister(&self, id: TokenId, owner: UserId) -> Result<(), RegistryError> {
        let slot = {
            let mut sessions = self.sessions.write().await;
            match sessions.entry(id) {
                Entry::Vacant(_) => {
                    return Err(RegistryError::NotRegistered { token: id.get() });
                }
                Entry::Occupied(o) if o.get().entry.owner != owner => {
                    let registered = o.get().entry.owner;
                    warn!(token = id.get(), owner = registered, caller = owner, "Unregister by wrong owner");
                    return Err(RegistryError::InvalidOwner {
                        token: id.get(),
                        owner: registered,
                        caller: owner,
                    });
                }
                Entry::Occupied(o) => {
                    o.get().watch.disarm.cancel();
                    o.remove()
                }
            }
        };
        join_watch(slot.watch).await;

        debug!(token = id.get(), owner, "Session unregistered");
        self.bus
            .publish(Event::new(EventKind::SessionUnregistered).with_session(id.get(), owner));
        Ok(())
    }

    /// Removes a session after a failed delivery, regardless of owner.
    ///
    /// Returns whether a session was removed.
    pub async fn prune(&self, id: TokenId) -> bool {
        let slot = {
            let mut sessions = self.sessions.write().await;
            let Some(slot) = sessions.get(&id) else {
                return false;
            };
            slot.watch.disarm.cancel();
            sessions.remove(&id)
        };
        let Some(slot) = slot else {
            return false;
        };
        let owner = slot.entry.owner;
        join_watch(slot.watch).await;

        debug!(token = id.get(), owner, "Session pruned after failed delivery");
        self.bus
            .publish(Event::new(EventKind::SessionPruned).with_session(id.get(), owner));
        true
    }

    pub async fn lookup(&self, id: TokenId) -> Option<SessionEntry<L>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|slot| slot.entry.clone())
    }

    /// Snapshot of all sessions in registration order.
    pub async fn sessions(&self) -> Vec<SessionEntry<L>> {
        let mut out: Vec<SessionEntry<L>> = self
            .sessions
            .read()
            .await
            .values()
            .map(|slot| slot.entry.clone())
            .collect();
        out.sort_by_key(|e| e.registered_seq);
        out
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Disarms every watch and drops every session.
    pub async fn clear(&self) {
        let slots: Vec<Slot<L>> = {
            let mut sessions = self.sessions.write().await;
            for slot in sessions.values() {
                slot.watch.disarm.cancel();
            }
            sessions.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            join_watch(slot.watch).await;
        }
    }

    /// Called by a watch when its token died.
    async fn on_death(&self, id: TokenId, seq: u64) {
        let owner = {
            let mut sessions = self.sessions.write().await;
            match sessions.entry(id) {
                // A later registration of the same token has its own watch.
                Entry::Occupied(o) if o.get().entry.registered_seq == seq => {
                    let slot = o.remove();
                    slot.watch.disarm.cancel();
                    slot.entry.owner
                }
                _ => return,
            }
        };

        debug!(token = id.get(), owner, "Client died; session removed");
        self.bus
            .publish(Event::new(EventKind::SessionDied).with_session(id.get(), owner));
    }
}

impl<L: ?Sized> Drop for TokenRegistry<L> {
    fn drop(&mut self) {
        for slot in self.sessions.get_mut().values() {
            slot.watch.disarm.cancel();
        }
    }
}

async fn watch_death<L: ?Sized + Send + Sync + 'static>(
    registry: Weak<TokenRegistry<L>>,
    token: ClientToken,
    seq: u64,
    disarm: CancellationToken,
) {
    tokio::select! {
        _ = disarm.cancelled() => return,
        _ = token.dead() => {}
    }
    if let Some(registry) = registry.upgrade() {
        registry.on_death(token.id(), seq).await;
    }
}

async fn join_watch(watch: DeathWatch) {
    if let Err(e) = watch.join.await {
        if e.is_panic() {
            warn!(error = %e, "Death watch panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Registry = TokenRegistry<String>;

    async fn next_kind(rx: &mut tokio::sync::broadcast::Receiver<Event>, kind: EventKind) -> Event {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let ev = rx.recv().await.unwrap();
                if ev.kind == kind {
                    return ev;
                }
            }
        })
        .await
        .expect("event should arrive")
    }

    #[tokio::test]
    async fn register_is_idempotent_per_token() {
        let reg = Registry::new(Bus::new(64));
        let token = ClientToken::new();
        assert!(reg.register(&token, Arc::new("a".into()), 0).await);
        assert!(!reg.register(&token, Arc::new("b".into()), 0).await);
        assert_eq!(reg.len().await, 1);
        assert_eq!(*reg.lookup(token.id()).await.unwrap().listener, "a");
    }

    #[tokio::test]
    async fn dead_client_is_removed() {
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let reg = Registry::new(bus);
        let token = ClientToken::new();
        reg.register(&token, Arc::new("a".into()), 10).await;

        token.mark_dead();
        let ev = next_kind(&mut rx, EventKind::SessionDied).await;
        assert_eq!(ev.token, Some(token.id().get()));
        assert_eq!(ev.owner, Some(10));
        assert!(reg.lookup(token.id()).await.is_none());
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn wrong_owner_cannot_unregister() {
        let reg = Registry::new(Bus::new(64));
        let token = ClientToken::new();
        reg.register(&token, Arc::new("a".into()), 10).await;

        let err = reg.unregister(token.id(), 11).await.unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidOwner {
                token: token.id().get(),
                owner: 10,
                caller: 11
            }
        );
        assert!(reg.lookup(token.id()).await.is_some());

        reg.unregister(token.id(), 10).await.unwrap();
        assert_eq!(
            reg.unregister(token.id(), 10).await,
            Err(RegistryError::NotRegistered {
                token: token.id().get()
            })
        );
    }

    #[tokio::test]
    async fn unregister_disarms_the_watch() {
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let reg = Registry::new(bus);
        let token = ClientToken::new();
        reg.register(&token, Arc::new("a".into()), 0).await;
        reg.unregister(token.id(), 0).await.unwrap();

        // Re-register and kill: exactly one death for the new registration.
        reg.register(&token, Arc::new("b".into()), 0).await;
        token.mark_dead();
        next_kind(&mut rx, EventKind::SessionDied).await;
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn sessions_are_listed_in_registration_order() {
        let reg = Registry::new(Bus::new(64));
        let tokens: Vec<ClientToken> = (0..3).map(|_| ClientToken::new()).collect();
        for (i, t) in tokens.iter().enumerate().rev() {
            reg.register(t, Arc::new(format!("s{i}")), 0).await;
        }
        let names: Vec<String> = reg
            .sessions()
            .await
            .iter()
            .map(|e| (*e.listener).clone())
            .collect();
        assert_eq!(names, vec!["s2", "s1", "s0"]);
    }

    #[tokio::test]
    async fn prune_removes_and_reports() {
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let reg = Registry::new(bus);
        let token = ClientToken::new();
        reg.register(&token, Arc::new("a".into()), 3).await;

        assert!(reg.prune(token.id()).await);
        assert!(!reg.prune(token.id()).await);
        let ev = next_kind(&mut rx, EventKind::SessionPruned).await;
        assert_eq!(ev.owner, Some(3));
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let reg = Registry::new(Bus::new(64));
        for _ in 0..4 {
            reg.register(&ClientToken::new(), Arc::new("x".into()), 0).await;
        }
        reg.clear().await;
        assert!(reg.is_empty().await);
    }
}

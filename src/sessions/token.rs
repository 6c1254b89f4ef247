//! # Client identity tokens with a liveness signal.
//!
//! A [`ClientToken`] stands for one remote client connection. The transport
//! creates it when the client connects and calls [`ClientToken::mark_dead`]
//! when the connection drops. Clones share the same liveness, so every holder
//! observes the death.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique, process-wide identifier of a [`ClientToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(u64);

impl TokenId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// Opaque client identity plus its liveness channel.
#[derive(Debug, Clone)]
pub struct ClientToken {
    id: TokenId,
    alive: CancellationToken,
}

impl ClientToken {
    /// Creates a live token with a fresh id.
    pub fn new() -> Self {
        Self {
            id: TokenId(NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed)),
            alive: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    /// Signals that the client is gone. Idempotent.
    pub fn mark_dead(&self) {
        self.alive.cancel();
    }

    pub fn is_alive(&self) -> bool {
        !self.alive.is_cancelled()
    }

    /// Resolves once the client is gone.
    pub async fn dead(&self) {
        self.alive.cancelled().await;
    }
}

impl Default for ClientToken {
    fn default() -> Self {
        Self::new()
    }
}

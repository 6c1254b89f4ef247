//! # Client sessions keyed by identity token.
//!
//! - [`ClientToken`] / [`TokenId`]: a client's identity and liveness signal.
//! - [`TokenRegistry`]: listener + owner per token, cleaned up when the client dies.

mod registry;
mod token;

pub use registry::{SessionEntry, TokenRegistry};
pub use token::{ClientToken, TokenId};

/// Numeric user (profile) identifier.
pub type UserId = u32;

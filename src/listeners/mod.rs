//! # Listener fan-out.
//!
//! - [`ItemListener`]: callbacks a remote listener implements.
//! - [`ListenerHub`]: registers listeners and delivers posted/removed items
//!   to all of them, isolating failures per listener.

mod hub;
mod listener;

pub use hub::{ListenerHandle, ListenerHub};
pub use listener::ItemListener;

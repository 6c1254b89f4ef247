//! Runtime core: configuration, wiring and lifecycle.
//!
//! Public API: [`Config`], [`RuntimeBuilder`] and [`Runtime`], which owns
//! every service and performs graceful shutdown.
//!
//! Internal modules:
//! - [`builder`]: constructs the services in dependency order;
//! - [`runtime`]: owns them, forwards events to subscribers, shuts down within grace;
//! - [`shutdown`]: cross-platform shutdown signal handling.

mod builder;
mod config;
mod runtime;
mod shutdown;

pub use builder::RuntimeBuilder;
pub use config::Config;
pub use runtime::Runtime;

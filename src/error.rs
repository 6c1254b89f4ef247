//! Error types used by the workvisor runtime and its services.
//!
//! One enum per concern:
//!
//! - [`RuntimeError`]: errors raised by the runtime lifecycle itself.
//! - [`StoreError`]: durable storage failures (I/O, encoding, bounds).
//! - [`SpecError`]: a work description that can never be scheduled.
//! - [`RegistryError`]: invalid caller state against the session registry.
//! - [`DispatchError`]: requests rejected by the sensor dispatcher.
//! - [`ListenerError`]: a remote listener failed to accept a callback.
//! - [`SubmitError`]: a bounded actor queue refused a command.
//!
//! All types provide `as_label` for logs/metrics.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// # Errors produced by the workvisor runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some components did not stop in time.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Names of components that did not shut down in time.
        stuck: Vec<&'static str>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use workvisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RuntimeError::GraceExceeded { grace, stuck } => {
                format!("grace exceeded after {grace:?}; stuck components={stuck:?}")
            }
        }
    }
}

/// # Errors produced by durable storage.
///
/// None of these reach the caller of `WorkStore::add`/`remove`: the writer
/// logs them and retries on the next cycle. They surface through `flush`
/// and through the load path's logs.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    /// File exceeds the configured size cap.
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual file size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: u64,
    },

    /// The target path has no parent directory.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Offending path.
        path: PathBuf,
    },

    /// The persisted document carries a schema version we do not read.
    #[error("unsupported file version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version read from disk.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// JSON serialization failed.
    #[error("json serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// JSON deserialization failed.
    #[error("json deserialization failed: {0}")]
    Deserialize(#[source] serde_json::Error),

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The background writer attempted the write and it failed.
    #[error("durable write failed: {0}")]
    WriteFailed(String),

    /// The background writer is gone (store shut down).
    #[error("store writer closed")]
    Closed,
}

impl StoreError {
    /// Convenience constructor for I/O errors with context.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::FileTooLarge { .. } => "store_file_too_large",
            StoreError::NoParentDirectory { .. } => "store_no_parent_dir",
            StoreError::UnsupportedVersion { .. } => "store_unsupported_version",
            StoreError::Serialize(_) => "store_serialize",
            StoreError::Deserialize(_) => "store_deserialize",
            StoreError::Io { .. } => "store_io",
            StoreError::WriteFailed(_) => "store_write_failed",
            StoreError::Closed => "store_closed",
        }
    }

    /// Returns true when the file simply does not exist yet.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

/// # A work description that can never be scheduled.
///
/// `WorkSpecBuilder::build` panics with this; `try_build` returns it. The
/// reload path uses `try_build` so a corrupted file never panics.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecError {
    /// Periodic work cannot also carry a minimum latency.
    #[error("periodic work cannot have a minimum latency")]
    PeriodicWithLatency,

    /// Periodic work cannot also carry an override deadline.
    #[error("periodic work cannot have an override deadline")]
    PeriodicWithDeadline,

    /// Periodic interval must be positive.
    #[error("periodic interval must be positive")]
    ZeroInterval,

    /// Backoff initial delay must be positive.
    #[error("backoff initial delay must be positive")]
    ZeroBackoff,
}

impl SpecError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SpecError::PeriodicWithLatency => "spec_periodic_with_latency",
            SpecError::PeriodicWithDeadline => "spec_periodic_with_deadline",
            SpecError::ZeroInterval => "spec_zero_interval",
            SpecError::ZeroBackoff => "spec_zero_backoff",
        }
    }
}

/// # Errors produced by the session registry.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The token was registered by a different owner.
    #[error("token {token} is owned by user {owner}, not {caller}")]
    InvalidOwner {
        /// Token id.
        token: u64,
        /// Owner recorded at registration.
        owner: u32,
        /// Owner presented by the caller.
        caller: u32,
    },

    /// The token is not registered.
    #[error("token {token} is not registered")]
    NotRegistered {
        /// Token id.
        token: u64,
    },
}

impl RegistryError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RegistryError::InvalidOwner { .. } => "registry_invalid_owner",
            RegistryError::NotRegistered { .. } => "registry_not_registered",
        }
    }
}

/// # Requests rejected by the sensor dispatcher.
///
/// Expected failure paths of `SensorHandle`; the dispatcher logs each at warn level.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The sensor is serving another request.
    #[error("sensor is in use")]
    Busy,

    /// The token has no registered session.
    #[error("no listener registered for token")]
    NotRegistered,

    /// The token is registered to a different user.
    #[error("token belongs to another user")]
    InvalidOwner,

    /// The caller lacks the capability required for this call.
    #[error("permission denied")]
    PermissionDenied,

    /// The backend refused the request.
    #[error("backend returned {code}")]
    Backend {
        /// Backend-defined status code.
        code: i32,
    },

    /// The enrollment record could not be written.
    #[error("enrollment record could not be persisted")]
    Persist,

    /// The dispatcher actor is gone.
    #[error("dispatcher closed")]
    Closed,
}

impl DispatchError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchError::Busy => "dispatch_busy",
            DispatchError::NotRegistered => "dispatch_not_registered",
            DispatchError::InvalidOwner => "dispatch_invalid_owner",
            DispatchError::PermissionDenied => "dispatch_permission_denied",
            DispatchError::Backend { .. } => "dispatch_backend",
            DispatchError::Persist => "dispatch_persist",
            DispatchError::Closed => "dispatch_closed",
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::InvalidOwner { .. } => DispatchError::InvalidOwner,
            RegistryError::NotRegistered { .. } => DispatchError::NotRegistered,
        }
    }
}

/// # A listener could not accept a callback.
///
/// Returned by listener implementations; the dispatch boundary catches it.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// The remote side is gone.
    #[error("listener disconnected")]
    Disconnected,

    /// The remote side rejected the callback.
    #[error("listener failed: {0}")]
    Failed(String),
}

impl ListenerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ListenerError::Disconnected => "listener_disconnected",
            ListenerError::Failed(_) => "listener_failed",
        }
    }
}

/// Error returned when a bounded actor queue refuses a command.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Queue is full (try again later).
    #[error("command queue full")]
    Full,

    /// Actor is gone.
    #[error("command queue closed")]
    Closed,
}

impl SubmitError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SubmitError::Full => "submit_full",
            SubmitError::Closed => "submit_closed",
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::TrySendError<T>> for SubmitError {
    fn from(e: tokio::sync::mpsc::error::TrySendError<T>) -> Self {
        match e {
            tokio::sync::mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        }
    }
}

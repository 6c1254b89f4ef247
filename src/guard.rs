//! Panic and error isolation at callback boundaries.
//!
//! Every place that calls into user or remote code (subscribers, sensor
//! receivers, hub listeners) goes through these helpers so that one broken
//! callee cannot take down the actor that called it. Listener callbacks also
//! run under a deadline: a callee that never returns counts as failed.
//!
//! `AssertUnwindSafe` is used: a callee that panics while holding its own
//! `Mutex` may leave that state poisoned, but the caller's state is untouched.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;

use crate::error::ListenerError;

/// Outcome of a guarded callback that did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Fault {
    /// The callee returned an error.
    Failed(ListenerError),
    /// The callee panicked; carries the panic message.
    Panicked(String),
    /// The callee did not finish within the deadline.
    TimedOut(Duration),
}

impl Fault {
    pub(crate) fn describe(&self) -> String {
        match self {
            Fault::Failed(e) => e.to_string(),
            Fault::Panicked(msg) => format!("panicked: {msg}"),
            Fault::TimedOut(after) => format!("no answer within {after:?}"),
        }
    }
}

/// Awaits `fut` for at most `deadline`, turning an `Err`, a panic or a
/// timeout into a [`Fault`]. A timed out callee is dropped.
pub(crate) async fn guarded<F>(deadline: Duration, fut: F) -> Result<(), Fault>
where
    F: Future<Output = Result<(), ListenerError>>,
{
    match tokio::time::timeout(deadline, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(Fault::Failed(e)),
        Ok(Err(panic)) => Err(Fault::Panicked(panic_message(&*panic))),
        Err(_) => Err(Fault::TimedOut(deadline)),
    }
}

/// Awaits an infallible `fut`, reporting only a panic.
pub(crate) async fn unwind_guarded<F>(fut: F) -> Result<(), String>
where
    F: Future<Output = ()>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|panic| panic_message(&*panic))
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(any: &(dyn Any + Send)) -> String {
    if let Some(msg) = any.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = any.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn ok_passes_through() {
        assert_eq!(guarded(DEADLINE, async { Ok(()) }).await, Ok(()));
    }

    #[tokio::test]
    async fn error_becomes_failed() {
        let res = guarded(DEADLINE, async { Err(ListenerError::Disconnected) }).await;
        assert_eq!(res, Err(Fault::Failed(ListenerError::Disconnected)));
    }

    #[tokio::test]
    async fn panic_becomes_panicked() {
        let res = guarded(DEADLINE, async {
            if true {
                panic!("boom");
            }
            Ok(())
        })
        .await;
        assert_eq!(res, Err(Fault::Panicked("boom".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn callee_that_never_answers_times_out() {
        let deadline = Duration::from_millis(50);
        let res = guarded(deadline, std::future::pending::<Result<(), ListenerError>>()).await;
        assert_eq!(res, Err(Fault::TimedOut(deadline)));
    }

    #[tokio::test]
    async fn formatted_panic_message_is_kept() {
        let n = 3;
        let res = unwind_guarded(async move {
            if n > 0 {
                panic!("bad {n}");
            }
        })
        .await;
        assert_eq!(res, Err("bad 3".to_string()));
    }
}

//! Panic isolation for handler invocations.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Outcome of a guarded handler call.
#[derive(Debug)]
pub(crate) enum GuardOutcome<T> {
    Completed(T),
    Panicked(String),
}

/// Await `future`, turning a panic into [`GuardOutcome::Panicked`].
pub(crate) async fn run_guarded<F>(future: F) -> GuardOutcome<F::Output>
where
    F: Future,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(output) => GuardOutcome::Completed(output),
        Err(payload) => GuardOutcome::Panicked(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

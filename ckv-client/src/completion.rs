//! # Completion Contract
//!
//! A command finishes through exactly one of two channels:
//! - a caller callback `FnOnce(Result<T>)`, or
//! - a [`Deferred<T>`] future handed back when no callback was supplied.
//!
//! Both are completed from the dispatch loop, so ordering guarantees are the
//! same for either style.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use ckv_common::Status;

use crate::error::{Error, Result};

/// Caller-supplied completion callback.
pub type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Where a command's outcome goes.
pub(crate) enum Completion<T> {
    Callback(Callback<T>),
    Deferred(oneshot::Sender<Result<T>>),
}

impl<T: Send + 'static> Completion<T> {
    pub(crate) fn callback(callback: impl FnOnce(Result<T>) + Send + 'static) -> Self {
        Completion::Callback(Box::new(callback))
    }

    /// Creates a deferred completion and the future the caller awaits.
    pub(crate) fn deferred() -> (Self, Deferred<T>) {
        let (tx, rx) = oneshot::channel();
        (Completion::Deferred(tx), Deferred { rx })
    }

    /// Delivers the outcome. A panicking callback is logged, not propagated,
    /// so the dispatch loop keeps serving other commands.
    pub(crate) fn complete(self, result: Result<T>) {
        match self {
            Completion::Callback(callback) => {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                    tracing::error!("command callback panicked");
                }
            }
            Completion::Deferred(tx) => {
                // Receiver dropped means the caller stopped waiting.
                let _ = tx.send(result);
            }
        }
    }
}

/// Future resolved with a command's outcome.
///
/// The command is already submitted when this value is returned; dropping it
/// does not cancel the command.
#[must_use = "the outcome of the command is only observable by awaiting it"]
pub struct Deferred<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::new(
                Status::ClientFailure,
                "command dropped before completion",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn deferred_resolves_with_result() {
        let (completion, deferred) = Completion::<u32>::deferred();
        completion.complete(Ok(7));
        assert_eq!(deferred.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn dropped_completion_rejects_deferred() {
        let (completion, deferred) = Completion::<u32>::deferred();
        drop(completion);
        let err = deferred.await.unwrap_err();
        assert_eq!(err.status(), Status::ClientFailure);
    }

    #[test]
    fn callback_receives_error() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let completion = Completion::<()>::callback(move |result| {
            *sink.lock().unwrap() = Some(result.unwrap_err().status());
        });
        completion.complete(Err(Error::param("bad")));
        assert_eq!(*seen.lock().unwrap(), Some(Status::InvalidParam));
    }

    #[test]
    fn panicking_callback_is_contained() {
        let completion = Completion::<()>::callback(|_| panic!("boom"));
        completion.complete(Ok(()));
    }
}

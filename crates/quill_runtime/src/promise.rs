//! One-shot resolve promises.
//!
//! A promise is the hand-off between work running elsewhere (a background
//! task, a batch loader flush) and the executor. The producer half delivers
//! exactly once and never blocks; the consumer half is polled by the executor
//! during its drain loop and may be dropped without reading, for example when
//! a non-null ancestor of the field has already failed.

use crate::resolver::ResolverError;
use serde_json::Value;
use std::future::Future;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// The outcome of resolving one field.
pub type ResolveResult = Result<Value, ResolverError>;

/// Errors from waiting on a promise.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromiseError {
    #[error("cancelled while waiting for a resolve result")]
    Cancelled,

    #[error("resolve result was already taken")]
    Taken,
}

/// Creates a connected sender and promise.
pub fn channel() -> (PromiseSender, ResolvePromise) {
    let (tx, rx) = oneshot::channel();
    (
        PromiseSender { tx },
        ResolvePromise {
            state: State::Waiting(rx),
        },
    )
}

/// Runs `future` on a background task and returns the promise it delivers.
pub fn spawn<F>(future: F) -> ResolvePromise
where
    F: Future<Output = ResolveResult> + Send + 'static,
{
    let (sender, promise) = channel();
    tokio::spawn(async move {
        sender.deliver(future.await);
    });
    promise
}

/// Runs blocking work on the blocking pool and returns its promise.
pub fn spawn_blocking<F>(work: F) -> ResolvePromise
where
    F: FnOnce() -> ResolveResult + Send + 'static,
{
    let (sender, promise) = channel();
    tokio::task::spawn_blocking(move || sender.deliver(work()));
    promise
}

/// Producer half of a promise.
#[derive(Debug)]
pub struct PromiseSender {
    tx: oneshot::Sender<ResolveResult>,
}

impl PromiseSender {
    /// Delivers the result. A dropped consumer is not an error.
    pub fn deliver(self, result: ResolveResult) {
        let _ = self.tx.send(result);
    }

    /// Returns true if the consumer has gone away.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
enum State {
    Waiting(oneshot::Receiver<ResolveResult>),
    Ready(ResolveResult),
    Taken,
}

/// Consumer half of a promise.
#[derive(Debug)]
pub struct ResolvePromise {
    state: State,
}

impl ResolvePromise {
    /// A promise that is already fulfilled.
    pub fn ready(result: ResolveResult) -> Self {
        Self {
            state: State::Ready(result),
        }
    }

    /// Takes the result if it has been delivered. Never blocks.
    ///
    /// Returns `None` while the producer is still working, and after the
    /// result has been taken once.
    pub fn poll(&mut self) -> Option<ResolveResult> {
        match std::mem::replace(&mut self.state, State::Taken) {
            State::Ready(result) => Some(result),
            State::Waiting(mut rx) => match rx.try_recv() {
                Ok(result) => Some(result),
                Err(TryRecvError::Empty) => {
                    self.state = State::Waiting(rx);
                    None
                }
                Err(TryRecvError::Closed) => Some(Err(abandoned())),
            },
            State::Taken => None,
        }
    }

    /// Returns true once a result is available to [`poll`](Self::poll).
    pub fn is_ready(&mut self) -> bool {
        match &mut self.state {
            State::Ready(_) => true,
            State::Taken => false,
            State::Waiting(rx) => match rx.try_recv() {
                Ok(result) => {
                    self.state = State::Ready(result);
                    true
                }
                Err(TryRecvError::Empty) => false,
                Err(TryRecvError::Closed) => {
                    self.state = State::Ready(Err(abandoned()));
                    true
                }
            },
        }
    }

    /// Waits until the result is delivered or `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<ResolveResult, PromiseError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PromiseError::Cancelled),
            () = self.filled() => {}
        }
        self.poll().ok_or(PromiseError::Taken)
    }

    /// Completes once the slot is full, without taking the result.
    pub(crate) async fn filled(&mut self) {
        if let State::Waiting(rx) = &mut self.state {
            let result = rx.await.unwrap_or_else(|_| Err(abandoned()));
            self.state = State::Ready(result);
        }
    }
}

impl From<ResolveResult> for ResolvePromise {
    fn from(result: ResolveResult) -> Self {
        Self::ready(result)
    }
}

fn abandoned() -> ResolverError {
    ResolverError::Internal("resolve promise dropped without a result".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_poll_before_and_after_delivery() {
        let (sender, mut promise) = channel();
        assert!(promise.poll().is_none());
        sender.deliver(Ok(json!(1)));
        assert_eq!(promise.poll().unwrap().unwrap(), json!(1));
        assert!(promise.poll().is_none());
    }

    #[test]
    fn test_deliver_to_dropped_consumer() {
        let (sender, promise) = channel();
        drop(promise);
        assert!(sender.is_abandoned());
        sender.deliver(Ok(json!("ignored")));
    }

    #[test]
    fn test_dropped_sender_yields_error() {
        let (sender, mut promise) = channel();
        drop(sender);
        assert!(matches!(promise.poll(), Some(Err(ResolverError::Internal(_)))));
    }

    #[tokio::test]
    async fn test_wait_for_spawned_work() {
        let mut promise = spawn(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(json!(true))
        });
        let result = promise.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_wait_cancelled_and_sender_still_safe() {
        let (sender, mut promise) = channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(promise.wait(&cancel).await.unwrap_err(), PromiseError::Cancelled);
        sender.deliver(Ok(json!(2)));
        assert_eq!(promise.poll().unwrap().unwrap(), json!(2));
    }

    #[test]
    fn test_is_ready_keeps_result() {
        let (sender, mut promise) = channel();
        assert!(!promise.is_ready());
        sender.deliver(Ok(json!(3)));
        assert!(promise.is_ready());
        assert_eq!(promise.poll().unwrap().unwrap(), json!(3));
    }
}

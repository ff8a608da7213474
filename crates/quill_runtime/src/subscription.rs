//! Subscription source streams and the per-event driver.

use crate::context::Context;
use crate::error::{ExecutionError, Response};
use crate::executor::{Executor, PreparedOperation};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type StopFn = Box<dyn FnOnce() + Send>;

/// The producer side of a subscription: an event channel plus a stop hook
/// that releases the producer.
///
/// The stop hook runs at most once, either through [`stop`](Self::stop) or
/// when the stream is dropped.
pub struct SourceStream {
    events: mpsc::Receiver<Value>,
    stop: Option<StopFn>,
}

impl SourceStream {
    pub fn new<F>(events: mpsc::Receiver<Value>, stop: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            events,
            stop: Some(Box::new(stop)),
        }
    }

    /// A stream with nothing to release on stop.
    pub fn from_receiver(events: mpsc::Receiver<Value>) -> Self {
        Self { events, stop: None }
    }

    /// Creates a stream and the sender that feeds it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Value>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::from_receiver(rx))
    }

    /// Forwards a [`Stream`] from a background task, which is aborted on stop.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(event) = stream.next().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Self::new(rx, move || task.abort())
    }

    /// Releases the producer. Calling it again does nothing.
    pub fn stop(&mut self) {
        self.events.close();
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }

    /// Receives the next event, or `None` once the producer is gone.
    pub async fn next_event(&mut self) -> Option<Value> {
        self.events.recv().await
    }

    /// Hands every event to `on_event` until the channel closes, `on_event`
    /// breaks, or `cancel` fires. The stream is stopped on every exit.
    pub async fn run<F, Fut>(
        &mut self,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<(), ExecutionError>
    where
        F: FnMut(Value) -> Fut,
        Fut: Future<Output = ControlFlow<()>>,
    {
        let result = loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break Err(ExecutionError::Cancelled),
                event = self.events.recv() => event,
            };
            let Some(event) = event else {
                break Ok(());
            };
            if on_event(event).await.is_break() {
                break Ok(());
            }
        };
        self.stop();
        result
    }
}

impl Drop for SourceStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStream")
            .field("stopped", &self.stop.is_none())
            .finish_non_exhaustive()
    }
}

/// A subscription ready to run: the prepared operation and its source stream.
pub struct Subscription {
    executor: Executor,
    operation: Arc<PreparedOperation>,
    stream: SourceStream,
    ctx: Context,
}

impl Subscription {
    pub(crate) fn new(
        executor: Executor,
        operation: Arc<PreparedOperation>,
        stream: SourceStream,
        ctx: Context,
    ) -> Self {
        Self {
            executor,
            operation,
            stream,
            ctx,
        }
    }

    pub fn operation(&self) -> &PreparedOperation {
        &self.operation
    }

    /// Token that cancels this subscription's run.
    pub fn cancellation(&self) -> CancellationToken {
        self.ctx.cancellation().clone()
    }

    /// Executes the selection set once per event, with the event as the root
    /// value, and hands each response to `on_response`.
    ///
    /// Returns `Ok` when the source closes or `on_response` breaks, and
    /// [`ExecutionError::Cancelled`] when the context is cancelled. The source
    /// stream is stopped exactly once whichever way the run ends.
    pub async fn run<F, Fut>(mut self, mut on_response: F) -> Result<(), ExecutionError>
    where
        F: FnMut(Response) -> Fut,
        Fut: Future<Output = ControlFlow<()>>,
    {
        let cancel = self.ctx.cancellation().clone();
        let result = loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break Err(ExecutionError::Cancelled),
                event = self.stream.next_event() => event,
            };
            let Some(event) = event else {
                tracing::debug!("subscription source closed");
                break Ok(());
            };
            let response = match self
                .executor
                .execute_prepared(&self.ctx, &self.operation, Some(event))
                .await
            {
                Ok(response) => response,
                Err(error) => break Err(error),
            };
            if on_response(response).await.is_break() {
                break Ok(());
            }
        };
        self.stream.stop();
        result
    }

    /// Stops the source stream without running.
    pub fn stop(mut self) {
        self.stream.stop();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

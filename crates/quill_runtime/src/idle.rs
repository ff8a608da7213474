//! The executor's suspension point.

use crate::context::Context;
use crate::dataloader::Dispatcher;
use async_trait::async_trait;

/// Called when the executor has pending promises but nothing it can run.
///
/// An implementation should arrange for at least one pending promise to be
/// delivered; the executor waits for a delivery after it returns.
#[async_trait]
pub trait IdleHandler: Send + Sync {
    async fn on_idle(&self, ctx: &Context);
}

/// Flushes the [`Dispatcher`] found in the context, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchIdle;

#[async_trait]
impl IdleHandler for DispatchIdle {
    async fn on_idle(&self, ctx: &Context) {
        if let Some(dispatcher) = ctx.data::<Dispatcher>() {
            let flushed = dispatcher.dispatch_all();
            tracing::trace!(flushed, "idle dispatch");
        }
        tokio::task::yield_now().await;
    }
}

/// An idle handler built from a closure.
pub struct FnIdle<F>(pub F);

#[async_trait]
impl<F> IdleHandler for FnIdle<F>
where
    F: Fn(&Context) + Send + Sync,
{
    async fn on_idle(&self, ctx: &Context) {
        (self.0)(ctx);
    }
}

//! Batch loading for N+1 prevention.
//!
//! A [`BatchLoader`] hands out promises and queues their keys. Nothing is
//! fetched until the executor goes idle and the [`Dispatcher`] flushes every
//! registered loader, so all keys requested in one pass share a single call
//! to the batch function.

use crate::promise::{self, PromiseSender, ResolvePromise};
use crate::resolver::ResolverError;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

/// Something the dispatcher can flush.
pub trait Dispatch: Send + Sync {
    /// Starts loading every queued key. Returns how many keys were flushed.
    fn dispatch(&self) -> usize;
}

/// Flushes registered loaders when the executor is idle.
///
/// Put one in the request [`Context`](crate::Context) to have the default
/// idle handler use it.
#[derive(Clone, Default)]
pub struct Dispatcher {
    loaders: Arc<Mutex<Vec<Weak<dyn Dispatch>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, loader: Weak<dyn Dispatch>) {
        self.loaders.lock().push(loader);
    }

    /// Flushes every live loader; dropped loaders are forgotten.
    pub fn dispatch_all(&self) -> usize {
        let live: Vec<Arc<dyn Dispatch>> = {
            let mut loaders = self.loaders.lock();
            loaders.retain(|l| l.strong_count() > 0);
            loaders.iter().filter_map(Weak::upgrade).collect()
        };
        live.iter().map(|loader| loader.dispatch()).sum()
    }

    pub fn len(&self) -> usize {
        self.loaders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("loaders", &self.len())
            .finish()
    }
}

/// Result of one batch call. Keys missing from the map load as `null`.
pub type BatchResult<K> = Result<HashMap<K, Value>, ResolverError>;

type BatchFn<K> = dyn Fn(Vec<K>) -> BoxFuture<'static, BatchResult<K>> + Send + Sync;

/// A loader that batches and caches loads.
pub struct BatchLoader<K> {
    inner: Arc<LoaderInner<K>>,
}

struct LoaderInner<K> {
    batch_fn: Arc<BatchFn<K>>,
    cache: Arc<Mutex<FxHashMap<K, Value>>>,
    queue: Mutex<IndexMap<K, Vec<PromiseSender>>>,
    max_batch_size: usize,
}

impl<K> BatchLoader<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Creates a loader and registers it with `dispatcher`.
    pub fn new<F>(dispatcher: &Dispatcher, batch_fn: F) -> Self
    where
        F: Fn(Vec<K>) -> BoxFuture<'static, BatchResult<K>> + Send + Sync + 'static,
    {
        Self::with_max_batch_size(dispatcher, usize::MAX, batch_fn)
    }

    /// Like [`new`](Self::new), splitting flushes into calls of at most
    /// `max_batch_size` keys.
    pub fn with_max_batch_size<F>(dispatcher: &Dispatcher, max_batch_size: usize, batch_fn: F) -> Self
    where
        F: Fn(Vec<K>) -> BoxFuture<'static, BatchResult<K>> + Send + Sync + 'static,
    {
        let inner = Arc::new(LoaderInner {
            batch_fn: Arc::new(batch_fn),
            cache: Arc::new(Mutex::new(FxHashMap::default())),
            queue: Mutex::new(IndexMap::new()),
            max_batch_size: max_batch_size.max(1),
        });
        let weak: Weak<LoaderInner<K>> = Arc::downgrade(&inner);
        dispatcher.register(weak);
        Self { inner }
    }

    /// Loads a value by key.
    ///
    /// A cached key is ready at once; otherwise the key is queued until the
    /// next dispatch.
    pub fn load(&self, key: K) -> ResolvePromise {
        if let Some(value) = self.inner.cache.lock().get(&key) {
            return ResolvePromise::ready(Ok(value.clone()));
        }
        let (sender, promise) = promise::channel();
        self.inner.queue.lock().entry(key).or_default().push(sender);
        promise
    }

    /// Primes the cache with a value.
    pub fn prime(&self, key: K, value: Value) {
        self.inner.cache.lock().insert(key, value);
    }

    /// Clears a specific key from the cache.
    pub fn clear_key(&self, key: &K) {
        self.inner.cache.lock().remove(key);
    }

    /// Clears the cache.
    pub fn clear(&self) {
        self.inner.cache.lock().clear();
    }

    /// Number of keys waiting for a dispatch.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl<K> Clone for BatchLoader<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Dispatch for LoaderInner<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn dispatch(&self) -> usize {
        let queued = std::mem::take(&mut *self.queue.lock());
        let flushed = queued.len();
        if flushed == 0 {
            return 0;
        }

        let mut entries = queued.into_iter().peekable();
        while entries.peek().is_some() {
            let chunk: Vec<(K, Vec<PromiseSender>)> =
                entries.by_ref().take(self.max_batch_size).collect();
            let keys: Vec<K> = chunk.iter().map(|(k, _)| k.clone()).collect();
            let batch = (self.batch_fn)(keys);
            // An in-flight batch must not keep the cache alive.
            let cache = Arc::downgrade(&self.cache);

            tokio::spawn(async move {
                match batch.await {
                    Ok(mut values) => {
                        for (key, senders) in chunk {
                            let value = values.remove(&key).unwrap_or(Value::Null);
                            if let Some(cache) = cache.upgrade() {
                                cache.lock().insert(key, value.clone());
                            }
                            for sender in senders {
                                sender.deliver(Ok(value.clone()));
                            }
                        }
                    }
                    Err(error) => {
                        tracing::debug!(%error, "batch load failed");
                        for sender in chunk.into_iter().flat_map(|(_, s)| s) {
                            sender.deliver(Err(error.clone()));
                        }
                    }
                }
            });
        }

        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn doubling_loader(dispatcher: &Dispatcher, calls: Arc<AtomicUsize>) -> BatchLoader<u64> {
        BatchLoader::new(dispatcher, move |keys: Vec<u64>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(keys
                    .into_iter()
                    .filter(|k| *k != 0)
                    .map(|k| (k, json!(k * 2)))
                    .collect::<HashMap<_, _>>())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_loads_are_batched_until_dispatch() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = doubling_loader(&dispatcher, calls.clone());

        let mut a = loader.load(1);
        let mut b = loader.load(2);
        let mut c = loader.load(1);
        assert_eq!(loader.queued(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(dispatcher.dispatch_all(), 2);
        let cancel = CancellationToken::new();
        assert_eq!(a.wait(&cancel).await.unwrap().unwrap(), json!(2));
        assert_eq!(b.wait(&cancel).await.unwrap().unwrap(), json!(4));
        assert_eq!(c.wait(&cancel).await.unwrap().unwrap(), json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_and_missing_keys() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = doubling_loader(&dispatcher, calls.clone());
        loader.prime(7, json!("primed"));

        let mut primed = loader.load(7);
        assert!(primed.is_ready());
        assert_eq!(primed.poll().unwrap().unwrap(), json!("primed"));

        let mut missing = loader.load(0);
        dispatcher.dispatch_all();
        let cancel = CancellationToken::new();
        assert_eq!(missing.wait(&cancel).await.unwrap().unwrap(), Value::Null);

        // Now cached.
        assert!(loader.load(0).is_ready());
        loader.clear();
        assert!(!loader.load(0).is_ready());
    }

    #[tokio::test]
    async fn test_error_reaches_every_waiter() {
        let dispatcher = Dispatcher::new();
        let loader: BatchLoader<&'static str> = BatchLoader::new(&dispatcher, |_| {
            async { Err::<HashMap<_, _>, _>(ResolverError::new("backend down")) }.boxed()
        });
        let mut a = loader.load("a");
        let mut b = loader.load("b");
        dispatcher.dispatch_all();
        let cancel = CancellationToken::new();
        assert_eq!(a.wait(&cancel).await.unwrap(), Err(ResolverError::new("backend down")));
        assert_eq!(b.wait(&cancel).await.unwrap(), Err(ResolverError::new("backend down")));
    }

    #[tokio::test]
    async fn test_max_batch_size_splits_calls() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let loader = BatchLoader::with_max_batch_size(&dispatcher, 2, move |keys: Vec<u64>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(keys.into_iter().map(|k| (k, json!(k))).collect::<HashMap<_, _>>()) }.boxed()
        });
        let mut promises: Vec<_> = (0..5).map(|k| loader.load(k)).collect();
        assert_eq!(dispatcher.dispatch_all(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let cancel = CancellationToken::new();
        for (k, promise) in promises.iter_mut().enumerate() {
            assert_eq!(promise.wait(&cancel).await.unwrap().unwrap(), json!(k));
        }
    }

    #[test]
    fn test_dropped_loaders_are_forgotten() {
        let dispatcher = Dispatcher::new();
        let loader = doubling_loader(&dispatcher, Arc::new(AtomicUsize::new(0)));
        assert_eq!(dispatcher.len(), 1);
        drop(loader);
        assert_eq!(dispatcher.dispatch_all(), 0);
        assert!(dispatcher.is_empty());
    }
}

//! Execution context: cancellation plus caller-supplied values.

use rustc_hash::FxHashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context handed to every resolver of one execution.
///
/// Values are keyed by their Rust type, so each type can be stored once.
/// Cloning is cheap; clones share values and the cancellation token.
#[derive(Clone, Default)]
pub struct Context {
    values: Arc<FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    cancellation: CancellationToken,
}

impl Context {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any previous value of the same type.
    #[must_use]
    pub fn with_data<T: Any + Send + Sync>(mut self, value: T) -> Self {
        Arc::make_mut(&mut self.values).insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// Inserts a shared value.
    #[must_use]
    pub fn with_shared<T: Any + Send + Sync>(mut self, value: Arc<T>) -> Self {
        Arc::make_mut(&mut self.values).insert(TypeId::of::<T>(), value);
        self
    }

    /// Replaces the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Gets a value by type.
    pub fn data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Gets a shared handle to a value by type.
    pub fn data_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    /// Returns true if a value of this type is present.
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    /// Returns a context sharing these values whose token is cancelled with
    /// this one, but can also be cancelled on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
            cancellation: self.cancellation.child_token(),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cancels this context and every child.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("value_count", &self.values.len())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct UserId(u64);

    #[test]
    fn test_typed_values() {
        let ctx = Context::new().with_data(UserId(7)).with_data("token".to_string());
        assert_eq!(ctx.data::<UserId>(), Some(&UserId(7)));
        assert_eq!(ctx.data::<String>().map(String::as_str), Some("token"));
        assert!(ctx.data::<u32>().is_none());
    }

    #[test]
    fn test_clone_does_not_leak_later_inserts() {
        let base = Context::new().with_data(UserId(1));
        let extended = base.clone().with_data(UserId(2));
        assert_eq!(base.data::<UserId>(), Some(&UserId(1)));
        assert_eq!(extended.data::<UserId>(), Some(&UserId(2)));
    }

    #[test]
    fn test_child_cancellation() {
        let parent = Context::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
        let second = parent.child();
        parent.cancel();
        assert!(second.is_cancelled());
    }
}

//! Deferred operation ends for asynchronous results.
//!
//! When an instrumented call returns before its work is logically complete —
//! a future, a stream — the "end" decision is deferred: the call-site hook
//! hands the returned value to [`AsyncOperationEndSupport::async_end`], which
//! asks an [`AsyncEndStrategyRegistry`] for the first strategy that
//! recognizes the value's shape. A matching strategy attaches a completion
//! callback (by wrapping the value) and ends the operation exactly once when
//! the real completion happens; no match means the operation ends
//! synchronously before `async_end` returns.
//!
//! # Shapes
//!
//! A shape is a concrete type-erased form call-site hooks adapt their native
//! asynchronous values into before calling `async_end`:
//!
//! - [`FutureShape`] — a single-value asynchronous handle, recognized by
//!   [`FutureEndStrategy`].
//! - [`StreamShape`] — a multi-value reactive pipeline, recognized by
//!   [`StreamEndStrategy`].
//!
//! New shapes (other future/promise/stream libraries) are supported by
//! registering additional strategies; the engine core never changes.

use crate::lift_debug;
use futures_core::future::BoxFuture;
use futures_core::stream::BoxStream;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock};

mod future;
mod stream;
mod support;

pub use future::FutureEndStrategy;
pub use stream::StreamEndStrategy;
pub use support::{AsyncOperationEndSupport, OperationEnder};

use crate::OperationError;

/// A type-erased, possibly-asynchronous value returned by an instrumented
/// call site.
pub type AsyncValue = Box<dyn Any + Send>;

/// The type-erased resolved value of an asynchronous handle, shared between
/// the operation end and the downstream consumer.
pub type AsyncResponse = Arc<dyn Any + Send + Sync>;

/// The single-value future shape: resolves once, successfully or with an
/// [`OperationError`].
pub type FutureShape = BoxFuture<'static, Result<AsyncResponse, OperationError>>;

/// The multi-value stream shape: yields items until a terminal completion,
/// error, or cancellation.
pub type StreamShape = BoxStream<'static, Result<AsyncResponse, OperationError>>;

/// Recognizes one shape of asynchronous value and knows how to attach a
/// completion callback to it.
///
/// Implementations are stateless and registered once per process (or per
/// test) in an [`AsyncEndStrategyRegistry`].
pub trait AsyncOperationEndStrategy: Send + Sync {
    /// Returns whether this strategy recognizes `value`'s shape.
    fn supports(&self, value: &AsyncValue) -> bool;

    /// Defers the operation end until `value` really completes.
    ///
    /// The returned value replaces `value` at the instrumented call site and
    /// must be behaviorally indistinguishable from it. `ender` must fire
    /// exactly once — on completion, failure, or cancellation of the
    /// underlying work.
    fn end(&self, ender: OperationEnder, value: AsyncValue) -> AsyncValue;
}

/// An ordered, copy-on-write set of [`AsyncOperationEndStrategy`]s.
///
/// The registry is mutated rarely (startup/shutdown, test setup) and read on
/// every asynchronous call site: readers clone an `Arc` snapshot of the list
/// and never block behind writers rebuilding it. Construct one explicitly and
/// share it with the components that need it; there is no ambient global
/// instance.
pub struct AsyncEndStrategyRegistry {
    strategies: RwLock<Arc<Vec<Arc<dyn AsyncOperationEndStrategy>>>>,
}

impl AsyncEndStrategyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        AsyncEndStrategyRegistry {
            strategies: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Appends a strategy. Resolution order is registration order, so more
    /// specific strategies should be registered first.
    pub fn register(&self, strategy: Arc<dyn AsyncOperationEndStrategy>) {
        let mut guard = match self.strategies.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = (**guard).clone();
        next.push(strategy);
        *guard = Arc::new(next);
    }

    /// Removes a previously registered strategy, identified by instance.
    /// Returns whether it was present.
    pub fn unregister(&self, strategy: &Arc<dyn AsyncOperationEndStrategy>) -> bool {
        let mut guard = match self.strategies.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = guard.len();
        let next: Vec<_> = guard
            .iter()
            .filter(|existing| !Arc::ptr_eq(existing, strategy))
            .cloned()
            .collect();
        let removed = next.len() != before;
        if removed {
            *guard = Arc::new(next);
        } else {
            lift_debug!(name: "AsyncEndStrategyRegistry.UnregisterMissed");
        }
        removed
    }

    /// Returns the first registered strategy that supports `value`'s shape.
    pub fn resolve(&self, value: &AsyncValue) -> Option<Arc<dyn AsyncOperationEndStrategy>> {
        let snapshot = {
            let guard = match self.strategies.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(&*guard)
        };
        snapshot
            .iter()
            .find(|strategy| strategy.supports(value))
            .cloned()
    }

    /// Creates a registry with the strategies shipped by this crate
    /// ([`FutureEndStrategy`] first, then [`StreamEndStrategy`]).
    pub fn with_default_strategies() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(FutureEndStrategy));
        registry.register(Arc::new(StreamEndStrategy));
        registry
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        match self.strategies.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for AsyncEndStrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncEndStrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = match self.strategies.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        f.debug_struct("AsyncEndStrategyRegistry")
            .field("strategies", &len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MatchEverything;

    impl AsyncOperationEndStrategy for MatchEverything {
        fn supports(&self, _value: &AsyncValue) -> bool {
            true
        }

        fn end(&self, ender: OperationEnder, value: AsyncValue) -> AsyncValue {
            ender.end(None, None);
            value
        }
    }

    struct MatchNothing;

    impl AsyncOperationEndStrategy for MatchNothing {
        fn supports(&self, _value: &AsyncValue) -> bool {
            false
        }

        fn end(&self, ender: OperationEnder, value: AsyncValue) -> AsyncValue {
            ender.end(None, None);
            value
        }
    }

    #[test]
    fn resolve_is_first_match_in_registration_order() {
        let registry = AsyncEndStrategyRegistry::new();
        let never: Arc<dyn AsyncOperationEndStrategy> = Arc::new(MatchNothing);
        let always: Arc<dyn AsyncOperationEndStrategy> = Arc::new(MatchEverything);
        let always_too: Arc<dyn AsyncOperationEndStrategy> = Arc::new(MatchEverything);
        registry.register(never.clone());
        registry.register(always.clone());
        registry.register(always_too.clone());

        let value: AsyncValue = Box::new(7_u32);
        let resolved = registry.resolve(&value).expect("a strategy matches");
        assert!(Arc::ptr_eq(&resolved, &always));
    }

    #[test]
    fn unregister_removes_by_identity() {
        let registry = AsyncEndStrategyRegistry::new();
        let first: Arc<dyn AsyncOperationEndStrategy> = Arc::new(MatchEverything);
        let second: Arc<dyn AsyncOperationEndStrategy> = Arc::new(MatchEverything);
        registry.register(first.clone());
        registry.register(second.clone());
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(&first));
        assert_eq!(registry.len(), 1);
        // already gone
        assert!(!registry.unregister(&first));

        let value: AsyncValue = Box::new(7_u32);
        let resolved = registry.resolve(&value).expect("second still registered");
        assert!(Arc::ptr_eq(&resolved, &second));
    }

    #[test]
    fn resolve_none_when_nothing_matches() {
        let registry = AsyncEndStrategyRegistry::new();
        registry.register(Arc::new(MatchNothing));

        let value: AsyncValue = Box::new(7_u32);
        assert!(registry.resolve(&value).is_none());
    }
}

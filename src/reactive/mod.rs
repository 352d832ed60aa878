//! Context propagation through reactive pipelines.
//!
//! Poll-based pipelines hop threads: a stage is assembled under one context,
//! subscribed under another, and its events are delivered on whatever
//! scheduler thread resumes it. This module keeps the context that was
//! current at subscription time flowing to every event of that subscription.
//!
//! [`ContextPropagationOperator`] is installed once per process. While it is
//! installed, [`PropagatedStreamExt::propagate_context`] — the hook applied
//! to each pipeline stage — captures the current [`Context`] at the moment
//! the pipeline is materialized (each materialization is one subscription;
//! re-materializing from a factory, as retry combinators do, captures fresh)
//! and re-attaches it for the duration of delivering each individual event,
//! releasing it in between. Work started inside an event callback is
//! therefore parented by the subscription's context, no matter which thread
//! delivered the event. Installing the operator also registers the
//! [`StreamEndStrategy`] so stream-shaped results end their operations on
//! completion or cancellation.
//!
//! When the operator is not installed, the same wrappers degrade to
//! pass-throughs: no context is captured or restored, operations started
//! inside callbacks become unparented roots, and nothing crashes.
//!
//! Two escape hatches cover the cases the general hook cannot:
//!
//! - [`run_with_context`] forces an explicit context around every poll of a
//!   value regardless of install state. Eagerly-resolved stages deliver
//!   their value on the very first poll, so the context must be attached
//!   before that poll — this wrapper guarantees it.
//! - [`ContextPropagationOperator::wrap_schedule`] wraps a closure handed to
//!   any executor so the context current at submission time is restored when
//!   the closure actually runs.

use crate::async_end::{AsyncEndStrategyRegistry, AsyncOperationEndStrategy, StreamEndStrategy};
use crate::{lift_debug, Context};
use futures_core::Stream;
use pin_project_lite::pin_project;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

// Process-wide switch read by every propagate_context() call. Mutations are
// serialized by INSTALL_LOCK.
static PROPAGATION_ENABLED: AtomicBool = AtomicBool::new(false);
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Installs per-event context restoration for reactive pipelines.
///
/// Holds the strategy registry it registers the [`StreamEndStrategy`] into,
/// so [`uninstall`](ContextPropagationOperator::uninstall) can remove exactly
/// what was added.
pub struct ContextPropagationOperator {
    registry: Arc<AsyncEndStrategyRegistry>,
    strategy: Arc<dyn AsyncOperationEndStrategy>,
}

impl ContextPropagationOperator {
    /// Creates an operator wired to `registry`.
    pub fn new(registry: Arc<AsyncEndStrategyRegistry>) -> Self {
        ContextPropagationOperator {
            registry,
            strategy: Arc::new(StreamEndStrategy),
        }
    }

    /// Enables propagation process-wide and registers the stream end
    /// strategy. Idempotent.
    pub fn install(&self) {
        let _lock = match INSTALL_LOCK.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        if PROPAGATION_ENABLED.load(Ordering::Acquire) {
            lift_debug!(name: "ContextPropagationOperator.AlreadyInstalled");
            return;
        }
        self.registry.register(self.strategy.clone());
        PROPAGATION_ENABLED.store(true, Ordering::Release);
    }

    /// Disables propagation and unregisters the stream end strategy.
    /// Idempotent.
    pub fn uninstall(&self) {
        let _lock = match INSTALL_LOCK.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !PROPAGATION_ENABLED.load(Ordering::Acquire) {
            return;
        }
        self.registry.unregister(&self.strategy);
        PROPAGATION_ENABLED.store(false, Ordering::Release);
    }

    /// Returns whether propagation is currently installed.
    pub fn is_installed() -> bool {
        PROPAGATION_ENABLED.load(Ordering::Acquire)
    }

    /// Wraps a closure bound for an executor so the context current at
    /// submission time is attached while it runs.
    pub fn wrap_schedule<F>(task: F) -> impl FnOnce() + Send + 'static
    where
        F: FnOnce() + Send + 'static,
    {
        let cx = Context::current();
        move || {
            let _guard = cx.attach();
            task()
        }
    }
}

impl fmt::Debug for ContextPropagationOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPropagationOperator")
            .field("installed", &Self::is_installed())
            .finish()
    }
}

pin_project! {
    /// A pipeline stage whose events are delivered under a captured context.
    ///
    /// `cx` is `None` in degraded mode (operator not installed at capture
    /// time): the wrapper then polls straight through.
    #[derive(Debug)]
    pub struct Propagated<T> {
        #[pin]
        inner: T,
        cx: Option<Context>,
    }
}

impl<S: Stream> Stream for Propagated<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.cx {
            // Scoped per event: attached for this single delivery, released
            // before control returns to the executor.
            Some(cx) => {
                let _guard = cx.clone().attach();
                this.inner.poll_next(task_cx)
            }
            None => this.inner.poll_next(task_cx),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<F: std::future::Future> std::future::Future for Propagated<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.cx {
            Some(cx) => {
                let _guard = cx.clone().attach();
                this.inner.poll(task_cx)
            }
            None => this.inner.poll(task_cx),
        }
    }
}

impl<S: Stream> PropagatedStreamExt for S {}

/// The per-stage propagation hook for streams.
pub trait PropagatedStreamExt: Stream + Sized {
    /// Captures the current context (when the operator is installed) and
    /// delivers every event of this stream under it.
    ///
    /// Call this where the pipeline is materialized: the capture is scoped to
    /// this subscription, not to any definition it was built from.
    fn propagate_context(self) -> Propagated<Self> {
        Propagated {
            inner: self,
            cx: ContextPropagationOperator::is_installed().then(Context::current),
        }
    }
}

impl<F: std::future::Future> PropagatedFutureExt for F {}

/// The per-stage propagation hook for futures.
pub trait PropagatedFutureExt: std::future::Future + Sized {
    /// Captures the current context (when the operator is installed) and
    /// polls this future under it.
    fn propagate_context(self) -> Propagated<Self> {
        Propagated {
            inner: self,
            cx: ContextPropagationOperator::is_installed().then(Context::current),
        }
    }
}

/// Forces `value` (a future or stream) to run under `cx`, regardless of
/// whether the operator is installed.
///
/// This is the escape hatch for eagerly-resolved stages: the context is
/// attached before the first poll, so even a value delivered synchronously on
/// that poll observes it.
pub fn run_with_context<T>(value: T, cx: Context) -> Propagated<T> {
    Propagated {
        inner: value,
        cx: Some(cx),
    }
}

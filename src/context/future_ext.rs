use crate::Context;
use futures_core::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::Context as TaskContext;
use std::task::Poll;

pin_project! {
    /// A future or stream that has an associated context.
    ///
    /// The associated context is attached as current for the duration of
    /// every poll, and detached before control returns to the executor, so
    /// the wrapped value observes the same current context no matter which
    /// thread resumes it.
    #[derive(Clone, Debug)]
    pub struct WithContext<T> {
        #[pin]
        inner: T,
        cx: Context,
    }
}

impl<T: std::future::Future> std::future::Future for WithContext<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.cx.clone().attach();

        this.inner.poll(task_cx)
    }
}

impl<T: Stream> Stream for WithContext<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let _guard = this.cx.clone().attach();

        this.inner.poll_next(task_cx)
    }
}

// The two extension traits are almost identical, but need to be separate to
// avoid overlapping implementation errors.

impl<F: std::future::Future> FutureContextExt for F {}
/// Extension trait allowing futures to carry a context across thread hops.
pub trait FutureContextExt: Sized {
    /// Attaches the provided [`Context`] to this future, returning a
    /// [`WithContext`] wrapper.
    ///
    /// The attached context will be set as current while this future is
    /// being polled.
    fn with_context(self, cx: Context) -> WithContext<Self> {
        WithContext { inner: self, cx }
    }

    /// Attaches the current [`Context`] to this future, returning a
    /// [`WithContext`] wrapper.
    fn with_current_context(self) -> WithContext<Self> {
        self.with_context(Context::current())
    }
}

impl<S: Stream> StreamContextExt for S {}
/// Extension trait allowing streams to carry a context across thread hops.
pub trait StreamContextExt: Sized {
    /// Attaches the provided [`Context`] to this stream, returning a
    /// [`WithContext`] wrapper.
    ///
    /// The attached context will be set as current while this stream is
    /// being polled.
    fn with_context(self, cx: Context) -> WithContext<Self> {
        WithContext { inner: self, cx }
    }

    /// Attaches the current [`Context`] to this stream, returning a
    /// [`WithContext`] wrapper.
    fn with_current_context(self) -> WithContext<Self> {
        self.with_context(Context::current())
    }
}

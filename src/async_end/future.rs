use super::{AsyncOperationEndStrategy, AsyncResponse, AsyncValue, FutureShape, OperationEnder};
use crate::OperationError;
use futures_util::task::noop_waker;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context as TaskContext, Poll};

/// Strategy for the single-value [`FutureShape`].
///
/// An already-resolved future is detected with a single speculative poll and
/// ended synchronously, inside the `async_end` call, so no callback is
/// scheduled and test ordering stays deterministic. A pending future is
/// wrapped so the operation ends exactly once when it resolves — with the
/// resolved value, the eventual error, or [`OperationError::Cancelled`] if
/// the wrapper is dropped first.
#[derive(Clone, Copy, Debug, Default)]
pub struct FutureEndStrategy;

impl AsyncOperationEndStrategy for FutureEndStrategy {
    fn supports(&self, value: &AsyncValue) -> bool {
        value.as_ref().is::<FutureShape>()
    }

    fn end(&self, ender: OperationEnder, value: AsyncValue) -> AsyncValue {
        let mut fut = match value.downcast::<FutureShape>() {
            Ok(fut) => *fut,
            // supports() was checked by the caller; treat a mismatch as the
            // synchronous fallback.
            Err(value) => {
                ender.end(None, None);
                return value;
            }
        };

        // Already-resolved fast path. A future that is polled here and found
        // pending re-registers its waker on the next real poll.
        let waker = noop_waker();
        let mut task_cx = TaskContext::from_waker(&waker);
        match fut.as_mut().poll(&mut task_cx) {
            Poll::Ready(result) => {
                ender.end_with_result(&result);
                let done: FutureShape = Box::pin(std::future::ready(result));
                Box::new(done)
            }
            Poll::Pending => {
                let wrapped: FutureShape = Box::pin(EndOnReady {
                    inner: fut,
                    ender: Some(ender),
                });
                Box::new(wrapped)
            }
        }
    }
}

// Ends the operation on the first Ready. Dropping this future drops the
// unfired ender, which ends the operation as cancelled.
struct EndOnReady {
    inner: FutureShape,
    ender: Option<OperationEnder>,
}

impl Future for EndOnReady {
    type Output = Result<AsyncResponse, OperationError>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = ready!(this.inner.as_mut().poll(task_cx));
        if let Some(ender) = this.ender.take() {
            ender.end_with_result(&result);
        }
        Poll::Ready(result)
    }
}

use super::{AsyncOperationEndStrategy, AsyncResponse, AsyncValue, OperationEnder, StreamShape};
use crate::OperationError;
use futures_core::Stream;
use std::pin::Pin;
use std::task::{ready, Context as TaskContext, Poll};

/// Strategy for the multi-value [`StreamShape`].
///
/// Items flow through untouched; the first terminal signal ends the
/// operation — exhaustion ends it ok, an error item ends it with that error,
/// and dropping the wrapper before a terminal signal ends it as
/// [`OperationError::Cancelled`]. A stream that misbehaves after its terminal
/// signal cannot end the operation again.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamEndStrategy;

impl AsyncOperationEndStrategy for StreamEndStrategy {
    fn supports(&self, value: &AsyncValue) -> bool {
        value.as_ref().is::<StreamShape>()
    }

    fn end(&self, ender: OperationEnder, value: AsyncValue) -> AsyncValue {
        match value.downcast::<StreamShape>() {
            Ok(stream) => {
                let wrapped: StreamShape = Box::pin(EndOnTerminal {
                    inner: *stream,
                    ender: Some(ender),
                });
                Box::new(wrapped)
            }
            // supports() was checked by the caller; treat a mismatch as the
            // synchronous fallback.
            Err(value) => {
                ender.end(None, None);
                value
            }
        }
    }
}

struct EndOnTerminal {
    inner: StreamShape,
    ender: Option<OperationEnder>,
}

impl Stream for EndOnTerminal {
    type Item = Result<AsyncResponse, OperationError>;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match ready!(this.inner.as_mut().poll_next(task_cx)) {
            Some(Ok(item)) => Poll::Ready(Some(Ok(item))),
            Some(Err(error)) => {
                if let Some(ender) = this.ender.take() {
                    ender.end(None, Some(error.clone()));
                }
                Poll::Ready(Some(Err(error)))
            }
            None => {
                if let Some(ender) = this.ender.take() {
                    ender.end(None, None);
                }
                Poll::Ready(None)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

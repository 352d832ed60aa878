use super::{AsyncEndStrategyRegistry, AsyncResponse, AsyncValue};
use crate::{Context, Instrumenter, OperationError};
use std::fmt;
use std::sync::Arc;

/// Wraps an [`Instrumenter`] so that operation ends can be deferred until a
/// possibly-asynchronous result really completes.
pub struct AsyncOperationEndSupport<Req, Res> {
    instrumenter: Arc<Instrumenter<Req, Res>>,
    registry: Arc<AsyncEndStrategyRegistry>,
}

impl<Req, Res> AsyncOperationEndSupport<Req, Res>
where
    Req: Send + Sync + 'static,
    Res: Send + Sync + 'static,
{
    /// Creates end support resolving strategies from `registry`.
    pub fn new(
        instrumenter: Arc<Instrumenter<Req, Res>>,
        registry: Arc<AsyncEndStrategyRegistry>,
    ) -> Self {
        AsyncOperationEndSupport {
            instrumenter,
            registry,
        }
    }

    /// The wrapped instrumenter, for the synchronous parts of the protocol
    /// (`should_start`/`start`).
    pub fn instrumenter(&self) -> &Arc<Instrumenter<Req, Res>> {
        &self.instrumenter
    }

    /// Ends the operation in `cx`, now or when `value` completes.
    ///
    /// The returned value must be handed back to the instrumented call site
    /// in place of `value`; it behaves identically.
    ///
    /// - `error` set means the call itself failed before producing an
    ///   asynchronous handle: the operation ends synchronously with that
    ///   error, and `value` is returned untouched.
    /// - Otherwise the first registered strategy recognizing `value`'s shape
    ///   defers the end until real completion (an already-completed handle is
    ///   detected by the shipped strategies and ended synchronously).
    /// - With no value or no matching strategy, the operation ends
    ///   synchronously, extracting a response from `value` if it happens to
    ///   be an unwrapped `Res`.
    pub fn async_end(
        &self,
        cx: Context,
        request: Req,
        value: Option<AsyncValue>,
        error: Option<OperationError>,
    ) -> Option<AsyncValue> {
        if let Some(err) = error {
            self.instrumenter.end(&cx, &request, None, Some(&err));
            return value;
        }

        let Some(value) = value else {
            self.instrumenter.end(&cx, &request, None, None);
            return None;
        };

        if let Some(strategy) = self.registry.resolve(&value) {
            let ender = OperationEnder::new(self.instrumenter.clone(), cx, request);
            return Some(strategy.end(ender, value));
        }

        // Synchronous fallback: best-effort response extraction.
        let response = value.as_ref().downcast_ref::<Res>();
        self.instrumenter.end(&cx, &request, response, None);
        Some(value)
    }
}

impl<Req, Res> fmt::Debug for AsyncOperationEndSupport<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOperationEndSupport")
            .field("instrumenter", &self.instrumenter)
            .field("registry", &self.registry)
            .finish()
    }
}

type EndFn = Box<dyn FnOnce(Option<AsyncResponse>, Option<OperationError>) + Send>;

/// A single-shot completion callback handed to an
/// [`AsyncOperationEndStrategy`](super::AsyncOperationEndStrategy).
///
/// Firing it ends the operation it was created for, at most once. Dropping an
/// unfired ender ends the operation with [`OperationError::Cancelled`], so an
/// abandoned asynchronous handle can never leak an unterminated record.
pub struct OperationEnder {
    end: Option<EndFn>,
}

impl OperationEnder {
    pub(crate) fn new<Req, Res>(
        instrumenter: Arc<Instrumenter<Req, Res>>,
        cx: Context,
        request: Req,
    ) -> Self
    where
        Req: Send + Sync + 'static,
        Res: Send + Sync + 'static,
    {
        OperationEnder {
            end: Some(Box::new(move |response, error| {
                let response = response.as_ref().and_then(|r| r.downcast_ref::<Res>());
                instrumenter.end(&cx, &request, response, error.as_ref());
            })),
        }
    }

    /// Ends the operation with the resolved response or error. Later calls
    /// cannot exist (the ender is consumed), and the cancellation-on-drop
    /// path is disarmed.
    pub fn end(mut self, response: Option<AsyncResponse>, error: Option<OperationError>) {
        if let Some(end) = self.end.take() {
            end(response, error);
        }
    }

    /// Ends the operation from a resolved `Result`, sharing the response with
    /// the downstream consumer.
    pub fn end_with_result(self, result: &Result<AsyncResponse, OperationError>) {
        match result {
            Ok(response) => self.end(Some(response.clone()), None),
            Err(error) => self.end(None, Some(error.clone())),
        }
    }
}

impl Drop for OperationEnder {
    fn drop(&mut self) {
        // Dropped without firing: the underlying work was cancelled.
        if let Some(end) = self.end.take() {
            end(None, Some(OperationError::Cancelled));
        }
    }
}

impl fmt::Debug for OperationEnder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationEnder")
            .field("fired", &self.end.is_none())
            .finish()
    }
}

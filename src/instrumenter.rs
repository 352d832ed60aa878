//! The operation lifecycle engine.

use crate::extractor::{AttributesBuilder, AttributesExtractor, OperationNameExtractor};
use crate::operation::{report_protocol_misuse, OperationHandle};
use crate::{
    lift_debug, lift_warn, Context, OperationContextExt, OperationError, OperationKind,
    OperationSink, OperationStatus,
};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Decides whether a traced operation is recorded, starts it, and ends it.
///
/// One instrumenter is built per instrumented library and request/response
/// pair. Call sites drive it with the three-step protocol:
///
/// 1. [`should_start`] — a pure predicate; when it returns `false` nothing
///    else may be called and no side effects occur.
/// 2. [`start`] — creates the operation record, runs every extractor's
///    start hook in registration order, and returns the parent context with
///    the new operation installed.
/// 3. [`end`] — runs the end hooks, sets the terminal status (error iff an
///    error was supplied), and finalizes the record exactly once.
///
/// [`should_start`]: Instrumenter::should_start
/// [`start`]: Instrumenter::start
/// [`end`]: Instrumenter::end
pub struct Instrumenter<Req, Res> {
    scope_name: Cow<'static, str>,
    kind: OperationKind,
    name_extractor: Box<dyn OperationNameExtractor<Req>>,
    extractors: Vec<Box<dyn AttributesExtractor<Req, Res>>>,
    sink: Arc<dyn OperationSink>,
    enabled: bool,
}

impl<Req, Res> Instrumenter<Req, Res> {
    /// Starts building an instrumenter that submits completed records to
    /// `sink`, identified by `scope_name` (the name of the instrumented
    /// library, not of individual operations).
    pub fn builder(
        sink: Arc<dyn OperationSink>,
        scope_name: impl Into<Cow<'static, str>>,
        name_extractor: impl OperationNameExtractor<Req> + 'static,
    ) -> InstrumenterBuilder<Req, Res> {
        InstrumenterBuilder {
            scope_name: scope_name.into(),
            kind: OperationKind::Internal,
            name_extractor: Box::new(name_extractor),
            extractors: Vec::new(),
            sink,
            enabled: true,
        }
    }

    /// Returns the instrumented library name this instrumenter was built for.
    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    /// Determines whether an operation should be recorded for this request.
    ///
    /// Pure: no record is created and no extractor runs when this returns
    /// `false`. Recording is declined when the instrumenter is disabled, when
    /// `parent` suppresses telemetry, or when `parent` already carries a live
    /// operation of the same suppressable kind (a nested duplicate).
    pub fn should_start(&self, parent: &Context, _request: &Req) -> bool {
        if !self.enabled || parent.is_telemetry_suppressed() {
            return false;
        }
        if self.kind.suppresses_nested_of_same_kind() {
            if let Some(active) = parent.operation() {
                if active.kind() == self.kind && !active.is_ended() {
                    lift_debug!(
                        name: "Instrumenter.SuppressedNestedDuplicate",
                        kind = self.kind.as_str()
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Starts a new operation and returns `parent` with it installed as the
    /// active operation.
    ///
    /// Callers must have checked [`should_start`](Instrumenter::should_start)
    /// first.
    pub fn start(&self, parent: &Context, request: &Req) -> Context {
        self.start_at(parent, request, SystemTime::now())
    }

    /// [`start`](Instrumenter::start) with an explicit start timestamp.
    pub fn start_at(&self, parent: &Context, request: &Req, start_time: SystemTime) -> Context {
        let mut attributes = AttributesBuilder::default();
        for extractor in &self.extractors {
            let checkpoint = attributes.len();
            if let Err(err) = extractor.on_start(&mut attributes, parent, request) {
                attributes.truncate(checkpoint);
                lift_warn!(
                    name: "Instrumenter.ExtractorFailed",
                    hook = "on_start",
                    error = err.to_string()
                );
            }
        }

        let handle = Arc::new(OperationHandle::new(
            self.name_extractor.extract(request),
            self.kind,
            parent.operation().map(|active| active.id()),
            start_time,
            attributes.into_inner(),
            self.sink.clone(),
        ));
        parent.with_operation(handle)
    }

    /// Ends the operation carried by `cx`, exactly once.
    ///
    /// The terminal status is `Error` iff `error` is supplied, otherwise
    /// `Ok`. Ending a context with no active operation, or ending the same
    /// operation twice, is a protocol misuse: surfaced loudly in debug/test
    /// builds and degraded to a logged no-op otherwise.
    pub fn end(
        &self,
        cx: &Context,
        request: &Req,
        response: Option<&Res>,
        error: Option<&OperationError>,
    ) {
        self.end_at(cx, request, response, error, SystemTime::now())
    }

    /// [`end`](Instrumenter::end) with an explicit end timestamp.
    pub fn end_at(
        &self,
        cx: &Context,
        request: &Req,
        response: Option<&Res>,
        error: Option<&OperationError>,
        end_time: SystemTime,
    ) {
        let Some(handle) = cx.operation() else {
            report_protocol_misuse("end called on a context with no active operation");
            return;
        };

        let mut attributes = AttributesBuilder::default();
        for extractor in &self.extractors {
            let checkpoint = attributes.len();
            if let Err(err) = extractor.on_end(&mut attributes, cx, request, response, error) {
                attributes.truncate(checkpoint);
                lift_warn!(
                    name: "Instrumenter.ExtractorFailed",
                    hook = "on_end",
                    error = err.to_string()
                );
            }
        }

        let status = match error {
            Some(err) => {
                attributes.set("error.type", error_type(err));
                OperationStatus::Error {
                    description: Cow::Owned(err.to_string()),
                }
            }
            None => OperationStatus::Ok,
        };

        if !handle.end(end_time, attributes.into_inner(), status) {
            report_protocol_misuse("operation ended twice");
        }
    }

    /// Records an operation that is already complete: start and end with
    /// explicit timestamps in one call. Returns the context the operation was
    /// (briefly) active in.
    pub fn start_and_end(
        &self,
        parent: &Context,
        request: &Req,
        response: Option<&Res>,
        error: Option<&OperationError>,
        start_time: SystemTime,
        end_time: SystemTime,
    ) -> Context {
        let cx = self.start_at(parent, request, start_time);
        self.end_at(&cx, request, response, error, end_time);
        cx
    }
}

impl<Req, Res> fmt::Debug for Instrumenter<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumenter")
            .field("scope_name", &self.scope_name)
            .field("kind", &self.kind)
            .field("extractors", &self.extractors.len())
            .field("enabled", &self.enabled)
            .finish()
    }
}

fn error_type(error: &OperationError) -> &'static str {
    match error {
        OperationError::Cancelled => "cancelled",
        OperationError::Message(_) => "message",
        OperationError::Failure(_) => "failure",
    }
}

/// Configures and builds an [`Instrumenter`].
pub struct InstrumenterBuilder<Req, Res> {
    scope_name: Cow<'static, str>,
    kind: OperationKind,
    name_extractor: Box<dyn OperationNameExtractor<Req>>,
    extractors: Vec<Box<dyn AttributesExtractor<Req, Res>>>,
    sink: Arc<dyn OperationSink>,
    enabled: bool,
}

impl<Req, Res> InstrumenterBuilder<Req, Res> {
    /// Sets the kind recorded on every operation (default
    /// [`OperationKind::Internal`]).
    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = kind;
        self
    }

    /// Adds an attributes extractor. Extractors run in the order they were
    /// added, at both lifecycle points.
    pub fn with_extractor(mut self, extractor: impl AttributesExtractor<Req, Res> + 'static) -> Self {
        self.extractors.push(Box::new(extractor));
        self
    }

    /// Enables or disables the instrumenter. A disabled instrumenter declines
    /// every [`Instrumenter::should_start`].
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Builds the instrumenter.
    pub fn build(self) -> Instrumenter<Req, Res> {
        Instrumenter {
            scope_name: self.scope_name,
            kind: self.kind,
            name_extractor: self.name_extractor,
            extractors: self.extractors,
            sink: self.sink,
            enabled: self.enabled,
        }
    }
}

impl<Req, Res> fmt::Debug for InstrumenterBuilder<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumenterBuilder")
            .field("scope_name", &self.scope_name)
            .field("kind", &self.kind)
            .finish()
    }
}

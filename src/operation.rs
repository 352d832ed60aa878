//! Operation records and their lifecycle state.
//!
//! An operation is one traced unit of work. It moves through exactly one
//! `created → started → ended` pass: the [`Instrumenter`] creates an
//! [`OperationHandle`] at start, attributes accumulate while the handle is
//! live, and ending the handle finalizes an immutable [`OperationRecord`]
//! which is delivered to an [`OperationSink`]. Ending twice is a protocol
//! misuse: it is reported through internal diagnostics (loudly in test
//! builds) and degrades to a no-op so instrumentation can never corrupt the
//! host application.
//!
//! [`Instrumenter`]: crate::Instrumenter

use crate::{lift_warn, Context, KeyValue};
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use thiserror::Error;

// Process-unique operation ids, used to link child records to their parents.
static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// The kind of a traced operation, used for propagation-direction decisions
/// such as nested-duplicate suppression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    /// An operation internal to the application.
    Internal,
    /// An outbound request to a remote service.
    Client,
    /// Handling of an inbound request.
    Server,
    /// Publishing a message.
    Producer,
    /// Receiving or processing a message.
    Consumer,
}

impl OperationKind {
    /// Returns the lowercase name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Internal => "internal",
            OperationKind::Client => "client",
            OperationKind::Server => "server",
            OperationKind::Producer => "producer",
            OperationKind::Consumer => "consumer",
        }
    }

    // Internal operations nest arbitrarily; the remaining kinds describe a
    // single logical boundary crossing, so a nested duplicate of the same
    // kind is suppressed.
    pub(crate) fn suppresses_nested_of_same_kind(&self) -> bool {
        !matches!(self, OperationKind::Internal)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The terminal status of a completed operation.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum OperationStatus {
    /// No status was determined.
    #[default]
    Unset,
    /// The operation completed successfully.
    Ok,
    /// The operation failed.
    Error {
        /// Human-readable failure detail.
        description: Cow<'static, str>,
    },
}

/// The error associated with a failed operation.
///
/// Values are cheaply cloneable so the same error can both end the operation
/// record and continue flowing to the instrumented application.
#[derive(Clone, Debug, Error)]
pub enum OperationError {
    /// The underlying work was cancelled before it completed.
    #[error("operation was cancelled before completion")]
    Cancelled,
    /// A failure described only by a message.
    #[error("{0}")]
    Message(Cow<'static, str>),
    /// A failure carrying the source error.
    #[error(transparent)]
    Failure(Arc<dyn Error + Send + Sync>),
}

impl OperationError {
    /// Wraps a source error.
    pub fn failure(err: impl Error + Send + Sync + 'static) -> Self {
        OperationError::Failure(Arc::new(err))
    }

    /// Creates an error from a message.
    pub fn message(msg: impl Into<Cow<'static, str>>) -> Self {
        OperationError::Message(msg.into())
    }
}

/// A completed, immutable record of one traced operation, ready for export.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct OperationRecord {
    /// Process-unique id of this operation.
    pub id: u64,
    /// Id of the operation that was active in the parent context at start,
    /// if any.
    pub parent_id: Option<u64>,
    /// The operation name.
    pub name: Cow<'static, str>,
    /// The operation kind.
    pub kind: OperationKind,
    /// When the operation started.
    pub start_time: SystemTime,
    /// When the operation ended.
    pub end_time: SystemTime,
    /// Attributes captured at start and end, in extraction order.
    pub attributes: Vec<KeyValue>,
    /// The terminal status.
    pub status: OperationStatus,
}

/// Receives completed [`OperationRecord`]s.
///
/// Transport and serialization of records are outside the engine; a sink is
/// the seam where they leave it.
pub trait OperationSink: Send + Sync {
    /// Accepts one completed record.
    fn submit(&self, record: OperationRecord);
}

/// A sink that discards every record.
#[derive(Clone, Debug, Default)]
pub struct NoopSink;

impl OperationSink for NoopSink {
    fn submit(&self, _record: OperationRecord) {}
}

// Mutable-until-ended state of a live operation.
struct ActiveData {
    name: Cow<'static, str>,
    start_time: SystemTime,
    attributes: Vec<KeyValue>,
}

/// A started, not yet ended operation.
///
/// The handle is stored in the [`Context`] returned by
/// [`Instrumenter::start`] and shared across threads; the first `end` wins
/// and later attempts are detected as misuse.
///
/// [`Instrumenter::start`]: crate::Instrumenter::start
pub struct OperationHandle {
    id: u64,
    parent_id: Option<u64>,
    kind: OperationKind,
    state: Mutex<Option<ActiveData>>,
    sink: Arc<dyn OperationSink>,
}

impl OperationHandle {
    pub(crate) fn new(
        name: Cow<'static, str>,
        kind: OperationKind,
        parent_id: Option<u64>,
        start_time: SystemTime,
        attributes: Vec<KeyValue>,
        sink: Arc<dyn OperationSink>,
    ) -> Self {
        OperationHandle {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            parent_id,
            kind,
            state: Mutex::new(Some(ActiveData {
                name,
                start_time,
                attributes,
            })),
            sink,
        }
    }

    /// Returns the process-unique id of this operation.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the kind this operation was started with.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Returns `true` once the operation has been ended.
    pub fn is_ended(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }

    // Finalizes the record exactly once. Returns false on a second end, which
    // the caller reports as protocol misuse.
    pub(crate) fn end(
        &self,
        end_time: SystemTime,
        end_attributes: Vec<KeyValue>,
        status: OperationStatus,
    ) -> bool {
        let taken = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.take()
        };
        let Some(data) = taken else {
            return false;
        };

        let mut attributes = data.attributes;
        attributes.extend(end_attributes);
        self.sink.submit(OperationRecord {
            id: self.id,
            parent_id: self.parent_id,
            name: data.name,
            kind: self.kind,
            start_time: data.start_time,
            end_time,
            attributes,
            status,
        });
        true
    }
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Methods for storing and retrieving the active operation in a [`Context`].
pub trait OperationContextExt {
    /// Returns a copy of this context with the given operation installed as
    /// the active one.
    fn with_operation(&self, handle: Arc<OperationHandle>) -> Context;

    /// Returns the active operation, if any.
    fn operation(&self) -> Option<&Arc<OperationHandle>>;

    /// Returns whether an active operation has been set.
    fn has_active_operation(&self) -> bool;
}

impl OperationContextExt for Context {
    fn with_operation(&self, handle: Arc<OperationHandle>) -> Context {
        self.with_operation_handle(handle)
    }

    fn operation(&self) -> Option<&Arc<OperationHandle>> {
        self.operation.as_ref()
    }

    fn has_active_operation(&self) -> bool {
        self.operation.is_some()
    }
}

// Reports a lifecycle protocol misuse: loud in debug/test builds, log-and-
// degrade in release builds. Never propagates into application control flow.
pub(crate) fn report_protocol_misuse(what: &'static str) {
    lift_warn!(name: "Operation.ProtocolMisuse", what = what);
    debug_assert!(false, "operation lifecycle protocol misuse: {what}");
}

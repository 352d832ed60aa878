//! Operation lifecycle tracking and context propagation for library
//! instrumentation.
//!
//! `tracelift` is the engine that sits between "a hook fired at a call site"
//! and "a completed telemetry record": it decides whether a traced operation
//! should be recorded, opens it, and guarantees it is closed exactly once —
//! even when the instrumented call returns a future or a multi-stage stream
//! that completes on another thread.
//!
//! # Components
//!
//! - **[`Context`]**: an immutable, execution-scoped collection of values,
//!   one of which is the currently active [`OperationHandle`]. Contexts are
//!   derived, never mutated, and installed as "current" for a scope via
//!   [`Context::attach`].
//! - **[`Instrumenter`]**: the lifecycle engine. [`should_start`] is a pure
//!   predicate; [`start`] creates an operation record and runs the registered
//!   [`AttributesExtractor`]s; [`end`] finalizes the record exactly once and
//!   submits it to an [`OperationSink`].
//! - **[`AsyncEndStrategyRegistry`]** and [`AsyncOperationEndSupport`]: when
//!   the instrumented call returns an asynchronous handle, the end decision
//!   is deferred to the first registered [`AsyncOperationEndStrategy`] that
//!   recognizes the handle's shape. No match means the operation ends
//!   synchronously.
//! - **[`reactive`]**: per-event context restoration for poll-based
//!   pipelines, so operations started inside a stream callback are parented
//!   by the context that was current when the pipeline was materialized,
//!   regardless of which scheduler thread delivers the event.
//!
//! # Example
//!
//! ```
//! use std::borrow::Cow;
//! use std::sync::Arc;
//! use tracelift::testing::InMemorySink;
//! use tracelift::{Context, Instrumenter, OperationKind, OperationStatus};
//!
//! let sink = Arc::new(InMemorySink::new());
//! let instrumenter: Instrumenter<&str, &str> =
//!     Instrumenter::builder(sink.clone(), "example", |req: &&str| {
//!         Cow::Owned(format!("GET {req}"))
//!     })
//!     .with_kind(OperationKind::Client)
//!     .build();
//!
//! let parent = Context::current();
//! let request = "/users";
//! if instrumenter.should_start(&parent, &request) {
//!     let cx = instrumenter.start(&parent, &request);
//!     // ... the traced work happens here ...
//!     instrumenter.end(&cx, &request, Some(&"200"), None);
//! }
//!
//! let records = sink.finished_records();
//! assert_eq!(records.len(), 1);
//! assert_eq!(records[0].status, OperationStatus::Ok);
//! ```
//!
//! [`should_start`]: Instrumenter::should_start
//! [`start`]: Instrumenter::start
//! [`end`]: Instrumenter::end
//! [`AttributesExtractor`]: extractor::AttributesExtractor
//! [`AsyncOperationEndStrategy`]: async_end::AsyncOperationEndStrategy
//! [`AsyncEndStrategyRegistry`]: async_end::AsyncEndStrategyRegistry
//! [`AsyncOperationEndSupport`]: async_end::AsyncOperationEndSupport

#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod macros;

mod common;
pub use common::{Key, KeyValue, Value};

mod context;
pub use context::{Context, ContextGuard, FutureContextExt, StreamContextExt, WithContext};

pub mod operation;
pub use operation::{
    OperationContextExt, OperationError, OperationHandle, OperationKind, OperationRecord,
    OperationSink, OperationStatus,
};

pub mod extractor;
pub use extractor::{AttributesBuilder, AttributesExtractor, OperationNameExtractor};

mod instrumenter;
pub use instrumenter::{Instrumenter, InstrumenterBuilder};

pub mod async_end;
pub use async_end::{
    AsyncEndStrategyRegistry, AsyncOperationEndStrategy, AsyncOperationEndSupport, AsyncResponse,
    AsyncValue, OperationEnder,
};

pub mod reactive;

pub mod testing;

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, error, warn};
}

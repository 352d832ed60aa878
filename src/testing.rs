//! In-memory helpers for testing instrumentations.

use crate::{OperationRecord, OperationSink};
use std::sync::{Arc, Mutex};

/// An [`OperationSink`] that stores completed records in memory.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tracelift::extractor::ConstantName;
/// use tracelift::testing::InMemorySink;
/// use tracelift::{Context, Instrumenter};
///
/// let sink = Arc::new(InMemorySink::new());
/// let instrumenter: Instrumenter<(), ()> =
///     Instrumenter::builder(sink.clone(), "test", ConstantName("work")).build();
///
/// let cx = instrumenter.start(&Context::current(), &());
/// instrumenter.end(&cx, &(), None, None);
///
/// assert_eq!(sink.finished_records().len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySink {
    records: Arc<Mutex<Vec<OperationRecord>>>,
}

impl InMemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every record submitted so far.
    pub fn finished_records(&self) -> Vec<OperationRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Clears the captured records.
    pub fn reset(&self) {
        match self.records.lock() {
            Ok(mut records) => records.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl OperationSink for InMemorySink {
    fn submit(&self, record: OperationRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

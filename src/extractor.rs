//! Contracts for pure, domain-specific data extraction.
//!
//! Extractors read protocol-specific request/response objects and produce
//! attributes on the operation record. They are stateless and are invoked by
//! the [`Instrumenter`] at the two lifecycle points: `on_start` may read the
//! request only, `on_end` sees the request plus the optional response or
//! error. Extractors run in registration order and share one
//! [`AttributesBuilder`], so later extractors observe attributes written by
//! earlier ones.
//!
//! An extractor failure never aborts the lifecycle: the error is logged, the
//! affected attributes are omitted, and the remaining extractors still run.
//!
//! [`Instrumenter`]: crate::Instrumenter

use crate::{Context, Key, KeyValue, OperationError, Value};
use std::borrow::Cow;
use thiserror::Error;

/// An error produced by an [`AttributesExtractor`] hook.
#[derive(Debug, Error)]
#[error("attribute extraction failed: {message}")]
pub struct ExtractError {
    message: Cow<'static, str>,
}

impl ExtractError {
    /// Creates a new extraction error from a message.
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        ExtractError {
            message: message.into(),
        }
    }
}

/// Accumulates attributes for one lifecycle point.
#[derive(Debug, Default)]
pub struct AttributesBuilder {
    entries: Vec<KeyValue>,
}

impl AttributesBuilder {
    /// Appends an attribute.
    pub fn push(&mut self, kv: KeyValue) {
        self.entries.push(kv);
    }

    /// Appends an attribute from a key and value.
    pub fn set(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        self.entries.push(KeyValue::new(key, value));
    }

    /// Returns the last value written for `key`, if any. Later extractors use
    /// this to build on attributes written by earlier ones.
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries
            .iter()
            .rev()
            .find(|kv| &kv.key == key)
            .map(|kv| &kv.value)
    }

    /// Number of attributes written so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no attributes were written.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_inner(self) -> Vec<KeyValue> {
        self.entries
    }

    // Rolls back to a prior length, discarding a failed extractor's partial
    // writes so the affected attributes are omitted as a unit.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }
}

/// Extracts attributes from domain-specific request and response objects.
///
/// Both hooks default to no-ops so extractors only implement the points they
/// care about.
pub trait AttributesExtractor<Req, Res>: Send + Sync {
    /// Called when the operation starts. Must not read the response (none
    /// exists yet).
    fn on_start(
        &self,
        attributes: &mut AttributesBuilder,
        parent: &Context,
        request: &Req,
    ) -> Result<(), ExtractError> {
        let _ = (attributes, parent, request);
        Ok(())
    }

    /// Called when the operation ends. `response` and `error` are mutually
    /// informative: `error` is set only on failure paths.
    fn on_end(
        &self,
        attributes: &mut AttributesBuilder,
        cx: &Context,
        request: &Req,
        response: Option<&Res>,
        error: Option<&OperationError>,
    ) -> Result<(), ExtractError> {
        let _ = (attributes, cx, request, response, error);
        Ok(())
    }
}

/// Names the operation from its request.
pub trait OperationNameExtractor<Req>: Send + Sync {
    /// Computes the operation name for this request.
    fn extract(&self, request: &Req) -> Cow<'static, str>;
}

impl<Req, F> OperationNameExtractor<Req> for F
where
    F: Fn(&Req) -> Cow<'static, str> + Send + Sync,
{
    fn extract(&self, request: &Req) -> Cow<'static, str> {
        self(request)
    }
}

/// An [`OperationNameExtractor`] that always returns the same name.
#[derive(Clone, Debug)]
pub struct ConstantName(pub &'static str);

impl<Req> OperationNameExtractor<Req> for ConstantName {
    fn extract(&self, _request: &Req) -> Cow<'static, str> {
        Cow::Borrowed(self.0)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::context::{SpanContext, SpanId, TraceId};
use super::tracer::Tracer;

/// Final status of a closed span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
}

impl std::fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpanStatus::Ok => write!(f, "ok"),
            SpanStatus::Error => write!(f, "error"),
        }
    }
}

/// A closed, immutable record of one traced operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSpan {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub operation: String,
    pub start: DateTime<Utc>,
    pub duration: Duration,
    pub status: SpanStatus,
    pub attributes: BTreeMap<String, String>,
}

impl TraceSpan {
    pub fn context(&self, flags: u8) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id,
            span_id: self.span_id,
            flags,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }
}

/// An open span. Close it with `end` (or `Tracer::end_span`).
///
/// A handle dropped without being closed is still recorded, with an error
/// status and an `abandoned` attribute, so aborted work stays visible.
pub struct SpanHandle {
    pub(super) context: SpanContext,
    pub(super) parent_span_id: Option<SpanId>,
    pub(super) operation: String,
    pub(super) start: DateTime<Utc>,
    pub(super) started: Instant,
    pub(super) attributes: BTreeMap<String, String>,
    pub(super) tracer: Tracer,
    pub(super) closed: bool,
}

impl SpanHandle {
    pub fn context(&self) -> SpanContext {
        self.context
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl ToString) {
        self.attributes.insert(key.into(), value.to_string());
    }

    /// Open a child span of this one on the same tracer.
    pub fn child(&self, operation: &str) -> SpanHandle {
        self.tracer.start_span(operation, Some(&self.context))
    }

    /// Close the span with the given status.
    pub fn end(self, status: SpanStatus) -> TraceSpan {
        let tracer = self.tracer.clone();
        tracer.end_span(self, status, BTreeMap::new())
    }

    pub(super) fn close(
        &mut self,
        status: SpanStatus,
        attributes: BTreeMap<String, String>,
    ) -> TraceSpan {
        self.closed = true;
        let mut merged = std::mem::take(&mut self.attributes);
        merged.extend(attributes);
        TraceSpan {
            trace_id: self.context.trace_id,
            span_id: self.context.span_id,
            parent_span_id: self.parent_span_id,
            operation: std::mem::take(&mut self.operation),
            start: self.start,
            duration: self.started.elapsed(),
            status,
            attributes: merged,
        }
    }
}

impl std::fmt::Debug for SpanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanHandle")
            .field("context", &self.context)
            .field("operation", &self.operation)
            .finish()
    }
}

impl Drop for SpanHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut attributes = BTreeMap::new();
        attributes.insert("abandoned".to_string(), "true".to_string());
        let span = self.close(SpanStatus::Error, attributes);
        self.tracer.record(span);
    }
}

//! Trace context propagation.
//!
//! Every coordination operation and workflow step runs inside a span. Spans
//! form a causal tree through their parent ids; the tree, not wall-clock
//! order, is what callers should rely on.

pub mod context;
pub mod span;
pub mod tracer;

pub use context::{SpanContext, SpanId, TraceId, FLAG_SAMPLED};
pub use span::{SpanHandle, SpanStatus, TraceSpan};
pub use tracer::{JsonlSink, MemorySink, SpanSink, Tracer};

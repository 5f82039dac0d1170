use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::context::{SpanContext, SpanId, TraceId, FLAG_SAMPLED};
use super::span::{SpanHandle, SpanStatus, TraceSpan};
use crate::error::Result;

/// Destination for closed spans.
pub trait SpanSink: Send + Sync {
    fn record(&self, span: &TraceSpan) -> Result<()>;
}

/// Keeps every span in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    spans: Mutex<Vec<TraceSpan>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<TraceSpan> {
        lock(&self.spans).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.spans).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spans with the given operation name, in close order.
    pub fn by_operation(&self, operation: &str) -> Vec<TraceSpan> {
        lock(&self.spans)
            .iter()
            .filter(|s| s.operation == operation)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.spans).clear();
    }
}

impl SpanSink for MemorySink {
    fn record(&self, span: &TraceSpan) -> Result<()> {
        lock(&self.spans).push(span.clone());
        Ok(())
    }
}

/// Append-only JSON Lines span log.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every span in a log, skipping lines that fail to parse.
    pub fn read_all(path: &Path) -> Result<Vec<TraceSpan>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut spans = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(span) => spans.push(span),
                Err(e) => warn!(error = %e, path = %path.display(), "skipping corrupt span line"),
            }
        }
        Ok(spans)
    }
}

impl SpanSink for JsonlSink {
    fn record(&self, span: &TraceSpan) -> Result<()> {
        let mut line = serde_json::to_string(span)?;
        line.push('\n');
        let mut file = lock(&self.file);
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[derive(Default)]
struct TracerInner {
    sinks: Mutex<Vec<Arc<dyn SpanSink>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TraceSpan>>>,
    /// Start times of spans that are still open, for clamping children.
    open: Mutex<HashMap<SpanId, DateTime<Utc>>>,
}

/// Creates spans, threads context through them, and fans closed spans out
/// to sinks and subscribers.
///
/// Cheap to clone; all clones share sinks and subscribers.
///
/// # Example
///
/// ```
/// use hive::telemetry::{SpanStatus, Tracer};
///
/// let tracer = Tracer::new();
/// let root = tracer.start_span("workflow.run", None);
/// let child = tracer.start_span("workflow.step", Some(&root.context()));
/// let step = child.end(SpanStatus::Ok);
/// let run = root.end(SpanStatus::Ok);
/// assert_eq!(step.parent_span_id, Some(run.span_id));
/// assert!(step.start >= run.start);
/// ```
#[derive(Clone, Default)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(self, sink: Arc<dyn SpanSink>) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn add_sink(&self, sink: Arc<dyn SpanSink>) {
        lock(&self.inner.sinks).push(sink);
    }

    /// Receive every span closed from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TraceSpan> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    /// Open a span. Without a parent a new trace is started.
    ///
    /// The start timestamp of a child is never earlier than the start of a
    /// locally open parent, even if the wall clock stepped backwards.
    pub fn start_span(&self, operation: &str, parent: Option<&SpanContext>) -> SpanHandle {
        let span_id = SpanId::random();
        let (trace_id, flags, parent_span_id) = match parent {
            Some(p) => (p.trace_id, p.flags, Some(p.span_id)),
            None => (TraceId::random(), FLAG_SAMPLED, None),
        };

        let mut start = Utc::now();
        {
            let mut open = lock(&self.inner.open);
            if let Some(parent_start) = parent_span_id.and_then(|id| open.get(&id)) {
                start = start.max(*parent_start);
            }
            open.insert(span_id, start);
        }

        SpanHandle {
            context: SpanContext {
                trace_id,
                span_id,
                flags,
            },
            parent_span_id,
            operation: operation.to_string(),
            start,
            started: Instant::now(),
            attributes: BTreeMap::new(),
            tracer: self.clone(),
            closed: false,
        }
    }

    /// Close a span, merging `attributes` into those already set.
    pub fn end_span(
        &self,
        mut handle: SpanHandle,
        status: SpanStatus,
        attributes: BTreeMap<String, String>,
    ) -> TraceSpan {
        let span = handle.close(status, attributes);
        self.record(span.clone());
        span
    }

    pub(super) fn record(&self, span: TraceSpan) {
        lock(&self.inner.open).remove(&span.span_id);

        debug!(
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            parent = ?span.parent_span_id.map(|p| p.to_string()),
            operation = %span.operation,
            status = %span.status,
            duration_us = span.duration.as_micros() as u64,
            "span closed"
        );

        let sinks = lock(&self.inner.sinks).clone();
        for sink in sinks {
            if let Err(e) = sink.record(&span) {
                warn!(error = %e, operation = %span.operation, "span sink rejected span");
            }
        }

        lock(&self.inner.subscribers).retain(|tx| tx.send(span.clone()).is_ok());
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("sinks", &lock(&self.inner.sinks).len())
            .field("open_spans", &lock(&self.inner.open).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

//! Span types for the interception engine.
//!
//! A [`Span`] is a timed unit of work with tags, metrics, and a parent link.
//! Spans are created on tracer-hook entry (or through the manual API),
//! mutated only by enrichment callbacks while open, and handed to a
//! [`SpanSink`] once closed. Tag and metric writes after close are no-ops.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::context::ContextId;

pub mod stack;

pub use stack::SpanStack;

/// Convert SystemTime to nanoseconds since Unix epoch.
pub(crate) fn system_time_to_nanos(time: &SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Serialize SystemTime as an RFC3339 string.
fn serialize_system_time<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use chrono::{DateTime, Utc};
    let datetime: DateTime<Utc> = (*time).into();
    serializer.serialize_str(&datetime.to_rfc3339())
}

// ============================================================================
// Identifiers
// ============================================================================

/// Unique span identifier. Displays as 16 hex characters (8 bytes), taken
/// from the random tail of a UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    pub(crate) fn generate() -> Self {
        let b = *Uuid::now_v7().as_bytes();
        SpanId(u64::from_be_bytes([
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        ]))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for SpanId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Cheap, copyable reference to an open span and the context that owns it.
/// Used by the manual span API and by deferred completion records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanHandle {
    pub(crate) span_id: SpanId,
    pub(crate) context_id: ContextId,
}

impl SpanHandle {
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }
}

// ============================================================================
// Span
// ============================================================================

/// Span kind, OTLP-style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    #[default]
    Internal,
    Client,
    Server,
    Producer,
    Consumer,
}

/// A timed unit of work.
///
/// Identity and timing fields are fixed at creation; `name`, `resource`,
/// `service` and `kind` may be rewritten by enrichment callbacks while the
/// span is open. Tags, metrics and the error flag go through guarded
/// setters that become no-ops once the span is closed.
#[derive(Debug, Clone, Serialize)]
pub struct Span {
    /// Unique span identifier.
    pub id: SpanId,

    /// Span active when this one was opened, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanId>,

    /// Operation name. Defaults to the callable identity for hook-opened
    /// spans (`Type.method` or the bare function name).
    pub name: String,

    /// What the operation acted on (query, URL, cache key pattern).
    pub resource: String,

    /// Logical service the span belongs to.
    pub service: String,

    pub kind: SpanKind,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    tags: HashMap<String, String>,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    metrics: HashMap<String, f64>,

    /// When the span was opened (human-readable).
    #[serde(serialize_with = "serialize_system_time")]
    pub started_at: SystemTime,

    /// Start time in nanoseconds since Unix epoch.
    pub start_time_unix_nano: u64,

    /// End time in nanoseconds since Unix epoch; set exactly once at close.
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time_unix_nano: Option<u64>,

    /// Whether the traced operation failed.
    error: bool,
}

impl Span {
    pub(crate) fn new(name: impl Into<String>, parent_id: Option<SpanId>) -> Self {
        let name = name.into();
        let now = SystemTime::now();
        Self {
            id: SpanId::generate(),
            parent_id,
            resource: name.clone(),
            name,
            service: String::new(),
            kind: SpanKind::default(),
            tags: HashMap::new(),
            metrics: HashMap::new(),
            started_at: now,
            start_time_unix_nano: system_time_to_nanos(&now),
            end_time_unix_nano: None,
            error: false,
        }
    }

    /// Set a tag. Ignored after the span is closed.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        self.tags.insert(key.into(), value.into());
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    /// Set a numeric metric. Ignored after the span is closed.
    pub fn set_metric(&mut self, key: impl Into<String>, value: f64) {
        if self.is_closed() {
            return;
        }
        self.metrics.insert(key.into(), value);
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }

    pub fn metrics(&self) -> &HashMap<String, f64> {
        &self.metrics
    }

    /// Flag the traced operation as failed. Ignored after close.
    pub fn set_error(&mut self, error: bool) {
        if self.is_closed() {
            return;
        }
        self.error = error;
    }

    pub fn error(&self) -> bool {
        self.error
    }

    pub fn is_closed(&self) -> bool {
        self.end_time_unix_nano.is_some()
    }

    pub fn end_time_unix_nano(&self) -> Option<u64> {
        self.end_time_unix_nano
    }

    pub fn duration_ns(&self) -> Option<u64> {
        self.end_time_unix_nano
            .map(|end| end.saturating_sub(self.start_time_unix_nano))
    }

    /// Mark the span closed. Idempotent; the first call wins.
    pub(crate) fn close(&mut self) {
        if self.end_time_unix_nano.is_none() {
            self.end_time_unix_nano = Some(system_time_to_nanos(&SystemTime::now()));
        }
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Consumer of closed spans. Export/serialization is a downstream
/// collaborator; the engine only hands finished spans across this seam.
pub trait SpanSink: Send + Sync {
    fn on_close(&self, span: Span);
}

/// Discards closed spans. The default sink.
#[derive(Debug, Default)]
pub struct NullSink;

impl SpanSink for NullSink {
    fn on_close(&self, _span: Span) {}
}

/// Buffers closed spans in memory, in close order. Used in tests and as a
/// debugging aid.
#[derive(Debug, Default)]
pub struct MemorySink {
    spans: Mutex<Vec<Span>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of closed spans captured so far.
    pub fn len(&self) -> usize {
        self.spans.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all captured spans, in close order.
    pub fn snapshot(&self) -> Vec<Span> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Drain all captured spans.
    pub fn take(&self) -> Vec<Span> {
        self.spans
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default()
    }
}

impl SpanSink for MemorySink {
    fn on_close(&self, span: Span) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.push(span);
        }
    }
}

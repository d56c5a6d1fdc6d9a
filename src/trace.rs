//! Trace context propagation
//!
//! A `(trace_id, span_id)` pair travels through every call boundary so a
//! single UI request can be correlated across the server, the orchestrator,
//! and the inference wire. Ids are W3C-sized (128-bit trace / 64-bit span,
//! lowercase hex) but ride on three custom keys rather than `traceparent`.

use rand::Rng;
use std::time::{Duration, Instant};

/// Header / wire-metadata key carrying the 128-bit trace id.
pub const TRACE_ID_KEY: &str = "x-trace-id";
/// Header / wire-metadata key carrying the 64-bit span id.
pub const SPAN_ID_KEY: &str = "x-span-id";
/// Header / wire-metadata key carrying the caller's span id.
pub const PARENT_SPAN_ID_KEY: &str = "x-parent-span-id";

/// Context correlating one causal chain of operations.
///
/// The trace id is immutable along the chain; every boundary crossing mints
/// a fresh span id whose parent is the caller's span id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Start a brand-new trace.
    pub fn new() -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            parent_span_id: None,
        }
    }

    /// Start a trace under an externally supplied trace id (e.g. the
    /// `trace_id` field of a WebSocket chat message). Invalid ids fall back
    /// to a fresh trace so a malformed client never breaks correlation.
    pub fn with_trace_id(trace_id: &str) -> Self {
        if !is_hex_id(trace_id, 32) {
            return Self::new();
        }
        Self {
            trace_id: trace_id.to_lowercase(),
            span_id: new_span_id(),
            parent_span_id: None,
        }
    }

    /// Extract from incoming header values, generating whatever is absent.
    ///
    /// A present span id becomes the parent of the new span; the trace id is
    /// adopted unchanged when well-formed.
    pub fn extract(trace_id: Option<&str>, span_id: Option<&str>) -> Self {
        let trace_id = match trace_id {
            Some(id) if is_hex_id(id, 32) => id.to_lowercase(),
            _ => new_trace_id(),
        };
        let parent_span_id = span_id
            .filter(|id| is_hex_id(id, 16))
            .map(|id| id.to_lowercase());
        Self {
            trace_id,
            span_id: new_span_id(),
            parent_span_id,
        }
    }

    /// Derive the context for one outgoing call: same trace, fresh span,
    /// this span as parent.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }

    /// Key/value pairs to inject into outgoing wire metadata.
    pub fn metadata(&self) -> Vec<(&'static str, String)> {
        let mut meta = vec![
            (TRACE_ID_KEY, self.trace_id.clone()),
            (SPAN_ID_KEY, self.span_id.clone()),
        ];
        if let Some(ref parent) = self.parent_span_id {
            meta.push((PARENT_SPAN_ID_KEY, parent.clone()));
        }
        meta
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A named timed operation inside a trace.
#[derive(Debug)]
pub struct Span {
    pub name: String,
    start: Instant,
    end: Option<Instant>,
    attrs: Vec<(String, String)>,
}

impl Span {
    pub fn begin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
            end: None,
            attrs: Vec::new(),
        }
    }

    pub fn attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attrs.push((key.into(), value.into()));
    }

    pub fn end(&mut self) {
        if self.end.is_none() {
            self.end = Some(Instant::now());
        }
    }

    /// Zero until `end()` has been called.
    pub fn duration(&self) -> Duration {
        match self.end {
            Some(end) => end.duration_since(self.start),
            None => Duration::ZERO,
        }
    }

    pub fn attrs(&self) -> &[(String, String)] {
        &self.attrs
    }
}

/// Ambient logger for a context: a `tracing` span decorated with the trace,
/// span, and parent-span ids. Enter it (or `instrument` a future with it)
/// and every log line inside carries the ids.
pub fn logger(ctx: &TraceContext) -> tracing::Span {
    tracing::info_span!(
        "trace",
        trace_id = %ctx.trace_id,
        span_id = %ctx.span_id,
        parent_span_id = ctx.parent_span_id.as_deref().unwrap_or(""),
    )
}

fn new_trace_id() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

fn new_span_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

fn is_hex_id(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit())
}

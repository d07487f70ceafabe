//! Per-request tracing with retained spans for analytics

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;
use uuid::Uuid;

/// Completed traces retained for analytics
const RETAINED_TRACES: usize = 500;

/// One timed stage inside a request
#[derive(Debug, Clone, Serialize)]
pub struct TraceSpan {
    pub name: String,
    pub offset_ms: f64,
    pub duration_ms: f64,
    pub status: String,
}

/// A request trace under construction
#[derive(Debug)]
pub struct RequestTrace {
    pub trace_id: String,
    pub method: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    started_wall: DateTime<Utc>,
    started: Instant,
    spans: Vec<TraceSpan>,
}

impl RequestTrace {
    pub fn new(method: impl Into<String>, user_id: Option<String>, tenant_id: Option<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            method: method.into(),
            user_id,
            tenant_id,
            started_wall: Utc::now(),
            started: Instant::now(),
            spans: Vec::new(),
        }
    }

    /// Start a child span; finish it with the returned guard
    pub fn start_span(&self, name: impl Into<String>) -> SpanGuard {
        SpanGuard {
            name: name.into(),
            offset_ms: self.started.elapsed().as_secs_f64() * 1000.0,
            started: Instant::now(),
        }
    }

    /// Attach a finished span
    pub fn finish_span(&mut self, guard: SpanGuard, status: &str) {
        self.spans.push(TraceSpan {
            name: guard.name,
            offset_ms: guard.offset_ms,
            duration_ms: guard.started.elapsed().as_secs_f64() * 1000.0,
            status: status.to_string(),
        });
    }

    fn complete(self, status: &str) -> CompletedTrace {
        CompletedTrace {
            trace_id: self.trace_id,
            method: self.method,
            user_id: self.user_id,
            tenant_id: self.tenant_id,
            started_at: self.started_wall,
            duration_ms: self.started.elapsed().as_secs_f64() * 1000.0,
            status: status.to_string(),
            spans: self.spans,
        }
    }
}

/// In-flight span bookkeeping
pub struct SpanGuard {
    name: String,
    offset_ms: f64,
    started: Instant,
}

/// A finished trace as retained for analytics
#[derive(Debug, Clone, Serialize)]
pub struct CompletedTrace {
    pub trace_id: String,
    pub method: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub status: String,
    pub spans: Vec<TraceSpan>,
}

/// Ring of completed traces, bounded to the retention limit
pub struct TraceStore {
    completed: Mutex<VecDeque<CompletedTrace>>,
}

impl Default for TraceStore {
    fn default() -> Self {
        Self {
            completed: Mutex::new(VecDeque::with_capacity(RETAINED_TRACES)),
        }
    }
}

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete a trace and retain it
    pub fn complete(&self, trace: RequestTrace, status: &str) {
        let completed = trace.complete(status);

        tracing::debug!(
            trace_id = %completed.trace_id,
            method = %completed.method,
            duration_ms = completed.duration_ms,
            status = %completed.status,
            "Request trace completed"
        );

        let mut ring = self.completed.lock().expect("trace ring lock");
        if ring.len() >= RETAINED_TRACES {
            ring.pop_front();
        }
        ring.push_back(completed);
    }

    /// Most recent completed traces, newest last
    pub fn recent(&self, limit: usize) -> Vec<CompletedTrace> {
        let ring = self.completed.lock().expect("trace ring lock");
        ring.iter().rev().take(limit).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.completed.lock().expect("trace ring lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_spans() {
        let mut trace = RequestTrace::new("tools/call", Some("u1".into()), None);

        let span = trace.start_span("routing");
        trace.finish_span(span, "completed");
        let span = trace.start_span("proxy_forward");
        trace.finish_span(span, "completed");

        let store = TraceStore::new();
        store.complete(trace, "success");

        let recent = store.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].spans.len(), 2);
        assert_eq!(recent[0].spans[0].name, "routing");
        assert_eq!(recent[0].status, "success");
    }

    #[test]
    fn test_retention_bound() {
        let store = TraceStore::new();
        for i in 0..600 {
            let trace = RequestTrace::new(format!("m{i}"), None, None);
            store.complete(trace, "success");
        }
        assert_eq!(store.len(), RETAINED_TRACES);

        // Oldest entries were evicted
        let recent = store.recent(RETAINED_TRACES);
        assert_eq!(recent.first().unwrap().method, "m100");
        assert_eq!(recent.last().unwrap().method, "m599");
    }
}

//! Event Source. Reads line-delimited JSON from the external kernel tracer,
//! normalizes each record into an [`Event`](crate::types::Event), and
//! publishes it to a bounded, drop-oldest queue that the aggregator drains
//! on its tick. A dedicated task owns the stream and never blocks
//! downstream of a full queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::metrics::Metrics;
use crate::types::{Event, EventKind, Payload, ScalarValue};

/// Default capacity of the bounded event queue.
pub const QUEUE_CAPACITY: usize = 64 * 1024;

/// Slack bound past which an out-of-order wall timestamp is dropped rather
/// than reordered.
const OUT_OF_ORDER_SLACK: chrono::Duration = chrono::Duration::milliseconds(500);

/// A bounded SPSC-ish queue that drops the oldest entry on overflow instead
/// of blocking the producer. Backed by a plain `Mutex<VecDeque>`.
pub struct EventQueue {
    inner: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    /// Push an event, never blocking. Returns `true` if an older event was
    /// dropped to make room.
    pub fn push(&self, event: Event) -> bool {
        let mut q = self.inner.lock().unwrap();
        let dropped = if q.len() >= self.capacity {
            q.pop_front();
            true
        } else {
            false
        };
        q.push_back(event);
        dropped
    }

    /// Drain every currently queued event. Called by the aggregator once
    /// per tick.
    pub fn drain(&self) -> Vec<Event> {
        let mut q = self.inner.lock().unwrap();
        q.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The tracer's wire record. Required fields are present on the
/// `TracerRecord` itself; everything else lands in `payload`.
#[derive(Debug, Deserialize)]
struct TracerRecord {
    ts: Option<String>,
    event_type: String,
    pid: Option<i64>,
    tid: Option<i64>,
    provider: String,
    #[serde(default)]
    payload: serde_json::Map<String, serde_json::Value>,
    cpu: Option<i64>,
    net_bytes: Option<i64>,
    disk_bytes: Option<i64>,
    new_pid: Option<i64>,
    new_tid: Option<i64>,
    reason: Option<String>,
    /// Any top-level wire key not named above lands here and is folded
    /// into `payload` rather than silently dropped.
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

fn json_to_scalar(v: &serde_json::Value) -> ScalarValue {
    match v {
        serde_json::Value::String(s) => ScalarValue::Str(s.clone()),
        serde_json::Value::Bool(b) => ScalarValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else {
                ScalarValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::Null => ScalarValue::Null,
        other => ScalarValue::Str(other.to_string()),
    }
}

fn optional_i32(v: Option<i64>) -> Option<i32> {
    v.and_then(|x| if x == -1 { None } else { i32::try_from(x).ok() })
}

/// Parse one line into a normalized `Event`. Returns `None` on malformed
/// JSON (caller bumps `malformed_lines`).
fn parse_line(line: &str, recv_ns: u64) -> Option<Event> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let record: TracerRecord = serde_json::from_str(trimmed).ok()?;

    let wall_time = record
        .ts
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let mut payload: Payload = record
        .payload
        .iter()
        .map(|(k, v)| (k.clone(), json_to_scalar(v)))
        .collect();

    let kind = EventKind::from_wire(&record.event_type);
    if matches!(kind, EventKind::Other) {
        payload.insert(
            "raw_kind".to_string(),
            ScalarValue::Str(record.event_type.clone()),
        );
    }
    if let Some(cpu) = record.net_bytes {
        payload.insert("net_bytes".to_string(), ScalarValue::Int(cpu));
    }
    if let Some(d) = record.disk_bytes {
        payload.insert("disk_bytes".to_string(), ScalarValue::Int(d));
    }
    if let Some(np) = record.new_pid {
        payload.insert("new_pid".to_string(), ScalarValue::Int(np));
    }
    if let Some(nt) = record.new_tid {
        payload.insert("new_tid".to_string(), ScalarValue::Int(nt));
    }
    if let Some(reason) = record.reason {
        payload.insert("reason".to_string(), ScalarValue::Str(reason));
    }
    for (k, v) in &record.extra {
        payload.entry(k.clone()).or_insert_with(|| json_to_scalar(v));
    }

    Some(Event {
        recv_ns,
        wall_time,
        kind,
        pid: optional_i32(record.pid),
        tid: optional_i32(record.tid),
        cpu: record.cpu.and_then(|c| i16::try_from(c).ok()),
        provider: record.provider,
        payload,
    })
}

/// Runs the tracer-reading loop until cancelled or the stream ends: one
/// task owns the stream, parses, and publishes, adapted here from an eBPF
/// perf buffer to a line-delimited text stream.
pub struct EventSource {
    queue: std::sync::Arc<EventQueue>,
    metrics: std::sync::Arc<Metrics>,
    cancelled: std::sync::Arc<AtomicBool>,
    start: std::time::Instant,
    last_wall_time: Mutex<Option<DateTime<Utc>>>,
}

impl EventSource {
    pub fn new(queue: std::sync::Arc<EventQueue>, metrics: std::sync::Arc<Metrics>) -> Self {
        Self {
            queue,
            metrics,
            cancelled: std::sync::Arc::new(AtomicBool::new(false)),
            start: std::time::Instant::now(),
            last_wall_time: Mutex::new(None),
        }
    }

    pub fn cancel_handle(&self) -> std::sync::Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Normalize and enqueue one line, unless it is malformed or
    /// out-of-order past the slack bound.
    fn ingest_line(&self, line: &str) {
        let recv_ns = self.start.elapsed().as_nanos() as u64;
        let Some(event) = parse_line(line, recv_ns) else {
            self.metrics.inc_malformed();
            return;
        };

        {
            let mut last = self.last_wall_time.lock().unwrap();
            if let Some(prev) = *last {
                if event.wall_time + OUT_OF_ORDER_SLACK < prev {
                    self.metrics.inc_out_of_order();
                    return;
                }
            }
            *last = Some((*last).map_or(event.wall_time, |p| p.max(event.wall_time)));
        }

        if self.queue.push(event) {
            self.metrics.inc_backpressure();
        }
    }

    /// Drive the reader to completion (stream EOF) or cancellation,
    /// whichever comes first. The reader finishes its current line before
    /// observing cancellation.
    pub async fn run<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                debug!("[ingest] cancellation observed, exiting reader loop");
                break;
            }
            match lines.next_line().await {
                Ok(Some(line)) => self.ingest_line(&line),
                Ok(None) => {
                    debug!("[ingest] tracer stream closed");
                    break;
                }
                Err(err) => {
                    warn!("[ingest] read error, retrying: {err}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

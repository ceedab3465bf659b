//! Core data model shared by every pipeline stage: events off the wire,
//! rolling samples kept by the aggregator, and the records the detector,
//! ranker and RCA orchestrator hand off to each other.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kernel tracer's event kind enumeration. Unknown strings fold to
/// `Other` with the original text preserved in the event's payload under
/// `"raw_kind"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProcessStart,
    ProcessStop,
    ThreadStart,
    ContextSwitch,
    TcpSend,
    TcpRecv,
    FileRead,
    FileWrite,
    CpuSample,
    MemSample,
    Gc,
    Exception,
    Other,
}

impl EventKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "process_start" => EventKind::ProcessStart,
            "process_stop" => EventKind::ProcessStop,
            "thread_start" => EventKind::ThreadStart,
            "context_switch" => EventKind::ContextSwitch,
            "tcp_send" => EventKind::TcpSend,
            "tcp_recv" => EventKind::TcpRecv,
            "file_read" => EventKind::FileRead,
            "file_write" => EventKind::FileWrite,
            "cpu_sample" => EventKind::CpuSample,
            "mem_sample" => EventKind::MemSample,
            "gc" => EventKind::Gc,
            "exception" => EventKind::Exception,
            _ => EventKind::Other,
        }
    }
}

/// A single scalar in the tracer's free-form payload map. Decoded once at
/// ingest; downstream code never touches raw JSON again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

pub type Payload = HashMap<String, ScalarValue>;

/// A normalized event as handed from the event source to the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic receive timestamp, nanoseconds since process start.
    pub recv_ns: u64,
    /// Wall timestamp: the tracer's `ts` field if present and parseable,
    /// else synthesized on receipt.
    pub wall_time: DateTime<Utc>,
    pub kind: EventKind,
    pub pid: Option<i32>,
    pub tid: Option<i32>,
    pub cpu: Option<i16>,
    pub provider: String,
    #[serde(default)]
    pub payload: Payload,
}

/// A (wall timestamp, cpu%, ram%) triple sampled at a fixed cadence by the
/// aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostSample {
    pub wall_time: DateTime<Utc>,
    pub cpu_pct: f64,
    pub ram_pct: f64,
}

/// Per-pid, per-tick rollup produced by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub wall_time: DateTime<Utc>,
    pub cpu_pct: f64,
    pub ram_pct: f64,
    pub disk_bytes: u64,
    pub net_bytes: u64,
    pub event_count: u64,
}

/// Static, slowly-changing metadata about a pid, kept alongside its ring of
/// snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub name: String,
    pub cmdline: Option<String>,
}

/// The spike state machine's current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeState {
    Normal,
    Candidate,
    Confirmed,
    Cooling,
}

/// A ranked suspect pid with its three fusion components and final score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suspect {
    pub pid: i32,
    pub name: String,
    pub cmdline: Option<String>,
    pub anomaly: f64,
    pub energy: f64,
    pub correlation: f64,
    pub score: f64,
    pub cpu_share: f64,
    pub ram_share: f64,
}

/// One normalized event retained as evidence in an incident's window.
pub type EtwEventSample = Event;

/// An immutable (save for one `rca` assignment) confirmed spike record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeIncident {
    pub id: u64,
    pub detected_at: DateTime<Utc>,
    pub cpu_at_confirm: f64,
    pub ram_at_confirm: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub etw_events: Vec<EtwEventSample>,
    pub ranked_suspects: Vec<Suspect>,
    pub rca: Option<RcaReport>,
}

/// The culprit process summary embedded in an `RcaReport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CulpritProcess {
    pub pid: i32,
    pub name: String,
    pub cmdline: Option<String>,
    pub cpu_pct: f64,
    pub ram_pct: f64,
    pub disk_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceImpact {
    pub cpu_spike_percent: f64,
    pub ram_spike_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedSuspect {
    pub pid: i32,
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub details: String,
}

/// The structured root-cause-analysis record, either returned by the LLM
/// collaborator or synthesized locally on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcaReport {
    pub cause_summary: String,
    pub confidence: f64,
    pub culprit_process: Option<CulpritProcess>,
    pub resource_impact: ResourceImpact,
    pub ranked_suspects: Vec<RankedSuspect>,
    pub timeline: Vec<TimelineEntry>,
    pub recs: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl RcaReport {
    /// Clamp every bounded field before accepting an LLM reply.
    pub fn clamp_ranges(&mut self) {
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self.resource_impact.cpu_spike_percent = self.resource_impact.cpu_spike_percent.clamp(0.0, 100.0);
        self.resource_impact.ram_spike_percent = self.resource_impact.ram_spike_percent.clamp(0.0, 100.0);
    }
}

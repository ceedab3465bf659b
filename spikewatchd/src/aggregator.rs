//! Telemetry Aggregator. Owns the host sample ring and the per-pid
//! snapshot table, closes one bucket per tick, and attributes per-tick CPU
//! from `context_switch`/`cpu_sample` events. A `Mutex`-guarded `VecDeque`
//! ring plus a `HashMap` table, pruned on every insert.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::warn;

use crate::metrics::Metrics;
use crate::types::{Event, EventKind, HostSample, ProcessIdentity, ProcessSnapshot, ScalarValue};

/// The host-counter syscall collaborator, kept behind a single narrow
/// call surface (rather than calling `sysinfo::System` directly) so tests
/// can supply a deterministic fake.
pub trait HostCounters: Send + Sync {
    fn cpu_total_pct(&mut self) -> f64;
    fn ram_used_pct(&mut self) -> f64;
    /// Working-set percentage for one pid, or `None` if unavailable
    /// (sets `ram_unavailable`).
    fn process_ram_pct(&mut self, pid: i32) -> Option<f64>;
}

/// Production implementation backed by `sysinfo`.
pub struct SysinfoCounters {
    sys: sysinfo::System,
}

impl Default for SysinfoCounters {
    fn default() -> Self {
        Self {
            sys: sysinfo::System::new_all(),
        }
    }
}

impl HostCounters for SysinfoCounters {
    fn cpu_total_pct(&mut self) -> f64 {
        self.sys.refresh_cpu_all();
        self.sys.global_cpu_usage() as f64
    }

    fn ram_used_pct(&mut self) -> f64 {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        (self.sys.used_memory() as f64 / total as f64) * 100.0
    }

    fn process_ram_pct(&mut self, pid: i32) -> Option<f64> {
        let pid_obj = sysinfo::Pid::from_u32(pid as u32);
        self.sys
            .refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid_obj]), false);
        let total = self.sys.total_memory();
        if total == 0 {
            return None;
        }
        self.sys
            .process(pid_obj)
            .map(|p| (p.memory() as f64 / total as f64) * 100.0)
    }
}

struct ProcessRow {
    identity: ProcessIdentity,
    snapshots: VecDeque<ProcessSnapshot>,
    last_seen: DateTime<Utc>,
    max_len: usize,
}

impl ProcessRow {
    fn new(identity: ProcessIdentity, max_len: usize, now: DateTime<Utc>) -> Self {
        Self {
            identity,
            snapshots: VecDeque::with_capacity(max_len.min(256)),
            last_seen: now,
            max_len,
        }
    }

    fn push(&mut self, snap: ProcessSnapshot) {
        if self.snapshots.len() >= self.max_len {
            self.snapshots.pop_front();
        }
        self.last_seen = snap.wall_time;
        self.snapshots.push_back(snap);
    }
}

/// Per-tick accumulator for one pid before the bucket is closed.
#[derive(Default, Clone)]
struct PidAccumulator {
    context_switches: u64,
    disk_bytes: u64,
    net_bytes: u64,
    event_count: u64,
    name_hint: Option<String>,
}

struct Inner {
    host_ring: VecDeque<HostSample>,
    host_window: usize,
    process_table: HashMap<i32, ProcessRow>,
    pid_window: usize,
    pid_evict: chrono::Duration,
    recent_events: VecDeque<Event>,
    recent_events_cap: usize,
    accumulators: HashMap<i32, PidAccumulator>,
    context_switches_this_tick: u64,
    num_cores: usize,
}

/// The aggregator's state, guarded by a single mutex held only across O(1)
/// operations; readers take a lock, copy out, and release immediately.
pub struct TelemetryAggregator {
    inner: Mutex<Inner>,
}

impl TelemetryAggregator {
    pub fn new(host_window_seconds: u64, pid_window: usize, pid_evict_seconds: u64) -> Self {
        let num_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            inner: Mutex::new(Inner {
                host_ring: VecDeque::with_capacity(host_window_seconds as usize),
                host_window: host_window_seconds as usize,
                process_table: HashMap::new(),
                pid_window,
                pid_evict: chrono::Duration::seconds(pid_evict_seconds as i64),
                recent_events: VecDeque::new(),
                recent_events_cap: 4096,
                accumulators: HashMap::new(),
                context_switches_this_tick: 0,
                num_cores,
            }),
        }
    }

    /// Feed one event into the current tick's accumulators. Events are
    /// processed in the order the event source delivered them.
    pub fn ingest_event(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(pid) = event.pid {
            let acc = inner.accumulators.entry(pid).or_default();
            acc.event_count += 1;
            match event.kind {
                EventKind::ContextSwitch => {
                    inner.context_switches_this_tick += 1;
                    if let Some(ScalarValue::Int(new_pid)) = event.payload.get("new_pid") {
                        let new_pid = *new_pid as i32;
                        inner.accumulators.entry(new_pid).or_default();
                    }
                }
                EventKind::FileRead | EventKind::FileWrite => {
                    if let Some(bytes) = scalar_u64(event.payload.get("disk_bytes")) {
                        acc.disk_bytes = acc.disk_bytes.saturating_add(bytes);
                    }
                }
                EventKind::TcpSend | EventKind::TcpRecv => {
                    if let Some(bytes) = scalar_u64(event.payload.get("net_bytes")) {
                        acc.net_bytes = acc.net_bytes.saturating_add(bytes);
                    }
                }
                EventKind::ProcessStart => {
                    if let Some(ScalarValue::Str(name)) = event.payload.get("comm") {
                        acc.name_hint = Some(name.clone());
                    }
                }
                _ => {}
            }
        }

        // Tally this switch against whichever pid owns the `new_pid`; the
        // actual core-second credit is only known once the tick closes and
        // the final total_switches_this_tick is available.
        if event.kind == EventKind::ContextSwitch {
            if let Some(ScalarValue::Int(new_pid)) = event.payload.get("new_pid") {
                let new_pid = *new_pid as i32;
                inner.accumulators.entry(new_pid).or_default().context_switches += 1;
            }
        }

        if inner.recent_events.len() >= inner.recent_events_cap {
            inner.recent_events.pop_front();
        }
        inner.recent_events.push_back(event);
    }

    /// Close the current bucket. `counters` supplies the external syscall
    /// collaborator's readings.
    pub fn tick(
        &self,
        now: DateTime<Utc>,
        tick_duration_secs: f64,
        counters: &mut dyn HostCounters,
        metrics: &Metrics,
    ) -> HostSample {
        let mut inner = self.inner.lock().unwrap();

        let cpu_pct = counters.cpu_total_pct();
        let ram_pct = counters.ram_used_pct();

        if inner.host_ring.len() >= inner.host_window {
            inner.host_ring.pop_front();
        }
        inner.host_ring.push_back(HostSample {
            wall_time: now,
            cpu_pct,
            ram_pct,
        });

        let num_cores = inner.num_cores.max(1) as f64;
        let accumulators = std::mem::take(&mut inner.accumulators);
        let total_switches = inner.context_switches_this_tick;
        inner.context_switches_this_tick = 0;

        let mut total_attributed_cpu = 0.0;
        for (pid, acc) in accumulators {
            // Each context switch credits tick_duration / total_switches
            // core-seconds to its new_pid, so the whole tick sums to one
            // core-second of attributed cpu time.
            let cpu_core_seconds = if total_switches > 0 {
                (acc.context_switches as f64 / total_switches as f64) * tick_duration_secs
            } else {
                0.0
            };
            let pid_cpu_pct = (cpu_core_seconds / (num_cores * tick_duration_secs)) * 100.0;
            total_attributed_cpu += pid_cpu_pct;

            let ram_pct = match counters.process_ram_pct(pid) {
                Some(v) => v,
                None => {
                    metrics.inc_ram_unavailable();
                    0.0
                }
            };

            let snap = ProcessSnapshot {
                wall_time: now,
                cpu_pct: pid_cpu_pct,
                ram_pct,
                disk_bytes: acc.disk_bytes,
                net_bytes: acc.net_bytes,
                event_count: acc.event_count,
            };

            let pid_window = inner.pid_window;
            let row = inner.process_table.entry(pid).or_insert_with(|| {
                ProcessRow::new(
                    ProcessIdentity {
                        name: acc.name_hint.clone().unwrap_or_else(|| format!("pid-{pid}")),
                        cmdline: None,
                    },
                    pid_window,
                    now,
                )
            });
            if let Some(name) = acc.name_hint {
                row.identity.name = name;
            }
            row.push(snap);
        }

        let tolerance = 2.0;
        if total_attributed_cpu > 100.0 * num_cores + tolerance {
            warn!(
                "[aggregator] per-pid cpu attribution {total_attributed_cpu:.1}% exceeds {:.1}% + tolerance",
                100.0 * num_cores
            );
        }

        let evict_before = now - inner.pid_evict;
        inner
            .process_table
            .retain(|_, row| row.last_seen >= evict_before);

        HostSample {
            wall_time: now,
            cpu_pct,
            ram_pct,
        }
    }

    /// Mark a pid for immediate eviction, e.g. on a process_stop event.
    pub fn evict_pid(&self, pid: i32) {
        self.inner.lock().unwrap().process_table.remove(&pid);
    }

    pub fn latest_host_sample(&self) -> Option<HostSample> {
        self.inner.lock().unwrap().host_ring.back().copied()
    }

    pub fn host_window(&self, seconds: u64) -> Vec<HostSample> {
        let inner = self.inner.lock().unwrap();
        let cutoff_len = (seconds as usize).min(inner.host_ring.len());
        inner
            .host_ring
            .iter()
            .rev()
            .take(cutoff_len)
            .rev()
            .copied()
            .collect()
    }

    pub fn process_snapshots(&self, pid: i32, seconds: u64) -> Vec<ProcessSnapshot> {
        let inner = self.inner.lock().unwrap();
        match inner.process_table.get(&pid) {
            Some(row) => {
                let take_n = (seconds as usize).min(row.snapshots.len());
                row.snapshots.iter().rev().take(take_n).rev().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn process_identity(&self, pid: i32) -> Option<ProcessIdentity> {
        self.inner
            .lock()
            .unwrap()
            .process_table
            .get(&pid)
            .map(|r| r.identity.clone())
    }

    pub fn active_pids(&self, window_seconds: u64) -> Vec<i32> {
        let inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::seconds(window_seconds as i64);
        inner
            .process_table
            .iter()
            .filter(|(_, row)| row.last_seen >= cutoff)
            .map(|(pid, _)| *pid)
            .collect()
    }

    pub fn recent_events(&self, max: usize) -> Vec<Event> {
        let inner = self.inner.lock().unwrap();
        let take_n = max.min(inner.recent_events.len());
        inner
            .recent_events
            .iter()
            .rev()
            .take(take_n)
            .rev()
            .cloned()
            .collect()
    }
}

fn scalar_u64(v: Option<&ScalarValue>) -> Option<u64> {
    match v {
        Some(ScalarValue::Int(i)) if *i >= 0 => Some(*i as u64),
        Some(ScalarValue::Float(f)) if *f >= 0.0 => Some(*f as u64),
        _ => None,
    }
}

//! Process-wide counters: every degraded-but-local outcome increments a
//! counter rather than propagating as an error. All fields are atomic
//! since they are touched from the hot ingest/tick paths as well as from
//! the read API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    pub malformed_lines: AtomicU64,
    pub backpressure_drops: AtomicU64,
    pub out_of_order_dropped: AtomicU64,
    pub ram_unavailable_total: AtomicU64,
    pub baseline_insufficient_total: AtomicU64,
    pub llm_timeouts: AtomicU64,
    pub llm_schema_errors: AtomicU64,
    pub llm_backpressure_drops: AtomicU64,
    pub incidents_confirmed: AtomicU64,
    pub rb_overflows: AtomicU64,
    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            malformed_lines: AtomicU64::new(0),
            backpressure_drops: AtomicU64::new(0),
            out_of_order_dropped: AtomicU64::new(0),
            ram_unavailable_total: AtomicU64::new(0),
            baseline_insufficient_total: AtomicU64::new(0),
            llm_timeouts: AtomicU64::new(0),
            llm_schema_errors: AtomicU64::new(0),
            llm_backpressure_drops: AtomicU64::new(0),
            incidents_confirmed: AtomicU64::new(0),
            rb_overflows: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn inc_malformed(&self) {
        self.malformed_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backpressure(&self) {
        self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_out_of_order(&self) {
        self.out_of_order_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ram_unavailable(&self) {
        self.ram_unavailable_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_baseline_insufficient(&self) {
        self.baseline_insufficient_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_llm_timeout(&self) {
        self.llm_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_llm_schema_error(&self) {
        self.llm_schema_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_llm_backpressure(&self) {
        self.llm_backpressure_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_incident_confirmed(&self) {
        self.incidents_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rb_overflow(&self) {
        self.rb_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
            out_of_order_dropped: self.out_of_order_dropped.load(Ordering::Relaxed),
            ram_unavailable_total: self.ram_unavailable_total.load(Ordering::Relaxed),
            baseline_insufficient_total: self.baseline_insufficient_total.load(Ordering::Relaxed),
            llm_timeouts: self.llm_timeouts.load(Ordering::Relaxed),
            llm_schema_errors: self.llm_schema_errors.load(Ordering::Relaxed),
            llm_backpressure_drops: self.llm_backpressure_drops.load(Ordering::Relaxed),
            incidents_confirmed: self.incidents_confirmed.load(Ordering::Relaxed),
            rb_overflows: self.rb_overflows.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub malformed_lines: u64,
    pub backpressure_drops: u64,
    pub out_of_order_dropped: u64,
    pub ram_unavailable_total: u64,
    pub baseline_insufficient_total: u64,
    pub llm_timeouts: u64,
    pub llm_schema_errors: u64,
    pub llm_backpressure_drops: u64,
    pub incidents_confirmed: u64,
    pub rb_overflows: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let m = Metrics::new();
        assert_eq!(m.snapshot().malformed_lines, 0);
        m.inc_malformed();
        m.inc_malformed();
        assert_eq!(m.snapshot().malformed_lines, 2);
    }
}

//! RCA Orchestrator. Assembles a bounded payload for a confirmed spike,
//! hands it to an LLM collaborator over HTTP with retry and backoff,
//! validates the reply, and falls back to a local placeholder on any
//! failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, warn};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::ReasonerConfig;
use crate::metrics::Metrics;
use crate::types::{CulpritProcess, Event, RankedSuspect, ResourceImpact, RcaReport, SpikeIncident, Suspect};

#[derive(Debug, Serialize)]
struct RcaRequest<'a> {
    incident_id: u64,
    detected_at: DateTime<Utc>,
    cpu_at_confirm: f64,
    ram_at_confirm: f64,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    suspects: &'a [Suspect],
    events: &'a [Event],
}

fn build_request(incident: &SpikeIncident, events_sample: usize) -> RcaRequest<'_> {
    let events = if incident.etw_events.len() > events_sample {
        &incident.etw_events[incident.etw_events.len() - events_sample..]
    } else {
        &incident.etw_events[..]
    };
    RcaRequest {
        incident_id: incident.id,
        detected_at: incident.detected_at,
        cpu_at_confirm: incident.cpu_at_confirm,
        ram_at_confirm: incident.ram_at_confirm,
        window_start: incident.window_start,
        window_end: incident.window_end,
        suspects: &incident.ranked_suspects,
        events,
    }
}

/// Builds the placeholder report used on any reasoner failure. Keeps the
/// already-computed local ranking rather than discarding it: `cause_summary`
/// is the only part of the report that the LLM would have added.
fn fallback_report(
    generated_at: DateTime<Utc>,
    reason: &str,
    ranked_suspects: &[Suspect],
    cpu_at_confirm: f64,
    ram_at_confirm: f64,
) -> RcaReport {
    let culprit_process = ranked_suspects.first().map(|top| CulpritProcess {
        pid: top.pid,
        name: top.name.clone(),
        cmdline: top.cmdline.clone(),
        cpu_pct: top.cpu_share * 100.0,
        ram_pct: top.ram_share * 100.0,
        disk_bytes: 0,
    });
    RcaReport {
        cause_summary: format!("<unavailable: {reason}>"),
        confidence: 0.0,
        culprit_process,
        resource_impact: ResourceImpact {
            cpu_spike_percent: cpu_at_confirm,
            ram_spike_percent: ram_at_confirm,
        },
        ranked_suspects: ranked_suspects
            .iter()
            .map(|s| RankedSuspect {
                pid: s.pid,
                name: s.name.clone(),
                score: s.score,
            })
            .collect(),
        timeline: Vec::new(),
        recs: Vec::new(),
        generated_at,
    }
}

/// Exponential backoff with jitter: base 2s, +-500ms, doubling per attempt.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms: u64 = 2000u64.saturating_mul(1u64 << attempt.min(10));
    let jitter: i64 = rand::thread_rng().gen_range(-500..=500);
    let total = (base_ms as i64 + jitter).max(0) as u64;
    Duration::from_millis(total)
}

struct Job {
    body: String,
    detected_at: DateTime<Utc>,
    cpu_at_confirm: f64,
    ram_at_confirm: f64,
    ranked_suspects: Vec<Suspect>,
    respond_to: oneshot::Sender<RcaReport>,
}

/// Single-flight worker: one job in front of the LLM endpoint at a time,
/// fed by a bounded queue that drops (rather than blocks) when full.
pub struct RcaOrchestrator {
    tx: mpsc::Sender<Job>,
    metrics: Arc<Metrics>,
    events_sample: usize,
    enabled: bool,
}

impl RcaOrchestrator {
    pub fn spawn(cfg: ReasonerConfig, metrics: Arc<Metrics>) -> Self {
        let (tx, rx) = mpsc::channel(cfg.queue_depth.max(1));
        let worker_metrics = metrics.clone();
        let worker_cfg = cfg.clone();
        tokio::spawn(worker_loop(rx, worker_cfg, worker_metrics));
        Self {
            tx,
            metrics,
            events_sample: cfg.events_sample,
            enabled: cfg.enabled,
        }
    }

    /// Submit a confirmed incident for analysis and await its report. Never
    /// errors: every failure mode resolves to a fallback `RcaReport`.
    pub async fn analyze(&self, incident: &SpikeIncident) -> RcaReport {
        let fallback = |reason: &str| {
            fallback_report(
                incident.detected_at,
                reason,
                &incident.ranked_suspects,
                incident.cpu_at_confirm,
                incident.ram_at_confirm,
            )
        };

        if !self.enabled {
            return fallback("reasoner disabled");
        }

        let request = build_request(incident, self.events_sample);
        let body = match serde_json::to_string(&request) {
            Ok(b) => b,
            Err(err) => {
                error!("[rca] failed to serialize request: {err}");
                return fallback("request serialization failed");
            }
        };

        let (respond_to, rx) = oneshot::channel();
        let job = Job {
            body,
            detected_at: incident.detected_at,
            cpu_at_confirm: incident.cpu_at_confirm,
            ram_at_confirm: incident.ram_at_confirm,
            ranked_suspects: incident.ranked_suspects.clone(),
            respond_to,
        };

        match self.tx.try_send(job) {
            Ok(()) => rx.await.unwrap_or_else(|_| fallback("worker unavailable")),
            Err(_) => {
                self.metrics.inc_llm_backpressure();
                fallback("backpressure")
            }
        }
    }
}

async fn worker_loop(mut rx: mpsc::Receiver<Job>, cfg: ReasonerConfig, metrics: Arc<Metrics>) {
    let client = reqwest::Client::new();
    while let Some(job) = rx.recv().await {
        let report = match send_with_retry(&client, &cfg, &metrics, &job.body).await {
            Ok(report) => report,
            Err(reason) => {
                warn!("[rca] analysis failed: {reason}");
                fallback_report(
                    job.detected_at,
                    &reason,
                    &job.ranked_suspects,
                    job.cpu_at_confirm,
                    job.ram_at_confirm,
                )
            }
        };
        let _ = job.respond_to.send(report);
    }
}

async fn send_with_retry(
    client: &reqwest::Client,
    cfg: &ReasonerConfig,
    metrics: &Metrics,
    body: &str,
) -> Result<RcaReport, String> {
    let mut attempt = 0;
    loop {
        let outcome = client
            .post(&cfg.endpoint)
            .header("content-type", "application/json")
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .body(body.to_string())
            .send()
            .await;

        match outcome {
            Ok(resp) if resp.status().is_success() => {
                return match resp.json::<RcaReport>().await {
                    Ok(mut report) => {
                        report.clamp_ranges();
                        Ok(report)
                    }
                    Err(err) => {
                        metrics.inc_llm_schema_error();
                        Err(format!("schema error: {err}"))
                    }
                };
            }
            Ok(resp) if resp.status().is_client_error() => {
                // 4xx is fatal; the request itself is malformed, retrying
                // will not help.
                return Err(format!("client error {}", resp.status()));
            }
            Ok(resp) => {
                if attempt >= cfg.retries {
                    return Err(format!("server error {}", resp.status()));
                }
            }
            Err(err) if err.is_timeout() => {
                metrics.inc_llm_timeout();
                if attempt >= cfg.retries {
                    return Err("timeout".to_string());
                }
            }
            Err(err) => {
                if attempt >= cfg.retries {
                    return Err(format!("transport error: {err}"));
                }
            }
        }
        tokio::time::sleep(backoff_delay(attempt)).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SpikeIncident;

    fn sample_incident() -> SpikeIncident {
        let now = Utc::now();
        SpikeIncident {
            id: 1,
            detected_at: now,
            cpu_at_confirm: 95.0,
            ram_at_confirm: 40.0,
            window_start: now - chrono::Duration::seconds(60),
            window_end: now,
            etw_events: Vec::new(),
            ranked_suspects: Vec::new(),
            rca: None,
        }
    }

    #[test]
    fn fallback_report_has_zero_confidence_and_tagged_summary() {
        let report = fallback_report(Utc::now(), "timeout", &[], 0.0, 0.0);
        assert_eq!(report.confidence, 0.0);
        assert_eq!(report.cause_summary, "<unavailable: timeout>");
        assert!(report.culprit_process.is_none());
        assert!(report.ranked_suspects.is_empty());
    }

    #[test]
    fn fallback_report_carries_the_locally_derived_ranking() {
        let suspects = vec![Suspect {
            pid: 42,
            name: "hog".to_string(),
            cmdline: None,
            anomaly: 0.9,
            energy: 0.8,
            correlation: 0.5,
            score: 0.85,
            cpu_share: 0.7,
            ram_share: 0.2,
        }];
        let report = fallback_report(Utc::now(), "timeout", &suspects, 95.0, 40.0);
        assert_eq!(report.ranked_suspects.len(), 1);
        assert_eq!(report.ranked_suspects[0].pid, 42);
        let culprit = report.culprit_process.expect("top suspect becomes the culprit");
        assert_eq!(culprit.pid, 42);
        assert_eq!(report.resource_impact.cpu_spike_percent, 95.0);
        assert_eq!(report.resource_impact.ram_spike_percent, 40.0);
    }

    #[test]
    fn build_request_truncates_events_to_the_sample_bound() {
        let mut incident = sample_incident();
        incident.etw_events = (0..10)
            .map(|i| Event {
                recv_ns: i,
                wall_time: Utc::now(),
                kind: crate::types::EventKind::Other,
                pid: None,
                tid: None,
                cpu: None,
                provider: "test".to_string(),
                payload: Default::default(),
            })
            .collect();
        let request = build_request(&incident, 3);
        assert_eq!(request.events.len(), 3);
        assert_eq!(request.events[0].recv_ns, 7);
    }

    #[test]
    fn backoff_delay_grows_with_attempt_and_stays_nonnegative() {
        let d0 = backoff_delay(0);
        let d1 = backoff_delay(1);
        assert!(d0.as_millis() >= 1500 && d0.as_millis() <= 2500);
        assert!(d1.as_millis() >= 3500 && d1.as_millis() <= 4500);
    }

    #[tokio::test]
    async fn disabled_reasoner_returns_fallback_without_a_network_call() {
        let metrics = Arc::new(Metrics::new());
        let mut cfg = ReasonerConfig::default();
        cfg.enabled = false;
        let orchestrator = RcaOrchestrator::spawn(cfg, metrics);
        let report = orchestrator.analyze(&sample_incident()).await;
        assert_eq!(report.cause_summary, "<unavailable: reasoner disabled>");
    }

    #[tokio::test]
    async fn unreachable_endpoint_falls_back_after_retries() {
        let metrics = Arc::new(Metrics::new());
        let mut cfg = ReasonerConfig::default();
        cfg.endpoint = "http://127.0.0.1:1/v1/rca".to_string();
        cfg.retries = 0;
        cfg.timeout_seconds = 1;
        let orchestrator = RcaOrchestrator::spawn(cfg, metrics);
        let report = orchestrator.analyze(&sample_incident()).await;
        assert_eq!(report.confidence, 0.0);
        assert!(report.cause_summary.starts_with("<unavailable:"));
    }
}

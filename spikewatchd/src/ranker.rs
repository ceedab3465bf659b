//! PID Ranker. Fuses an anomaly, an energy, and a correlation component
//! into one suspect score per active pid: a composite of normalized
//! factors, weighted and summed, then sorted descending.

use crate::aggregator::TelemetryAggregator;
use crate::config::RankerConfig;
use crate::detector::{median_mad, robust_z};
use crate::types::{ProcessSnapshot, Suspect};

/// Anomaly (0.4), energy (0.4), correlation (0.2) — the fusion weights.
const WEIGHT_ANOMALY: f64 = 0.4;
const WEIGHT_ENERGY: f64 = 0.4;
const WEIGHT_CORRELATION: f64 = 0.2;

const CPU_SHARE_WEIGHT: f64 = 0.7;
const RAM_SHARE_WEIGHT: f64 = 0.3;

/// Minimum overlapping samples before a correlation component is computed
/// at all; below this it contributes 0 rather than noise.
const MIN_CORRELATION_SAMPLES: usize = 10;

/// `d²` in the anomaly normalization `A = 1 - exp(-d²/8)`.
const ANOMALY_SCALE: f64 = 8.0;

pub struct PidRanker {
    cfg: RankerConfig,
    baseline_seconds: u64,
}

struct PidStats {
    pid: i32,
    name: String,
    cmdline: Option<String>,
    mean_cpu: f64,
    mean_ram: f64,
    cpu_energy: f64,
    ram_energy: f64,
    cpu_series: Vec<f64>,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Finite-or-zero: any NaN/Inf in an intermediate value collapses that
/// component to 0 rather than poisoning the fused score.
fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Invert a 2x2 covariance matrix, falling back to an axis-aligned diagonal
/// (variance-only, zero covariance) when the matrix is singular or
/// near-singular — the corpus carries no linear-algebra crate, so this is
/// written out by hand rather than pulling one in for a single 2x2 solve.
fn invert_2x2(m: [[f64; 2]; 2]) -> [[f64; 2]; 2] {
    let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    if det.abs() < 1e-6 {
        let v0 = m[0][0].max(1e-3);
        let v1 = m[1][1].max(1e-3);
        return [[1.0 / v0, 0.0], [0.0, 1.0 / v1]];
    }
    let inv_det = 1.0 / det;
    [
        [m[1][1] * inv_det, -m[0][1] * inv_det],
        [-m[1][0] * inv_det, m[0][0] * inv_det],
    ]
}

/// Squared Mahalanobis distance of `point` from `mean` under `inv_cov`.
/// Left squared (not sqrt'd) since the anomaly normalization only ever
/// needs `d²`.
fn mahalanobis_squared(point: (f64, f64), mean: (f64, f64), inv_cov: [[f64; 2]; 2]) -> f64 {
    let d = (point.0 - mean.0, point.1 - mean.1);
    let a = d.0 * inv_cov[0][0] + d.1 * inv_cov[1][0];
    let b = d.0 * inv_cov[0][1] + d.1 * inv_cov[1][1];
    (a * d.0 + b * d.1).max(0.0)
}

/// Cosine similarity between two series, each mean-centered first so an
/// uncorrelated pid scores 0 rather than 0.5.
fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < MIN_CORRELATION_SAMPLES {
        return 0.0;
    }
    let (a, b) = (&a[a.len() - n..], &b[b.len() - n..]);
    let mean_a = mean(a);
    let mean_b = mean(b);
    let centered_a: Vec<f64> = a.iter().map(|x| x - mean_a).collect();
    let centered_b: Vec<f64> = b.iter().map(|x| x - mean_b).collect();
    let dot: f64 = centered_a.iter().zip(&centered_b).map(|(x, y)| x * y).sum();
    let norm_a = centered_a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = centered_b.iter().map(|y| y * y).sum::<f64>().sqrt();
    if norm_a < 1e-9 || norm_b < 1e-9 {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0).max(0.0)
    }
}

impl PidRanker {
    /// `baseline_seconds` is the same robust-baseline window the spike
    /// detector uses; the anomaly component measures each pid against the
    /// host's own baseline distribution over that window, not the detector
    /// itself, so it is threaded in here rather than duplicated as a
    /// second config field.
    pub fn new(cfg: RankerConfig, baseline_seconds: u64) -> Self {
        Self { cfg, baseline_seconds }
    }

    /// Rank every pid active in the attribution window, returning up to
    /// `max_suspects` suspects sorted by fused score descending.
    pub fn rank(&self, aggregator: &TelemetryAggregator) -> Vec<Suspect> {
        let window = self.cfg.attribution_window_seconds;
        let pids = aggregator.active_pids(window);
        let host_samples = aggregator.host_window(window);
        let host_cpu_series: Vec<f64> = host_samples.iter().map(|s| s.cpu_pct).collect();
        let host_cpu_energy: f64 = host_samples.iter().map(|s| s.cpu_pct).sum();
        let host_ram_energy: f64 = host_samples.iter().map(|s| s.ram_pct).sum();

        let mut stats: Vec<PidStats> = Vec::with_capacity(pids.len());
        for pid in pids {
            let snapshots = aggregator.process_snapshots(pid, window);
            if snapshots.is_empty() {
                continue;
            }
            let identity = aggregator.process_identity(pid);
            let cpu_series: Vec<f64> = snapshots.iter().map(|s: &ProcessSnapshot| s.cpu_pct).collect();
            let ram_series: Vec<f64> = snapshots.iter().map(|s| s.ram_pct).collect();
            stats.push(PidStats {
                pid,
                name: identity
                    .as_ref()
                    .map(|i| i.name.clone())
                    .unwrap_or_else(|| format!("pid-{pid}")),
                cmdline: identity.and_then(|i| i.cmdline),
                mean_cpu: mean(&cpu_series),
                mean_ram: mean(&ram_series),
                cpu_energy: cpu_series.iter().sum(),
                ram_energy: ram_series.iter().sum(),
                cpu_series,
            });
        }

        if stats.is_empty() {
            return Vec::new();
        }

        // The anomaly component measures each pid's mean feature vector
        // against the host-wide baseline distribution over the prior
        // baseline_seconds, not against the in-window pid population.
        let baseline_samples = aggregator.host_window(self.baseline_seconds);
        let baseline_cpu: Vec<f64> = baseline_samples.iter().map(|s| s.cpu_pct).collect();
        let baseline_ram: Vec<f64> = baseline_samples.iter().map(|s| s.ram_pct).collect();
        let baseline_mean = (mean(&baseline_cpu), mean(&baseline_ram));
        let baseline_cov = covariance_2d(&baseline_cpu, &baseline_ram, baseline_mean);
        let det = baseline_cov[0][0] * baseline_cov[1][1] - baseline_cov[0][1] * baseline_cov[1][0];

        let inv_cov = if det.abs() < 1e-6 { None } else { Some(invert_2x2(baseline_cov)) };
        let (baseline_cpu_median, baseline_cpu_mad) = median_mad(&baseline_cpu);
        let (baseline_ram_median, baseline_ram_mad) = median_mad(&baseline_ram);

        let mut suspects: Vec<Suspect> = stats
            .iter()
            .filter_map(|s| {
                let cpu_share = if host_cpu_energy > 0.0 {
                    (s.cpu_energy / host_cpu_energy).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let ram_share = if host_ram_energy > 0.0 {
                    (s.ram_energy / host_ram_energy).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let energy = finite_or_zero(CPU_SHARE_WEIGHT * cpu_share + RAM_SHARE_WEIGHT * ram_share);

                let d_squared = match inv_cov {
                    Some(inv) => mahalanobis_squared((s.mean_cpu, s.mean_ram), baseline_mean, inv),
                    None => {
                        // Singular baseline covariance: fall back to the
                        // diagonal, i.e. per-metric robust z-scores squared
                        // and summed.
                        let zc = robust_z(s.mean_cpu, baseline_cpu_median, baseline_cpu_mad);
                        let zr = robust_z(s.mean_ram, baseline_ram_median, baseline_ram_mad);
                        zc * zc + zr * zr
                    }
                };
                let anomaly = finite_or_zero(1.0 - (-(d_squared) / ANOMALY_SCALE).exp());

                let correlation = finite_or_zero(cosine_similarity(&s.cpu_series, &host_cpu_series));

                let score = finite_or_zero(
                    WEIGHT_ANOMALY * anomaly + WEIGHT_ENERGY * energy + WEIGHT_CORRELATION * correlation,
                );

                if anomaly == 0.0 && energy == 0.0 && correlation == 0.0 {
                    return None;
                }

                Some(Suspect {
                    pid: s.pid,
                    name: s.name.clone(),
                    cmdline: s.cmdline.clone(),
                    anomaly,
                    energy,
                    correlation,
                    score,
                    cpu_share,
                    ram_share,
                })
            })
            .collect();

        suspects.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.cpu_share.partial_cmp(&a.cpu_share).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| b.ram_share.partial_cmp(&a.ram_share).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.pid.cmp(&b.pid))
        });
        suspects.truncate(self.cfg.max_suspects);
        suspects
    }

    /// Overall confidence for the top suspect, boosted when any single
    /// component is already strongly confident on its own.
    pub fn confidence(&self, suspects: &[Suspect]) -> f64 {
        let Some(top) = suspects.first() else {
            return 0.0;
        };
        let strong = top.anomaly >= 0.5 || top.energy >= 0.5 || top.correlation >= 0.5;
        if strong {
            (top.score * 1.25).min(1.0)
        } else {
            top.score
        }
    }
}

/// Covariance of two equal-length series around a given mean, used to build
/// the host baseline distribution the anomaly component measures against.
fn covariance_2d(a: &[f64], b: &[f64], mean: (f64, f64)) -> [[f64; 2]; 2] {
    let n = a.len().min(b.len()) as f64;
    if n < 2.0 {
        return [[1.0, 0.0], [0.0, 1.0]];
    }
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut cov_ab = 0.0;
    for (x, y) in a.iter().zip(b) {
        let dx = x - mean.0;
        let dy = y - mean.1;
        var_a += dx * dx;
        var_b += dy * dy;
        cov_ab += dx * dy;
    }
    [[var_a / n, cov_ab / n], [cov_ab / n, var_b / n]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::TelemetryAggregator;
    use crate::types::{Event, EventKind, ScalarValue};
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;

    struct FakeCounters {
        cpu_by_pid: StdHashMap<i32, f64>,
    }

    impl crate::aggregator::HostCounters for FakeCounters {
        fn cpu_total_pct(&mut self) -> f64 {
            60.0
        }
        fn ram_used_pct(&mut self) -> f64 {
            50.0
        }
        fn process_ram_pct(&mut self, pid: i32) -> Option<f64> {
            self.cpu_by_pid.get(&pid).copied()
        }
    }

    fn context_switch(pid: i32) -> Event {
        let mut payload = crate::types::Payload::new();
        payload.insert("new_pid".to_string(), ScalarValue::Int(pid as i64));
        Event {
            recv_ns: 0,
            wall_time: Utc::now(),
            kind: EventKind::ContextSwitch,
            pid: Some(pid),
            tid: Some(pid),
            cpu: None,
            provider: "test".to_string(),
            payload,
        }
    }

    #[test]
    fn hungry_pid_outranks_idle_pid() {
        let aggregator = TelemetryAggregator::new(300, 120, 120);
        let mut counters = FakeCounters {
            cpu_by_pid: [(100, 5.0), (200, 5.0)].into_iter().collect(),
        };

        for tick in 0..20 {
            // pid 100 monopolizes the scheduler; pid 200 barely runs.
            for _ in 0..9 {
                aggregator.ingest_event(context_switch(100));
            }
            aggregator.ingest_event(context_switch(200));
            aggregator.tick(Utc::now() + chrono::Duration::seconds(tick), 1, &mut counters, &crate::metrics::Metrics::new());
        }

        let ranker = PidRanker::new(RankerConfig::default(), 120);
        let suspects = ranker.rank(&aggregator);
        assert!(!suspects.is_empty());
        assert_eq!(suspects[0].pid, 100);
        assert!(suspects[0].score >= suspects.last().unwrap().score);
    }

    #[test]
    fn empty_aggregator_yields_no_suspects() {
        let aggregator = TelemetryAggregator::new(300, 120, 120);
        let ranker = PidRanker::new(RankerConfig::default(), 120);
        assert!(ranker.rank(&aggregator).is_empty());
        assert_eq!(ranker.confidence(&[]), 0.0);
    }

    #[test]
    fn invert_2x2_falls_back_on_singular_matrix() {
        let inv = invert_2x2([[0.0, 0.0], [0.0, 0.0]]);
        assert!(inv[0][0] > 0.0 && inv[1][1] > 0.0);
    }

    #[test]
    fn cosine_similarity_requires_minimum_overlap() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![1.0, 2.0, 3.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }
}

//! Spike Detector. Robust-Z baseline over a rolling window, a four-state
//! machine (Normal/Candidate/Confirmed/Cooling), a falling-edge trend
//! filter, and peak tracking. Tracks sustained pressure the way a
//! `pressure_start_time` per key, compared against a threshold duration,
//! would — generalized here from one series to a cpu/ram pair and a
//! four-state machine.

use chrono::{DateTime, Utc};

use crate::config::DetectorConfig;
use crate::types::{HostSample, SpikeState};

/// `ε` in the robust z-score, avoiding division collapse on quiet systems.
const MAD_EPS: f64 = 0.5;
const MAD_SCALE: f64 = 0.6745;

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Median and median absolute deviation of a sample set.
pub(crate) fn median_mad(values: &[f64]) -> (f64, f64) {
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let med = median(&sorted);
    let mut deviations: Vec<f64> = sorted.iter().map(|x| (x - med).abs()).collect();
    deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mad = median(&deviations);
    (med, mad)
}

/// Robust z-score: `0.6745 * (x - median) / max(MAD, eps)`.
pub fn robust_z(x: f64, median: f64, mad: f64) -> f64 {
    MAD_SCALE * (x - median) / mad.max(MAD_EPS)
}

/// A confirmed spike, handed to the ranker and RCA orchestrator at the
/// Normal->Confirmed edge.
#[derive(Debug, Clone)]
pub struct ConfirmedSpike {
    pub id: u64,
    pub detected_at: DateTime<Utc>,
    pub cpu_at_confirm: f64,
    pub ram_at_confirm: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// The outcome of feeding one new `HostSample` through the detector.
#[derive(Debug, Clone)]
pub struct DetectorOutcome {
    pub state: SpikeState,
    pub new_incident: Option<ConfirmedSpike>,
}

pub struct SpikeDetector {
    cfg: DetectorConfig,
    state: SpikeState,
    consecutive_triggers: u32,
    consecutive_non_triggers: u32,
    candidate_entered_at: Option<DateTime<Utc>>,
    cooling_since: Option<DateTime<Utc>>,
    peak_cpu: f64,
    peak_ram: f64,
    last_incident_at: Option<DateTime<Utc>>,
    next_id: u64,
    window_samples_at_confirm: usize,
}

impl SpikeDetector {
    pub fn new(cfg: DetectorConfig) -> Self {
        Self {
            cfg,
            state: SpikeState::Normal,
            consecutive_triggers: 0,
            consecutive_non_triggers: 0,
            candidate_entered_at: None,
            cooling_since: None,
            peak_cpu: 0.0,
            peak_ram: 0.0,
            last_incident_at: None,
            next_id: 1,
            window_samples_at_confirm: 0,
        }
    }

    pub fn state(&self) -> SpikeState {
        self.state
    }

    /// Process the latest sample against the window ending at it
    /// (`window.last()` is the new sample; the baseline is drawn from the
    /// preceding `baseline_seconds` samples).
    pub fn process(&mut self, window: &[HostSample]) -> DetectorOutcome {
        let Some(&latest) = window.last() else {
            return DetectorOutcome {
                state: self.state,
                new_incident: None,
            };
        };

        let baseline_len = self.cfg.baseline_seconds as usize;
        let history = &window[..window.len() - 1];
        let baseline_slice = if history.len() > baseline_len {
            &history[history.len() - baseline_len..]
        } else {
            history
        };

        // Cold-start suppression (B1): fewer than the minimum baseline
        // samples yields no triggers at all.
        if baseline_slice.len() < self.cfg.min_baseline_samples {
            return DetectorOutcome {
                state: self.state,
                new_incident: None,
            };
        }

        let cpu_values: Vec<f64> = baseline_slice.iter().map(|s| s.cpu_pct).collect();
        let ram_values: Vec<f64> = baseline_slice.iter().map(|s| s.ram_pct).collect();
        let (cpu_med, cpu_mad) = median_mad(&cpu_values);
        let (ram_med, ram_mad) = median_mad(&ram_values);

        let cpu_z = robust_z(latest.cpu_pct, cpu_med, cpu_mad);
        let ram_z = robust_z(latest.ram_pct, ram_med, ram_mad);

        let z_trigger = cpu_z >= self.cfg.z_threshold || ram_z >= self.cfg.z_threshold;
        let floor_trigger = latest.cpu_pct >= self.cfg.cpu_floor || latest.ram_pct >= self.cfg.ram_floor;
        let triggered = z_trigger && floor_trigger;

        let falling_edge = is_falling_edge(window);

        let mut new_incident = None;

        match self.state {
            SpikeState::Normal => {
                if triggered && !falling_edge {
                    self.state = SpikeState::Candidate;
                    self.candidate_entered_at = Some(latest.wall_time);
                    self.consecutive_triggers = 1;
                    self.consecutive_non_triggers = 0;
                    self.peak_cpu = latest.cpu_pct;
                    self.peak_ram = latest.ram_pct;
                }
            }
            SpikeState::Candidate => {
                if triggered {
                    self.consecutive_triggers += 1;
                    self.peak_cpu = self.peak_cpu.max(latest.cpu_pct);
                    self.peak_ram = self.peak_ram.max(latest.ram_pct);
                    if self.consecutive_triggers >= self.cfg.persistence_samples {
                        let id = self.next_id;
                        self.next_id += 1;
                        let window_start =
                            latest.wall_time - chrono::Duration::seconds(60);
                        let incident = ConfirmedSpike {
                            id,
                            detected_at: latest.wall_time,
                            cpu_at_confirm: self.peak_cpu,
                            ram_at_confirm: self.peak_ram,
                            window_start,
                            window_end: latest.wall_time,
                        };
                        self.last_incident_at = Some(latest.wall_time);
                        self.state = SpikeState::Confirmed;
                        self.consecutive_non_triggers = 0;
                        new_incident = Some(incident);
                    }
                } else {
                    // B2: a single/short-lived spike that never reaches
                    // persistence falls back to Normal.
                    self.state = SpikeState::Normal;
                    self.consecutive_triggers = 0;
                    self.candidate_entered_at = None;
                }
            }
            SpikeState::Confirmed => {
                self.peak_cpu = self.peak_cpu.max(latest.cpu_pct);
                self.peak_ram = self.peak_ram.max(latest.ram_pct);
                if triggered {
                    self.consecutive_non_triggers = 0;
                } else {
                    self.consecutive_non_triggers += 1;
                    if self.consecutive_non_triggers >= self.cfg.cooldown_samples {
                        self.state = SpikeState::Cooling;
                        self.cooling_since = Some(latest.wall_time);
                    }
                }
            }
            SpikeState::Cooling => {
                if triggered {
                    // Re-trigger during cooling returns to Confirmed. A new
                    // incident is created only if we are past the debounce
                    // gap since the last one.
                    self.state = SpikeState::Confirmed;
                    self.cooling_since = None;
                    self.consecutive_non_triggers = 0;
                    self.peak_cpu = self.peak_cpu.max(latest.cpu_pct);
                    self.peak_ram = self.peak_ram.max(latest.ram_pct);

                    let past_gap = self.last_incident_at.is_none_or(|t| {
                        (latest.wall_time - t).num_seconds()
                            >= self.cfg.min_incident_gap_seconds as i64
                    });
                    if past_gap {
                        let id = self.next_id;
                        self.next_id += 1;
                        let window_start = latest.wall_time - chrono::Duration::seconds(60);
                        let incident = ConfirmedSpike {
                            id,
                            detected_at: latest.wall_time,
                            cpu_at_confirm: self.peak_cpu,
                            ram_at_confirm: self.peak_ram,
                            window_start,
                            window_end: latest.wall_time,
                        };
                        self.last_incident_at = Some(latest.wall_time);
                        new_incident = Some(incident);
                    }
                } else if let Some(since) = self.cooling_since {
                    if (latest.wall_time - since).num_seconds()
                        >= self.cfg.cooling_seconds as i64
                    {
                        self.state = SpikeState::Normal;
                        self.cooling_since = None;
                        self.peak_cpu = 0.0;
                        self.peak_ram = 0.0;
                    }
                }
            }
        }

        DetectorOutcome {
            state: self.state,
            new_incident,
        }
    }
}

/// Trend filter: first derivative of cpu and ram over the last 5 samples
/// is negative for both metrics (a falling edge).
fn is_falling_edge(window: &[HostSample]) -> bool {
    if window.len() < 5 {
        return false;
    }
    let recent = &window[window.len() - 5..];
    let cpu_slope = recent.last().unwrap().cpu_pct - recent.first().unwrap().cpu_pct;
    let ram_slope = recent.last().unwrap().ram_pct - recent.first().unwrap().ram_pct;
    cpu_slope < 0.0 && ram_slope < 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(t: DateTime<Utc>, cpu: f64, ram: f64) -> HostSample {
        HostSample {
            wall_time: t,
            cpu_pct: cpu,
            ram_pct: ram,
        }
    }

    fn run_series(detector: &mut SpikeDetector, cpu_ram: &[(f64, f64)]) -> Vec<DetectorOutcome> {
        let base = Utc::now();
        let mut window = Vec::new();
        let mut outcomes = Vec::new();
        for (i, (cpu, ram)) in cpu_ram.iter().enumerate() {
            window.push(sample(base + chrono::Duration::seconds(i as i64), *cpu, *ram));
            outcomes.push(detector.process(&window));
        }
        outcomes
    }

    #[test]
    fn cold_start_suppresses_triggers_below_min_baseline_samples() {
        let mut detector = SpikeDetector::new(DetectorConfig::default());
        let mut series = vec![(5.0, 30.0); 20];
        series.push((99.0, 99.0));
        let outcomes = run_series(&mut detector, &series);
        assert!(outcomes.iter().all(|o| o.new_incident.is_none()));
        assert_eq!(outcomes.last().unwrap().state, SpikeState::Normal);
    }

    #[test]
    fn steady_idle_then_sustained_spike_confirms_one_incident() {
        let mut detector = SpikeDetector::new(DetectorConfig::default());
        let mut series: Vec<(f64, f64)> = (0..180).map(|i| (5.0 + (i % 5) as f64 * 0.5, 30.0)).collect();
        for _ in 0..6 {
            series.push((95.0, 40.0));
        }
        let outcomes = run_series(&mut detector, &series);
        let confirmed: Vec<_> = outcomes.iter().filter_map(|o| o.new_incident.clone()).collect();
        assert_eq!(confirmed.len(), 1);
        assert!(confirmed[0].cpu_at_confirm >= 95.0);
    }

    #[test]
    fn flapping_spike_never_confirms() {
        let mut detector = SpikeDetector::new(DetectorConfig::default());
        let mut series: Vec<(f64, f64)> = (0..180).map(|_| (5.0, 30.0)).collect();
        for i in 0..6 {
            series.push(if i % 2 == 0 { (95.0, 30.0) } else { (20.0, 30.0) });
        }
        let outcomes = run_series(&mut detector, &series);
        assert!(outcomes.iter().all(|o| o.new_incident.is_none()));
    }

    #[test]
    fn constant_saturation_has_zero_mad_and_no_new_incident() {
        let mut detector = SpikeDetector::new(DetectorConfig::default());
        let series = vec![(100.0, 40.0); 150];
        let outcomes = run_series(&mut detector, &series);
        assert!(outcomes.iter().all(|o| o.new_incident.is_none()));
    }

    #[test]
    fn debounce_prevents_second_incident_within_gap() {
        let mut cfg = DetectorConfig::default();
        cfg.cooling_seconds = 2;
        cfg.cooldown_samples = 2;
        let mut detector = SpikeDetector::new(cfg);

        let mut series: Vec<(f64, f64)> = (0..60).map(|_| (5.0, 30.0)).collect();
        series.extend(vec![(95.0, 30.0); 4]); // confirm
        series.extend(vec![(5.0, 30.0); 3]); // cooldown -> cooling
        series.extend(vec![(95.0, 30.0); 4]); // re-trigger within gap

        let outcomes = run_series(&mut detector, &series);
        let confirmed: Vec<_> = outcomes.iter().filter_map(|o| o.new_incident.clone()).collect();
        assert_eq!(confirmed.len(), 1);
    }

    #[test]
    fn median_mad_of_constant_series_is_zero() {
        let values = vec![100.0; 40];
        let (med, mad) = median_mad(&values);
        assert_eq!(med, 100.0);
        assert_eq!(mad, 0.0);
        assert_eq!(robust_z(100.0, med, mad), 0.0);
    }
}

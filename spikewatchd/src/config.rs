//! Process-wide configuration. Loaded once at startup into an immutable
//! snapshot: reads a TOML file with an env-var override and falls back to
//! defaults on any read/parse failure.

use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/spikewatch/spikewatch.toml";
const ENV_CONFIG_PATH: &str = "SPIKEWATCH_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub ranker: RankerConfig,
    #[serde(default)]
    pub reasoner: ReasonerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `SPIKEWATCH_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&PathBuf::from(path))
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregatorConfig {
    #[serde(default = "default_host_window_seconds")]
    pub host_window_seconds: u64,
    #[serde(default = "default_pid_window_seconds")]
    pub pid_window_seconds: u64,
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_pid_evict_seconds")]
    pub pid_evict_seconds: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            host_window_seconds: default_host_window_seconds(),
            pid_window_seconds: default_pid_window_seconds(),
            tick_seconds: default_tick_seconds(),
            pid_evict_seconds: default_pid_evict_seconds(),
        }
    }
}

fn default_host_window_seconds() -> u64 {
    300
}
fn default_pid_window_seconds() -> u64 {
    120
}
fn default_tick_seconds() -> u64 {
    1
}
fn default_pid_evict_seconds() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_baseline_seconds")]
    pub baseline_seconds: u64,
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,
    #[serde(default = "default_cpu_floor")]
    pub cpu_floor: f64,
    #[serde(default = "default_ram_floor")]
    pub ram_floor: f64,
    #[serde(default = "default_persistence_samples")]
    pub persistence_samples: u32,
    #[serde(default = "default_cooldown_samples")]
    pub cooldown_samples: u32,
    #[serde(default = "default_cooling_seconds")]
    pub cooling_seconds: u64,
    #[serde(default = "default_min_incident_gap_seconds")]
    pub min_incident_gap_seconds: u64,
    #[serde(default = "default_min_baseline_samples")]
    pub min_baseline_samples: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            baseline_seconds: default_baseline_seconds(),
            z_threshold: default_z_threshold(),
            cpu_floor: default_cpu_floor(),
            ram_floor: default_ram_floor(),
            persistence_samples: default_persistence_samples(),
            cooldown_samples: default_cooldown_samples(),
            cooling_seconds: default_cooling_seconds(),
            min_incident_gap_seconds: default_min_incident_gap_seconds(),
            min_baseline_samples: default_min_baseline_samples(),
        }
    }
}

fn default_baseline_seconds() -> u64 {
    120
}
fn default_z_threshold() -> f64 {
    3.0
}
fn default_cpu_floor() -> f64 {
    70.0
}
fn default_ram_floor() -> f64 {
    80.0
}
fn default_persistence_samples() -> u32 {
    3
}
fn default_cooldown_samples() -> u32 {
    5
}
fn default_cooling_seconds() -> u64 {
    30
}
fn default_min_incident_gap_seconds() -> u64 {
    60
}
fn default_min_baseline_samples() -> usize {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RankerConfig {
    #[serde(default = "default_attribution_window_seconds")]
    pub attribution_window_seconds: u64,
    #[serde(default = "default_max_suspects")]
    pub max_suspects: usize,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            attribution_window_seconds: default_attribution_window_seconds(),
            max_suspects: default_max_suspects(),
        }
    }
}

fn default_attribution_window_seconds() -> u64 {
    60
}
fn default_max_suspects() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReasonerConfig {
    #[serde(default = "default_reasoner_enabled")]
    pub enabled: bool,
    #[serde(default = "default_reasoner_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_reasoner_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_reasoner_retries")]
    pub retries: u32,
    #[serde(default = "default_reasoner_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_reasoner_events_sample")]
    pub events_sample: usize,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            enabled: default_reasoner_enabled(),
            endpoint: default_reasoner_endpoint(),
            timeout_seconds: default_reasoner_timeout_seconds(),
            retries: default_reasoner_retries(),
            queue_depth: default_reasoner_queue_depth(),
            events_sample: default_reasoner_events_sample(),
        }
    }
}

fn default_reasoner_enabled() -> bool {
    true
}
fn default_reasoner_endpoint() -> String {
    "http://127.0.0.1:4100/v1/rca".to_string()
}
fn default_reasoner_timeout_seconds() -> u64 {
    20
}
fn default_reasoner_retries() -> u32 {
    2
}
fn default_reasoner_queue_depth() -> usize {
    16
}
fn default_reasoner_events_sample() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_incident_retention")]
    pub incident_retention: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            incident_retention: default_incident_retention(),
        }
    }
}

fn default_incident_retention() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:4099".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Config::default();
        assert_eq!(cfg.aggregator.host_window_seconds, 300);
        assert_eq!(cfg.aggregator.pid_window_seconds, 120);
        assert_eq!(cfg.detector.baseline_seconds, 120);
        assert_eq!(cfg.detector.z_threshold, 3.0);
        assert_eq!(cfg.detector.cpu_floor, 70.0);
        assert_eq!(cfg.detector.ram_floor, 80.0);
        assert_eq!(cfg.detector.persistence_samples, 3);
        assert_eq!(cfg.detector.cooldown_samples, 5);
        assert_eq!(cfg.detector.cooling_seconds, 30);
        assert_eq!(cfg.detector.min_incident_gap_seconds, 60);
        assert_eq!(cfg.store.incident_retention, 200);
        assert_eq!(cfg.reasoner.timeout_seconds, 20);
        assert_eq!(cfg.reasoner.retries, 2);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load_from(std::path::Path::new("/nonexistent/spikewatch.toml"));
        assert_eq!(cfg.detector.z_threshold, 3.0);
    }

    #[test]
    fn parses_partial_toml_with_defaults_for_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spikewatch.toml");
        std::fs::write(&path, "[detector]\nz_threshold = 4.5\n").unwrap();
        let cfg = Config::load_from(&path);
        assert_eq!(cfg.detector.z_threshold, 4.5);
        assert_eq!(cfg.detector.cpu_floor, 70.0);
    }
}

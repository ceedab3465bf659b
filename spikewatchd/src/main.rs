use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

mod aggregator;
mod api;
mod config;
mod detector;
mod ingest;
mod metrics;
mod ranker;
mod rca;
mod store;
mod types;

use aggregator::{SysinfoCounters, TelemetryAggregator};
use config::Config;
use detector::SpikeDetector;
use ingest::EventSource;
use metrics::Metrics;
use ranker::PidRanker;
use rca::RcaOrchestrator;
use store::IncidentStore;

#[derive(Parser, Debug)]
#[command(name = "spikewatchd", about = "Telemetry spike watcher and RCA daemon")]
struct Args {
    /// Path to the TOML configuration file. Overrides SPIKEWATCH_CONFIG.
    #[arg(long, env = "SPIKEWATCH_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Command that streams line-delimited tracer JSON on stdout.
    #[arg(long, default_value = "spikewatch-tracer")]
    tracer_cmd: String,

    /// How long tasks have to observe a shutdown signal and exit.
    #[arg(long, default_value_t = 5)]
    shutdown_deadline_seconds: u64,
}

const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_TRACER_UNRECOVERABLE: i32 = 3;
const EXIT_FATAL: i32 = 4;

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };

    info!("[spikewatchd] starting, bind={}", config.api.bind_addr);

    let metrics = Arc::new(Metrics::new());
    let aggregator = Arc::new(TelemetryAggregator::new(
        config.aggregator.host_window_seconds,
        config.aggregator.pid_window_seconds as usize,
        config.aggregator.pid_evict_seconds,
    ));
    let store = Arc::new(IncidentStore::new(config.store.incident_retention));
    let rca_orchestrator = Arc::new(RcaOrchestrator::spawn(config.reasoner.clone(), metrics.clone()));

    let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));

    // T1: the tracer reader task.
    let event_queue = Arc::new(ingest::EventQueue::new(ingest::QUEUE_CAPACITY));
    let event_source = Arc::new(EventSource::new(event_queue.clone(), metrics.clone()));
    let cancel_handle = event_source.cancel_handle();

    // TracerLost recovery: backoff 1 -> 2 -> 4 -> 8s, capped at 60s; exit 3
    // after 10 consecutive failed restarts.
    const TRACER_MAX_RESTARTS: u32 = 10;
    const TRACER_MAX_BACKOFF_SECS: u64 = 60;

    let tracer_cmd = args.tracer_cmd.clone();
    let t1_source = event_source.clone();
    let t1 = tokio::spawn(async move {
        let mut consecutive_failures: u32 = 0;
        loop {
            if cancel_handle.load(Ordering::Relaxed) {
                break;
            }
            match tokio::process::Command::new(&tracer_cmd)
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(mut child) => {
                    consecutive_failures = 0;
                    if let Some(stdout) = child.stdout.take() {
                        t1_source.run(stdout).await;
                    }
                    let _ = child.wait().await;
                }
                Err(err) => {
                    error!("[spikewatchd] failed to spawn tracer {tracer_cmd}: {err}");
                }
            }
            if cancel_handle.load(Ordering::Relaxed) {
                break;
            }

            consecutive_failures += 1;
            if consecutive_failures > TRACER_MAX_RESTARTS {
                error!("[spikewatchd] tracer unrecoverable after {TRACER_MAX_RESTARTS} restarts");
                std::process::exit(EXIT_TRACER_UNRECOVERABLE);
            }
            let backoff = (1u64 << consecutive_failures.min(6)).min(TRACER_MAX_BACKOFF_SECS);
            warn!("[spikewatchd] tracer stream lost, retrying in {backoff}s");
            tokio::time::sleep(Duration::from_secs(backoff)).await;
        }
    });

    // The 1 Hz ticker driving the aggregator and the spike detector on the
    // same task, sharing its thread to avoid a hop between them.
    let t2_aggregator = aggregator.clone();
    let t2_store = store.clone();
    let t2_rca = rca_orchestrator.clone();
    let t2_metrics = metrics.clone();
    let t2_shutdown = shutdown.clone();
    let detector_cfg = config.detector.clone();
    let ranker_cfg = config.ranker.clone();
    let baseline_seconds = config.detector.baseline_seconds;
    let host_window_seconds = config.aggregator.host_window_seconds;
    let t2 = tokio::spawn(async move {
        let mut counters = SysinfoCounters::default();
        let mut detector = SpikeDetector::new(detector_cfg);
        let ranker = PidRanker::new(ranker_cfg, baseline_seconds);
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        loop {
            interval.tick().await;
            if t2_shutdown.load(Ordering::Relaxed) {
                break;
            }

            for event in event_queue.drain() {
                t2_aggregator.ingest_event(event);
            }

            let _ = t2_aggregator.tick(chrono::Utc::now(), 1.0, &mut counters, &t2_metrics);
            let host_window = t2_aggregator.host_window(host_window_seconds);

            let outcome = detector.process(&host_window);
            if let Some(confirmed) = outcome.new_incident {
                t2_metrics.inc_incident_confirmed();
                let suspects = ranker.rank(&t2_aggregator);
                let events = t2_aggregator.recent_events(500);
                t2_store
                    .insert(
                        confirmed.id,
                        confirmed.detected_at,
                        confirmed.cpu_at_confirm,
                        confirmed.ram_at_confirm,
                        confirmed.window_start,
                        confirmed.window_end,
                        events,
                        suspects,
                    )
                    .await;

                // Ranking already ran inline above; it is cheap enough at
                // N<=200 pids not to need the blocking pool in practice, but
                // stays a pure, allocation-light pass so it never stalls
                // this ticker. The RCA request is dispatched onto the
                // single-flight worker on its own task so a slow LLM call
                // never blocks the next tick.
                let store_for_rca = t2_store.clone();
                let rca_for_task = t2_rca.clone();
                let incident_id = confirmed.id;
                tokio::spawn(async move {
                    if let Some(incident) = store_for_rca.get(incident_id).await {
                        let report = rca_for_task.analyze(&incident).await;
                        store_for_rca.update_rca(incident_id, report).await;
                    }
                });
            }
        }
    });

    // The read-API adapter.
    let app_state = Arc::new(api::AppState {
        aggregator: aggregator.clone(),
        store: store.clone(),
        metrics: metrics.clone(),
    });
    let router = api::router(app_state);
    let listener = match TcpListener::bind(&config.api.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("[spikewatchd] failed to bind {}: {err}", config.api.bind_addr);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };
    info!("[spikewatchd] read API listening on http://{}", config.api.bind_addr);
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            error!("[spikewatchd] http server error: {err}");
        }
    });

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            error!("[spikewatchd] failed to install SIGTERM handler: {err}");
            std::process::exit(EXIT_FATAL);
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("[spikewatchd] ctrl-c received, shutting down");
        }
        _ = sigterm.recv() => {
            info!("[spikewatchd] SIGTERM received, shutting down");
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    event_source.cancel_handle().store(true, Ordering::Relaxed);

    let deadline = Duration::from_secs(args.shutdown_deadline_seconds);
    if tokio::time::timeout(deadline, async {
        let _ = t1.await;
        let _ = t2.await;
    })
    .await
    .is_err()
    {
        warn!("[spikewatchd] graceful shutdown deadline exceeded, forcing exit");
    }
    server.abort();

    info!("[spikewatchd] shutdown complete");
}

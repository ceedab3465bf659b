//! Read API Adapter. A thin, read-only axum surface over the aggregator
//! and incident store: an `AppState`/`Router` pair, narrowed to the
//! handful of GET routes this daemon exposes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregator::TelemetryAggregator;
use crate::metrics::Metrics;
use crate::store::IncidentStore;
use crate::types::SpikeIncident;

pub struct AppState {
    pub aggregator: Arc<TelemetryAggregator>,
    pub store: Arc<IncidentStore>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/spikes", get(list_spikes))
        .route("/api/spikes/{id}", get(get_spike))
        .route("/api/latest-rca", get(latest_rca))
        .route("/api/events", get(recent_events))
        .route("/api/telemetry/window", get(telemetry_window))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[derive(Debug, Deserialize)]
struct SpikesQuery {
    limit: Option<usize>,
    since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct SpikesResponse {
    spikes: Vec<SpikeIncident>,
}

async fn list_spikes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SpikesQuery>,
) -> Json<SpikesResponse> {
    let limit = query.limit.unwrap_or(50);
    Json(SpikesResponse {
        spikes: state.store.list(limit, query.since).await,
    })
}

async fn get_spike(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<SpikeIncident>, StatusCode> {
    state
        .store
        .get(id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
struct LatestRcaResponse {
    latest_rca: Option<crate::types::RcaReport>,
}

async fn latest_rca(State(state): State<Arc<AppState>>) -> Json<LatestRcaResponse> {
    let latest_rca = state.store.latest_rca().await.map(|(_, rca)| rca);
    Json(LatestRcaResponse { latest_rca })
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

/// `/api/events?limit=N` caps at 500 regardless of what the caller asks for.
const MAX_EVENTS_LIMIT: usize = 500;

#[derive(Debug, Serialize)]
struct EventsResponse {
    events: Vec<crate::types::Event>,
}

async fn recent_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<EventsResponse> {
    let limit = query.limit.unwrap_or(100).min(MAX_EVENTS_LIMIT);
    Json(EventsResponse {
        events: state.aggregator.recent_events(limit),
    })
}

#[derive(Debug, Deserialize)]
struct TelemetryWindowQuery {
    seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
struct TelemetrySample {
    ts: DateTime<Utc>,
    cpu: f64,
    ram: f64,
}

#[derive(Debug, Serialize)]
struct TelemetryResponse {
    samples: Vec<TelemetrySample>,
}

async fn telemetry_window(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TelemetryWindowQuery>,
) -> Json<TelemetryResponse> {
    let seconds = query.seconds.unwrap_or(300);
    let samples = state
        .aggregator
        .host_window(seconds)
        .into_iter()
        .map(|s| TelemetrySample {
            ts: s.wall_time,
            cpu: s.cpu_pct,
            ram: s.ram_pct,
        })
        .collect();
    Json(TelemetryResponse { samples })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            aggregator: Arc::new(TelemetryAggregator::new(300, 120, 120)),
            store: Arc::new(IncidentStore::new(200)),
            metrics: Arc::new(Metrics::new()),
        })
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_spike_on_unknown_id_is_not_found() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/spikes/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn latest_rca_with_no_incidents_is_null_not_an_error() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/latest-rca").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(parsed["latest_rca"].is_null());
    }

    #[tokio::test]
    async fn list_spikes_returns_inserted_incident() {
        let state = test_state();
        let id = state.store.next_id();
        state
            .store
            .insert(id, Utc::now(), 95.0, 40.0, Utc::now(), Utc::now(), Vec::new(), Vec::new())
            .await;
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/api/spikes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

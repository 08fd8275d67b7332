//! Operational HTTP endpoints

use axum::{extract::State, response::Json, routing::get, Router};
use sensedb_core::ingest::TelemetryIngestor;
use sensedb_core::queue::QueueStatsSnapshot;
use sensedb_core::retention::{RetentionEngine, RetentionStatus};
use sensedb_core::store::{MemoryStores, RecognitionStore, TimeseriesStore};
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub stores: MemoryStores,
    pub ingestor: Arc<TelemetryIngestor>,
    pub retention: Arc<RetentionEngine>,
    pub started_at: Instant,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/status", get(status))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub can_save_data: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_secs: u64,
    pub timeseries_points: usize,
    pub recognition_records: usize,
    pub queues: Vec<QueueStatsResponse>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub name: String,
    pub shards: usize,
    pub pending: u64,
    #[serde(flatten)]
    pub counters: QueueStatsSnapshot,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let can_save_data = state.retention.state().can_save_data();
    Json(HealthResponse {
        status: if can_save_data { "ok" } else { "degraded" }.to_string(),
        version: sensedb_core::VERSION.to_string(),
        can_save_data,
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn status(State(state): State<AppState>) -> Json<RetentionStatus> {
    Json(state.retention.state().status())
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(collect_stats(&state))
}

fn collect_stats(state: &AppState) -> StatsResponse {
    let ingestor = &state.ingestor;
    let queue = |name: &str, shards: usize, counters: QueueStatsSnapshot| QueueStatsResponse {
        name: name.to_string(),
        shards,
        pending: counters.pending(),
        counters,
    };

    StatsResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        timeseries_points: state.stores.timeseries.len(),
        recognition_records: state.stores.recognitions.len(),
        queues: vec![
            queue(
                ingestor.points_queue().name(),
                ingestor.points_queue().shard_count(),
                ingestor.points_queue().stats(),
            ),
            queue(
                ingestor.recognition_queue().name(),
                ingestor.recognition_queue().shard_count(),
                ingestor.recognition_queue().stats(),
            ),
        ],
    }
}

async fn metrics(State(state): State<AppState>) -> String {
    let stats = collect_stats(&state);
    let retention = state.retention.state().status();

    // Prometheus format
    let mut output = String::new();
    let mut gauge = |name: &str, help: &str, value: u64| {
        let _ = writeln!(output, "# HELP sensedb_{} {}", name, help);
        let _ = writeln!(output, "# TYPE sensedb_{} gauge", name);
        let _ = writeln!(output, "sensedb_{} {}", name, value);
    };

    gauge("timeseries_points", "Historical points held", stats.timeseries_points as u64);
    gauge("recognition_records", "Recognition records held", stats.recognition_records as u64);
    gauge("can_save_data", "1 while new data is admitted", retention.can_save_data as u64);
    gauge("retention_running", "1 while a retention sweep runs", retention.running as u64);
    gauge("space_available_gb", "Free space of the monitored volume", retention.space_available_gb);
    gauge("space_total_gb", "Size of the monitored volume", retention.space_total_gb);
    gauge("retention_rounds_executed", "Sweeps since the alarm was raised", retention.rounds_executed.max(0) as u64);
    gauge("retention_deleted_rows", "Frames deleted by the last sweep", retention.deleted_count);

    for q in &stats.queues {
        let _ = writeln!(output, "sensedb_queue_enqueued_total{{queue=\"{}\"}} {}", q.name, q.counters.enqueued);
        let _ = writeln!(output, "sensedb_queue_persisted_total{{queue=\"{}\"}} {}", q.name, q.counters.persisted);
        let _ = writeln!(output, "sensedb_queue_failed_total{{queue=\"{}\"}} {}", q.name, q.counters.failed);
        let _ = writeln!(output, "sensedb_queue_pending{{queue=\"{}\"}} {}", q.name, q.pending);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use sensedb_core::config::{QueueConfig, RetentionConfig};
    use sensedb_core::retention::{FixedProbe, NoopCompactor, RetentionState};
    use sensedb_core::{EntityId, TsKvEntry};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app_state() -> AppState {
        let stores = MemoryStores::new();
        let state = RetentionState::new();
        let config = QueueConfig {
            stats_print_interval_ms: 0,
            max_batch_delay_ms: 5,
            ..Default::default()
        };
        let ingestor = Arc::new(TelemetryIngestor::start(&config, &stores, state.clone()));
        let retention = Arc::new(RetentionEngine::new(
            RetentionConfig::default(),
            state,
            Arc::new(FixedProbe::gb(50, 100)),
            Arc::new(NoopCompactor),
            stores.recognitions.clone(),
            stores.timeseries.clone(),
        ));
        AppState {
            stores,
            ingestor,
            retention,
            started_at: Instant::now(),
        }
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_admission() {
        let state = app_state();
        let (status, body) = get_body(create_router(state.clone()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"status\":\"ok\""));

        state.retention.state().set_can_save_data(false);
        let (_, body) = get_body(create_router(state), "/health").await;
        assert!(body.contains("\"status\":\"degraded\""));
    }

    #[tokio::test]
    async fn test_stats_and_metrics_count_writes() {
        let state = app_state();
        let entity = EntityId::device(Uuid::now_v7());
        state
            .ingestor
            .ingest(Uuid::nil(), entity, vec![TsKvEntry::new("image", 1, "f")], 0, true)
            .await
            .unwrap();

        let (_, body) = get_body(create_router(state.clone()), "/stats").await;
        let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(stats["timeseries_points"], 1);
        assert_eq!(stats["queues"][0]["name"], "timeseries");
        assert_eq!(stats["queues"][0]["persisted"], 1);

        let (_, body) = get_body(create_router(state), "/metrics").await;
        assert!(body.contains("sensedb_timeseries_points 1"));
        assert!(body.contains("sensedb_queue_persisted_total{queue=\"timeseries\"} 1"));
    }

    #[tokio::test]
    async fn test_status_is_camel_case() {
        let (_, body) = get_body(create_router(app_state()), "/status").await;
        assert!(body.contains("\"canSaveData\":true"));
        assert!(body.contains("\"roundsExecuted\":0"));
    }
}

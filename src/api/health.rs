// =============================================================================
// Health + Metrics endpoints — Axum 0.7
// =============================================================================
//
// /health/live   — OK as long as the server answers. No dependency checks.
// /health/ready  — OK iff the store answers and at least one data source is
//                  registered; every dependency check is wrapped in a 5 s
//                  timeout and a timeout reports `degraded` instead of
//                  hanging the probe.
// /metrics       — Prometheus text exposition.
// /api/v1/state  — operational snapshot for dashboards and the on-call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::generator::SignalGenerator;
use crate::metrics::Metrics;
use crate::rejected::RejectedSignalQueue;
use crate::sources::SourceRegistry;
use crate::store::SignalStore;

const DEPENDENCY_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthState {
    pub generator: Arc<SignalGenerator>,
    pub store: Arc<SignalStore>,
    pub registry: Arc<SourceRegistry>,
    pub rejected_queue: Arc<RejectedSignalQueue>,
    pub metrics: Arc<Metrics>,
    pub start_time: Instant,
}

pub fn health_router(state: Arc<HealthState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/api/v1/state", get(engine_state))
        .layer(cors)
        .with_state(state)
}

async fn live() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn ready(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let mut degraded: Vec<&str> = Vec::new();

    // Store check: a trivial query, off the async runtime.
    let store = state.store.clone();
    let store_check = tokio::time::timeout(
        DEPENDENCY_CHECK_TIMEOUT,
        tokio::task::spawn_blocking(move || store.count()),
    )
    .await;
    match store_check {
        Ok(Ok(Ok(_))) => {}
        _ => {
            warn!("readiness: store check failed or timed out");
            degraded.push("store");
        }
    }

    // At least one data source must be registered and enabled.
    if state.registry.is_empty() {
        degraded.push("sources");
    }

    if degraded.is_empty() {
        (StatusCode::OK, Json(serde_json::json!({"status": "ready"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "degraded", "failing": degraded})),
        )
            .into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    state.metrics.encode()
}

async fn engine_state(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let stored = state.store.count().unwrap_or(0);
    Json(serde_json::json!({
        "generator_state": state.generator.state().to_string(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "pending_batch": state.store.pending_len(),
        "stored_signals": stored,
        "rejected_queue_depth": state.rejected_queue.depth(),
        "sources_registered": state.registry.len(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::config::{Config, RejectedQueueParams};
    use crate::distributor::Distributor;
    use crate::quality::Calibrator;
    use crate::regime::RegimeDetector;
    use crate::sources::market_data::{FallbackFeed, MarketDataFeed, SimMarketFeed};
    use tower::ServiceExt;

    fn health_state(with_sources: bool) -> Arc<HealthState> {
        let mut config = Config::default();
        if with_sources {
            config.sources = vec![crate::config::SourceConfig {
                id: "sim".into(),
                weight: 0.5,
                rate_limit_per_sec: 10.0,
                cache_ttl_secs: 10,
                timeout_secs: 3,
                regular_session_only: false,
                enabled: true,
                api_key_name: None,
            }];
        }
        let registry = Arc::new(SourceRegistry::new(
            &config.sources,
            vec![Arc::new(crate::sources::sim::SimSource::new("sim"))
                as Arc<dyn crate::sources::DataSource>],
        ));
        let store = Arc::new(SignalStore::open_in_memory(50).unwrap());
        let audit = Arc::new(AuditLog::open_in_memory().unwrap());
        let metrics = Arc::new(Metrics::new());
        let (distributor, _rx) = Distributor::new(
            &[],
            |_| String::new(),
            Duration::from_secs(5),
            store.clone(),
            audit.clone(),
            metrics.clone(),
        );
        let generator = Arc::new(SignalGenerator::new(
            config.clone(),
            registry.clone(),
            Arc::new(FallbackFeed::new(
                Arc::new(SimMarketFeed::new("primary")) as Arc<dyn MarketDataFeed>,
                None,
            )),
            Arc::new(RegimeDetector::new(config.regime.clone())),
            store.clone(),
            audit.clone(),
            distributor,
            Calibrator::identity(),
            metrics.clone(),
        ));
        let rejected_queue = Arc::new(RejectedSignalQueue::new(
            RejectedQueueParams::default(),
            audit,
            metrics.clone(),
        ));
        Arc::new(HealthState {
            generator,
            store,
            registry,
            rejected_queue,
            metrics,
            start_time: Instant::now(),
        })
    }

    async fn get_status(router: Router, path: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(path)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    #[tokio::test]
    async fn live_never_checks_dependencies() {
        let router = health_router(health_state(false));
        let (status, body) = get_status(router, "/health/live").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("ok"));
    }

    #[tokio::test]
    async fn ready_degrades_without_sources() {
        let router = health_router(health_state(false));
        let (status, body) = get_status(router, "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("sources"));
    }

    #[tokio::test]
    async fn ready_ok_with_sources() {
        let router = health_router(health_state(true));
        let (status, _) = get_status(router, "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_scrape_renders() {
        let state = health_state(true);
        state.metrics.cycles_total.inc();
        let router = health_router(state);
        let (status, body) = get_status(router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("meridian_cycles_total"));
    }

    #[tokio::test]
    async fn engine_state_snapshot() {
        let router = health_router(health_state(true));
        let (status, body) = get_status(router, "/api/v1/state").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("generator_state"));
        assert!(body.contains("INIT"));
    }
}

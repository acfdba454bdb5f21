use crate::catalog::TierUsage;
use crate::config::ApiConfig;
use crate::health::{WorkerHealth, WorkerKey};
use crate::service::TieringService;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TieringService>,
}

/// Worker entry in the health response
#[derive(Debug, Serialize)]
pub struct DegradedWorker {
    #[serde(flatten)]
    pub key: WorkerKey,
    #[serde(flatten)]
    pub health: WorkerHealth,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub workers: usize,
    pub degraded: Vec<DegradedWorker>,
}

/// Usage of one tier for one camera
#[derive(Debug, Serialize)]
pub struct TierUsageResponse {
    pub tier: i32,
    pub path: PathBuf,
    pub terminal: bool,
    pub max_size_bytes: Option<u64>,
    #[serde(flatten)]
    pub usage: TierUsage,
}

#[derive(Debug, Serialize)]
pub struct ChainUsageResponse {
    pub category: String,
    pub camera_id: String,
    pub tiers: Vec<TierUsageResponse>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/tiers/:category/:camera_id", get(get_tier_usage))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint; 503 while any worker is degraded
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.service.health();
    let degraded: Vec<DegradedWorker> = health
        .degraded()
        .into_iter()
        .map(|(key, health)| DegradedWorker { key, health })
        .collect();

    let (code, status) = if degraded.is_empty() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status,
            workers: health.worker_count(),
            degraded,
        }),
    )
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.catalog().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Per-tier usage for one camera in one chain
#[instrument(skip(state))]
async fn get_tier_usage(
    State(state): State<AppState>,
    Path((category, camera_id)): Path<(String, String)>,
) -> Result<Json<ChainUsageResponse>, (StatusCode, Json<ErrorResponse>)> {
    let chain = state.service.chain(&category).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Unknown category {category}"),
                code: "UNKNOWN_CATEGORY".to_string(),
            }),
        )
    })?;

    let mut tiers = Vec::with_capacity(chain.len());
    for tier in chain.tiers() {
        let usage = state
            .service
            .catalog()
            .tier_usage(&category, &camera_id, tier.index)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to query tier usage");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: "Failed to query tier usage".to_string(),
                        code: "QUERY_ERROR".to_string(),
                    }),
                )
            })?;

        tiers.push(TierUsageResponse {
            tier: tier.index,
            path: tier.path.clone(),
            terminal: chain.is_terminal(tier.index),
            max_size_bytes: tier.limits.max_size,
            usage,
        });
    }

    Ok(Json(ChainUsageResponse {
        category,
        camera_id,
        tiers,
    }))
}

/// Start the API server; returns when `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting tiering API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, MemoryCatalog, NewRecording};
    use crate::events::BroadcastPublisher;
    use crate::health::HealthRegistry;
    use crate::service::TieringSettings;
    use crate::tier::{Tier, TierChain, TierLimits};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(catalog: &MemoryCatalog, health: HealthRegistry) -> AppState {
        let tier = |index: i32, path: &str| Tier {
            index,
            path: PathBuf::from(path),
            limits: TierLimits {
                max_size: Some(100),
                ..Default::default()
            },
            move_on_shutdown: false,
            poll_interval: Duration::from_secs(60),
        };
        let chain = TierChain::new("recorder", vec![tier(0, "/tmp/tier1"), tier(1, "/tmp/tier2")]);

        AppState {
            service: Arc::new(TieringService::new(
                vec![Arc::new(chain)],
                Arc::new(catalog.clone()),
                Arc::new(BroadcastPublisher::new(4)),
                health,
                TieringSettings::default(),
            )),
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_degraded_workers() {
        let catalog = MemoryCatalog::new();
        let health = HealthRegistry::new(1);
        let router = create_router(state(&catalog, health.clone()));

        let (status, body) = get(router.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let key = WorkerKey {
            camera_id: "cam1".to_string(),
            category: "recorder".to_string(),
            tier: 0,
        };
        health.record_failure(&key, "catalog down");

        let (status, body) = get(router, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["degraded"][0]["camera_id"], "cam1");
        assert_eq!(body["degraded"][0]["last_error"], "catalog down");
    }

    #[tokio::test]
    async fn test_readiness_follows_catalog() {
        let catalog = MemoryCatalog::new();
        let router = create_router(state(&catalog, HealthRegistry::new(3)));

        let (status, _) = get(router.clone(), "/ready").await;
        assert_eq!(status, StatusCode::OK);

        catalog.set_offline(true);
        let (status, body) = get(router, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");
    }

    #[tokio::test]
    async fn test_tier_usage() {
        let catalog = MemoryCatalog::new();
        catalog
            .insert(NewRecording {
                camera_id: "cam1".to_string(),
                category: "recorder".to_string(),
                path: "/tmp/tier1/cam1/seg1.mp4".to_string(),
                size_bytes: 150,
                created_at: Utc::now(),
                ended_at: None,
            })
            .await
            .unwrap();
        let router = create_router(state(&catalog, HealthRegistry::new(3)));

        let (status, body) = get(router.clone(), "/api/v1/tiers/recorder/cam1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tiers"][0]["total_bytes"], 150);
        assert_eq!(body["tiers"][0]["file_count"], 1);
        assert_eq!(body["tiers"][1]["terminal"], true);

        let (status, body) = get(router, "/api/v1/tiers/clips/cam1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_CATEGORY");
    }
}

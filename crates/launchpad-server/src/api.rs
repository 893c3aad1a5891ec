//! HTTP API for the orchestrator.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::{Json, Router};
use launchpad_core::protocol::{DeployRequest, HealthResponse};
use launchpad_core::PipelineError;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::orchestrator::{DeployResult, Orchestrator};

/// Shared application state for the orchestrator API.
pub struct AppState {
    /// The pipeline.
    pub orchestrator: Arc<Orchestrator>,
}

/// Creates the API router, allowing browser calls from `cors_origins`.
pub fn router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/deploy", get(deploy_query).post(deploy_body))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(allowed)
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

/// `GET /deploy?url=...`
async fn deploy_query(
    State(state): State<Arc<AppState>>,
    query: Result<Query<DeployRequest>, QueryRejection>,
) -> Result<Json<DeployResult>, PipelineError> {
    let Query(request) = query.map_err(|e| PipelineError::InvalidRequest(e.body_text()))?;
    deploy(&state, request).await
}

/// `POST /deploy {"url": ...}`
async fn deploy_body(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<Json<DeployResult>, PipelineError> {
    let Json(request) = payload.map_err(|e| PipelineError::InvalidRequest(e.body_text()))?;
    deploy(&state, request).await
}

async fn deploy(
    state: &AppState,
    request: DeployRequest,
) -> Result<Json<DeployResult>, PipelineError> {
    let url = request
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| PipelineError::InvalidRequest("missing url".to_owned()))?;

    match state.orchestrator.deploy(url).await {
        Ok(result) => {
            info!(repo = %result.repo, url = %result.public_url, "deploy completed");
            Ok(Json(result))
        }
        Err(e) => {
            error!(url = %url, kind = %e.kind(), error = %e, "deploy failed");
            Err(e)
        }
    }
}

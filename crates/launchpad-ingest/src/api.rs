//! HTTP API for the ingest service.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use launchpad_core::protocol::{HealthResponse, IngestRequest, IngestResponse};
use launchpad_core::PipelineError;
use tracing::{error, info};

use crate::stage::IngestStage;

/// Shared application state for the ingest service.
pub struct AppState {
    /// The ingest stage.
    pub stage: Arc<IngestStage>,
}

/// Creates the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/upload", post(upload))
        .with_state(state)
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

/// Fetch, pack and store a repository.
async fn upload(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<IngestResponse>, PipelineError> {
    let Json(request) = payload.map_err(|e| PipelineError::InvalidRequest(e.body_text()))?;

    match state.stage.ingest(&request.url).await {
        Ok(receipt) => {
            info!(repo = %receipt.repository, "upload completed");
            Ok(Json(IngestResponse::from(&receipt)))
        }
        Err(e) => {
            error!(url = %request.url, error = %e, "upload failed");
            Err(e)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use launchpad_core::testing::memory_store;
    use launchpad_core::{PipelineResult, Scratch, SourceUrl};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::fetch::SourceFetcher;
    use crate::stage::IngestSettings;

    struct TreeFetcher;

    #[async_trait]
    impl SourceFetcher for TreeFetcher {
        async fn fetch(&self, _url: &SourceUrl, dest: &Path) -> PipelineResult<()> {
            std::fs::write(dest.join("package.json"), "{}")?;
            Ok(())
        }
    }

    fn app(temp: &TempDir) -> Router {
        let stage = IngestStage::new(
            Arc::new(TreeFetcher),
            memory_store("bucket"),
            Scratch::new(temp.path()).unwrap(),
            IngestSettings {
                bucket: "bucket".into(),
                allowed_hosts: vec!["github.com".into()],
                exclude: vec![".git".into()],
            },
        );
        router(Arc::new(AppState {
            stage: Arc::new(stage),
        }))
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let temp = TempDir::new().unwrap();
        let response = app(&temp)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn upload_returns_receipt() {
        let temp = TempDir::new().unwrap();
        let response = app(&temp)
            .oneshot(post(r#"{"url":"https://github.com/org/widget"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["repo"], "widget");
        assert_eq!(body["bucket"], "bucket");
        assert_eq!(body["file"], "widget.zip");
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn invalid_url_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let response = app(&temp)
            .oneshot(post(r#"{"url":"https://evil.example/org/widget"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json(response).await;
        assert_eq!(body["kind"], "validation");
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let response = app(&temp).oneshot(post("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["kind"], "validation");
    }
}

//! HTTP API for the build service.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use launchpad_core::protocol::{BuildRequest, BuildResponse, HealthResponse};
use launchpad_core::{BuildJob, PipelineError, PipelineResult, RepositoryName, TemplateKind};
use tracing::{error, info, warn};

use crate::stage::BuildStage;

/// Shared application state for the build service.
pub struct AppState {
    /// The build stage.
    pub stage: Arc<BuildStage>,
    /// Template used when a request does not name one.
    pub default_template: TemplateKind,
}

/// Creates the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/build", post(build))
        .with_state(state)
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

/// Turn a wire request into a job, rejecting bad names and templates
/// before any lock or storage access.
pub fn bind_job(request: &BuildRequest, default_template: TemplateKind) -> PipelineResult<BuildJob> {
    let repository = RepositoryName::new(request.repo.trim())?;
    let template = match request.template.as_deref() {
        Some(raw) if !raw.trim().is_empty() => raw.parse()?,
        _ => default_template,
    };
    Ok(BuildJob {
        repository,
        use_template: request.use_template,
        template,
    })
}

/// Build a stored repository, or scaffold one from a template.
async fn build(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<BuildRequest>, JsonRejection>,
) -> Result<Json<BuildResponse>, PipelineError> {
    let Json(request) = payload.map_err(|e| PipelineError::InvalidRequest(e.body_text()))?;
    let job = bind_job(&request, state.default_template).inspect_err(|e| {
        warn!(repo = %request.repo, error = %e, "rejected build request");
    })?;

    match state.stage.build(&job).await {
        Ok(outcome) => {
            info!(repo = %outcome.repository, object = %outcome.artifact, "build completed");
            Ok(Json(BuildResponse::from(&outcome)))
        }
        Err(e) => {
            error!(repo = %job.repository, error = %e, "build failed");
            Err(e)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use launchpad_core::testing::{memory_store, ScriptedRunner};
    use launchpad_core::{CommandOutput, ErrorKind, Scratch, Toolchain, ToolchainConfig};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::lock::{BuildLocks, LockScope};
    use crate::stage::BuildSettings;

    fn app(temp: &TempDir) -> Router {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            let cwd = cmd.cwd.clone().unwrap();
            if cmd.program == "npx" {
                let dir = cwd.join(&cmd.args[1]);
                std::fs::create_dir_all(&dir).unwrap();
                std::fs::write(dir.join("package.json"), "{}").unwrap();
            } else if cmd.args.first().map(String::as_str) == Some("run") {
                std::fs::create_dir_all(cwd.join("build")).unwrap();
                std::fs::write(cwd.join("build/index.html"), "<html></html>").unwrap();
            }
            Ok(CommandOutput::success(""))
        }));
        let stage = BuildStage::new(
            memory_store("bucket"),
            Toolchain::new(runner, ToolchainConfig::default()).unwrap(),
            BuildLocks::new(LockScope::PerRepository),
            Scratch::new(temp.path()).unwrap(),
            BuildSettings {
                bucket: "bucket".into(),
                auto_template: false,
                scaffold_exclude: vec![".git".into(), "node_modules".into()],
            },
        );
        router(Arc::new(AppState {
            stage: Arc::new(stage),
            default_template: TemplateKind::CreateReactApp,
        }))
    }

    fn post(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/build")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
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
        assert_eq!(json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn missing_repository_is_not_found_with_hint() {
        let temp = TempDir::new().unwrap();
        let response = app(&temp)
            .oneshot(post(serde_json::json!({"repo": "widget"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json(response).await;
        assert_eq!(body["status"], "not_found");
        assert_eq!(body["kind"], "not_found");
        assert!(body["message"].as_str().unwrap().contains("use_template"));
    }

    #[tokio::test]
    async fn template_build_succeeds() {
        let temp = TempDir::new().unwrap();
        let response = app(&temp)
            .oneshot(post(serde_json::json!({"repo": "widget", "use_template": true})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["created_from"], "create-react-app");
        assert_eq!(body["file"], "widget-build.zip");
    }

    #[tokio::test]
    async fn traversal_name_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let response = app(&temp)
            .oneshot(post(serde_json::json!({"repo": "../etc"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "validation");
    }

    #[tokio::test]
    async fn unknown_template_is_configuration_error() {
        let temp = TempDir::new().unwrap();
        let response = app(&temp)
            .oneshot(post(
                serde_json::json!({"repo": "widget", "use_template": true, "template": "svelte"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["kind"], "configuration");
    }

    #[test]
    fn bind_job_applies_default_template() {
        let request = BuildRequest {
            repo: "widget".into(),
            use_template: true,
            template: None,
        };
        let job = bind_job(&request, TemplateKind::Vite).unwrap();
        assert_eq!(job.template, TemplateKind::Vite);

        let request = BuildRequest {
            template: Some("next".into()),
            ..request
        };
        assert_eq!(bind_job(&request, TemplateKind::Vite).unwrap().template, TemplateKind::Next);
    }

    #[test]
    fn bind_job_rejects_empty_name() {
        let request = BuildRequest {
            repo: "  ".into(),
            use_template: false,
            template: None,
        };
        assert_eq!(
            bind_job(&request, TemplateKind::default()).unwrap_err().kind(),
            ErrorKind::Validation
        );
    }
}

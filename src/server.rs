//! HTTP surface
//!
//! `/execute` submits and waits for the result; `/jobs` is the
//! asynchronous variant with polling and cancellation.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::core::{JobId, JobState};
use crate::error::SubmitError;
use crate::scheduler::{CancelStatus, ResultStatus, Scheduler, SubmitRequest};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

/// Errors surfaced to HTTP callers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("job not found: {0}")]
    JobNotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Submit(e) => {
                let status = match e {
                    SubmitError::UnknownLanguage { .. } => StatusCode::BAD_REQUEST,
                    SubmitError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    SubmitError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
                    SubmitError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, e.code())
            }
            ApiError::JobNotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
        };

        (status, Json(json!({ "error": code, "message": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct Accepted {
    job_id: JobId,
}

#[derive(Debug, Serialize)]
struct Pending {
    status: &'static str,
    state: JobState,
}

fn parse_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse().map_err(|_| ApiError::JobNotFound(raw.to_string()))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/languages", get(languages))
        .route("/health", get(health))
        .with_state(state)
}

/// Submit and wait for the result
async fn execute(State(state): State<AppState>, Json(request): Json<SubmitRequest>) -> Result<Response, ApiError> {
    let id = state.scheduler.submit(request)?;
    match state.scheduler.wait(id).await {
        Some(result) => Ok(Json(result.as_ref()).into_response()),
        None => Err(ApiError::JobNotFound(id.to_string())),
    }
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let job_id = state.scheduler.submit(request)?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { job_id })))
}

async fn get_job(State(state): State<AppState>, Path(raw): Path<String>) -> Result<Response, ApiError> {
    let id = parse_id(&raw)?;
    match state.scheduler.result(id) {
        ResultStatus::Ready(result) => Ok(Json(result.as_ref()).into_response()),
        ResultStatus::Pending(job_state) => Ok(Json(Pending {
            status: "pending",
            state: job_state,
        })
        .into_response()),
        ResultStatus::NotFound => Err(ApiError::JobNotFound(raw)),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(raw): Path<String>) -> Result<Response, ApiError> {
    let id = parse_id(&raw)?;
    match state.scheduler.cancel(id) {
        CancelStatus::Acknowledged => {
            info!("Job {} cancelled over HTTP", id);
            Ok((StatusCode::ACCEPTED, Json(json!({ "status": "acknowledged" }))).into_response())
        }
        CancelStatus::AlreadyTerminal => {
            Ok((StatusCode::CONFLICT, Json(json!({ "status": "already_terminal" }))).into_response())
        }
        CancelStatus::NotFound => Err(ApiError::JobNotFound(raw)),
    }
}

async fn languages(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.scheduler.registry().languages())
}

async fn health(State(state): State<AppState>) -> Response {
    let status = state.scheduler.status();
    let code = if status.accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, ServiceConfig};
    use crate::core::ResourceLimits;
    use crate::languages::{LanguageRegistry, LanguageSpec};
    use crate::sandbox::Provisioner;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(root: &std::path::Path) -> (Router, Arc<Scheduler>) {
        let config = ServiceConfig {
            workers: 1,
            queue_capacity: 4,
            grace: Duration::from_millis(300),
            sandbox_root: root.to_path_buf(),
            backend: BackendKind::Process,
            process_shared_network: true,
            ..ServiceConfig::default()
        };
        let mut registry = LanguageRegistry::builtin(&config.default_limits).unwrap();
        registry.register(
            LanguageSpec {
                id: "sh".into(),
                source_file: "main.sh".into(),
                compile_command: None,
                run_command: vec!["sh".into(), "main.sh".into()],
                image: "busybox".into(),
                compile_timeout: None,
                default_limits: ResourceLimits::default(),
            },
            &[],
        );
        let provisioner = Arc::new(Provisioner::from_config(&config));
        let scheduler = Arc::new(Scheduler::start(config, Arc::new(registry), provisioner));
        (create_router(AppState::new(scheduler.clone())), scheduler)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_execute_returns_result() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());

        let (status, body) = send(
            &app,
            "POST",
            "/execute",
            Some(json!({ "language": "sh", "code": "cat", "stdin": "echoed" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "success");
        assert_eq!(body["stdout"], "echoed");
        assert_eq!(body["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_submit_poll_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (app, scheduler) = app(dir.path());

        let (status, body) = send(&app, "POST", "/jobs", Some(json!({ "language": "sh", "code": "sleep 30" }))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = body["job_id"].as_str().unwrap().to_string();
        let uri = format!("/jobs/{}", job_id);

        let (status, body) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");

        let (status, _) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        scheduler.wait(job_id.parse().unwrap()).await.unwrap();

        let (status, body) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "cancelled");

        let (status, _) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_rejections_map_to_status_codes() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());

        let (status, body) = send(&app, "POST", "/jobs", Some(json!({ "language": "cobol", "code": "" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "UnknownLanguage");

        let huge = "x".repeat(ServiceConfig::default().max_source_bytes + 1);
        let (status, body) = send(&app, "POST", "/jobs", Some(json!({ "language": "sh", "code": huge }))).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "PayloadTooLarge");

        let (status, _) = send(&app, "GET", "/jobs/not-a-job", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "DELETE", &format!("/jobs/{}", JobId::new()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_languages_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let (app, scheduler) = app(dir.path());

        let (status, body) = send(&app, "GET", "/languages", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<String> = serde_json::from_value(body).unwrap();
        assert!(ids.contains(&"cpp".to_string()));
        assert!(ids.contains(&"sh".to_string()));

        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["workers"], 1);
        assert_eq!(body["backend"], "process");

        scheduler.shutdown(Duration::from_secs(1)).await;
        let (status, _) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}

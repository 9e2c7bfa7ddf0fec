//! HTTP front end: `POST /solve` runs one remediation synchronously.

use crate::pipeline::{ExceptionReport, RemediationPipeline};
use anyhow::Context;
use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct AppState {
    pipeline: Arc<RemediationPipeline>,
    in_flight: Mutex<HashSet<String>>,
}

impl AppState {
    pub fn new(pipeline: Arc<RemediationPipeline>) -> Self {
        Self {
            pipeline,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark `exception_id` as being processed; `None` if it already is.
    pub fn try_claim(self: &Arc<Self>, exception_id: &str) -> Option<InFlightClaim> {
        if self.in_flight().insert(exception_id.to_string()) {
            Some(InFlightClaim {
                state: Arc::clone(self),
                exception_id: exception_id.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_in_flight(&self, exception_id: &str) -> bool {
        self.in_flight().contains(exception_id)
    }
}

/// Releases the exception id when dropped.
pub struct InFlightClaim {
    state: Arc<AppState>,
    exception_id: String,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.state.in_flight().remove(&self.exception_id);
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SolveResponse {
    pub status: String,
    pub message: String,
    pub exception_id: String,
    pub pr_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub detail: String,
}

fn error(status: StatusCode, detail: String) -> Response {
    (status, Json(ErrorResponse { detail })).into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::GET])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/solve", post(solve_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// POST /solve
async fn solve_handler(
    State(state): State<Arc<AppState>>,
    Json(report): Json<ExceptionReport>,
) -> Response {
    if report.id.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "exception_id must not be empty".to_string());
    }
    if let Err(err) = state.pipeline.check_report(&report) {
        tracing::warn!(exception_id = %report.id, error = %err, "rejecting unrecordable exception id");
        return error(StatusCode::BAD_REQUEST, err.to_string());
    }

    let Some(claim) = state.try_claim(&report.id) else {
        tracing::warn!(exception_id = %report.id, "rejecting duplicate request for in-flight exception");
        return error(
            StatusCode::CONFLICT,
            format!("Exception {} is already being processed", report.id),
        );
    };
    tracing::info!(exception_id = %report.id, "received exception");

    // Runs detached so a dropped connection cannot cut a run short before its
    // outcome is recorded.
    let pipeline = Arc::clone(&state.pipeline);
    let task_report = report.clone();
    let task = tokio::spawn(async move {
        let _claim = claim;
        pipeline.remediate(&task_report).await
    });

    match task.await {
        Ok(Ok(pr_url)) => Json(SolveResponse {
            status: "success".to_string(),
            message: "Exception processed successfully".to_string(),
            exception_id: report.id,
            pr_url: Some(pr_url),
        })
        .into_response(),
        Ok(Err(err)) => error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to process exception: {}", err),
        ),
        Err(join_err) => {
            tracing::error!(exception_id = %report.id, error = %join_err, "remediation task panicked");
            error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to process exception: internal error".to_string(),
            )
        }
    }
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn serve(pipeline: Arc<RemediationPipeline>, bind: &str) -> anyhow::Result<()> {
    let app = router(Arc::new(AppState::new(pipeline)));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    tracing::info!(addr = %bind, "apex-autoheal listening");
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Collaborators, PipelineSettings};
    use crate::testing::{
        FakeReviewPublisher, FakeSourceReader, FakeStatusRecorder, FakeTicketTracker,
        FakeWorkspace, ScriptedGenerator,
    };
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(replies: &[&str]) -> Arc<AppState> {
        state_with_status(replies, Arc::new(FakeStatusRecorder::new()))
    }

    fn state_with_status(replies: &[&str], status: Arc<FakeStatusRecorder>) -> Arc<AppState> {
        let pipeline = RemediationPipeline::new(
            Collaborators {
                generator: Arc::new(ScriptedGenerator::new(replies.iter().copied())),
                sources: Arc::new(FakeSourceReader::new().with_unit("Foo", "class Foo {}")),
                workspace: Arc::new(FakeWorkspace::new()),
                reviews: Arc::new(FakeReviewPublisher::new()),
                tickets: Arc::new(FakeTicketTracker::new()),
                status,
            },
            PipelineSettings::default(),
        );
        Arc::new(AppState::new(Arc::new(pipeline)))
    }

    fn solve_request(id: &str) -> Request<Body> {
        let body = serde_json::json!({
            "exception_id": id,
            "exception_message": "System.NullPointerException",
            "stack_trace": "Class.Foo.bar: line 10, column 1"
        });
        Request::builder()
            .method("POST")
            .uri("/solve")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_solve_success() {
        let state = state(&[
            r#"{"fixable": true, "frames": [{"class": "Foo", "line": 10}]}"#,
            r#"{"Foo": "class Foo { }"}"#,
        ]);
        let response = router(state.clone()).oneshot(solve_request("E1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: SolveResponse = body_json(response).await;
        assert_eq!(
            body,
            SolveResponse {
                status: "success".to_string(),
                message: "Exception processed successfully".to_string(),
                exception_id: "E1".to_string(),
                pr_url: Some("https://github.com/acme/app/pull/1".to_string()),
            }
        );
        assert!(!state.is_in_flight("E1"));
    }

    #[tokio::test]
    async fn test_solve_failure_is_500_with_detail() {
        let state = state(&[r#"{"fixable": false}"#]);
        let response = router(state.clone()).oneshot(solve_request("E2")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = body_json(response).await;
        assert!(body.detail.starts_with("Failed to process exception: "));
        assert!(!state.is_in_flight("E2"));
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_id_is_rejected() {
        let state = state(&[]);
        let _claim = state.try_claim("E3").unwrap();

        let response = router(state.clone()).oneshot(solve_request("E3")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(state.is_in_flight("E3"));
    }

    #[tokio::test]
    async fn test_blank_id_is_bad_request() {
        let response = router(state(&[])).oneshot(solve_request("  ")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unrecordable_id_is_bad_request() {
        let status = Arc::new(FakeStatusRecorder::new());
        status.reject_id("EXC-42");
        let state = state_with_status(&[], status.clone());

        let response = router(state.clone()).oneshot(solve_request("EXC-42")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = body_json(response).await;
        assert!(body.detail.contains("Invalid Salesforce record id"));
        assert!(status.calls().is_empty());
        assert!(!state.is_in_flight("EXC-42"));
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(state(&[]))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[test]
    fn test_claim_released_on_drop() {
        let state = state(&[]);
        let claim = state.try_claim("E4").unwrap();
        assert!(state.try_claim("E4").is_none());
        drop(claim);
        assert!(state.try_claim("E4").is_some());
    }
}

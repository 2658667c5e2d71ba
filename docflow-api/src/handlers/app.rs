use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::{jobs, process, AppState};
use docflow_common::health::HealthStatus;

async fn index() -> &'static str {
    "docflow"
}

async fn liveness(State(state): State<AppState>) -> HealthStatus {
    state.liveness.get_status()
}

async fn readiness(State(state): State<AppState>) -> Result<&'static str, axum::http::StatusCode> {
    match state.kv.ping().await {
        Ok(()) => Ok("ready"),
        Err(_) => Err(axum::http::StatusCode::SERVICE_UNAVAILABLE),
    }
}

pub fn router(state: AppState) -> Router {
    let limit = state.max_upload_bytes;

    Router::new()
        .route("/", get(index))
        .route("/process/async", post(process::process_async))
        .route("/vocabulary/async", post(process::vocabulary_async))
        .route("/process/status/:job_id", get(jobs::status))
        .route("/result/:job_id", get(jobs::result))
        .route("/jobs", get(jobs::list_active))
        .route("/jobs/:job_id", delete(jobs::cancel))
        .route("/_liveness", get(liveness))
        .route("/_readiness", get(readiness))
        .layer(DefaultBodyLimit::max(limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

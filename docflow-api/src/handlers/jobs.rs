use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::error;

use docflow_engine::orchestrator::ResultLookup;

use super::AppState;

#[derive(Serialize)]
pub struct StatusResponse {
    pub job_id: String,
    pub status: docflow_engine::job::JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn internal_error<E: std::error::Error>(err: E) -> Response {
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "message": err.to_string() })),
    )
        .into_response()
}

fn not_found(job_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "message": format!("job {job_id} not found") })),
    )
        .into_response()
}

/// `GET /process/status/{job_id}`
pub async fn status(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.orchestrator.status(&job_id).await {
        Ok(Some(progress)) => Json(StatusResponse {
            job_id: progress.job_id,
            status: progress.status,
            progress: (progress.global_progress * 10.0).round() / 10.0,
            error: progress.error,
        })
        .into_response(),
        Ok(None) => not_found(&job_id),
        Err(err) => internal_error(err),
    }
}

/// `GET /result/{job_id}`: 200 with the result, 202 while the job is still
/// running, 400 for failed jobs, 404 for unknown ones.
pub async fn result(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.orchestrator.result(&job_id).await {
        Ok(ResultLookup::Ready(result)) => Json(*result).into_response(),
        Ok(ResultLookup::Pending) => (
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": job_id, "status": "PROCESSING" })),
        )
            .into_response(),
        Ok(ResultLookup::Failed(message)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": message })),
        )
            .into_response(),
        Ok(ResultLookup::NotFound) => not_found(&job_id),
        Err(err) => internal_error(err),
    }
}

/// `GET /jobs`
pub async fn list_active(State(state): State<AppState>) -> Response {
    match state.orchestrator.list_active().await {
        Ok(jobs) => Json(json!({ "count": jobs.len(), "active_jobs": jobs })).into_response(),
        Err(err) => internal_error(err),
    }
}

/// `DELETE /jobs/{job_id}`
pub async fn cancel(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    if state.orchestrator.cancel(&job_id) {
        Json(json!({
            "success": true,
            "message": format!("cancellation requested for {job_id}")
        }))
        .into_response()
    } else {
        not_found(&job_id)
    }
}

#[cfg(test)]
mod tests {
    use crate::handlers::{app, AppState};
    use axum::body::Body;
    use axum::http::{self, Request, StatusCode};
    use docflow_common::health::HealthRegistry;
    use docflow_common::kv::MockKvClient;
    use docflow_engine::artifact::MemoryArtifactStore;
    use docflow_engine::bus::{BusChannels, EventBus};
    use docflow_engine::document::Chunk;
    use docflow_engine::error::StageError;
    use docflow_engine::job::JobOptions;
    use docflow_engine::notifier::{Notifier, NotifierConfig};
    use docflow_engine::orchestrator::Orchestrator;
    use docflow_engine::registry::{JobRegistry, RegistryConfig};
    use docflow_engine::runner::{Pipeline, PipelineSettings};
    use docflow_engine::workers::{
        ContentTransformer, MockImageGenerator, MockPhonemeAnalyzer, MockTransformer,
        MockVocabularyAnalyzer, PlainTextExtractor,
    };
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    /// Transformer that parks so admitted jobs stay active for the test.
    struct ParkedTransformer;

    #[async_trait::async_trait]
    impl ContentTransformer for ParkedTransformer {
        async fn transform_chunk(&self, _chunk: &Chunk) -> Result<String, StageError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("[]".to_owned())
        }
    }

    fn state_with(transformer: Arc<dyn ContentTransformer>) -> AppState {
        let kv = MockKvClient::new();
        let pipeline = Pipeline {
            registry: JobRegistry::new(Arc::new(kv.clone()), RegistryConfig::default()),
            bus: EventBus::new(Arc::new(kv.clone()), BusChannels::default()),
            store: Arc::new(MemoryArtifactStore::new()),
            notifier: Arc::new(Notifier::new(NotifierConfig::default())),
            extractor: Arc::new(PlainTextExtractor),
            transformer,
            images: Arc::new(MockImageGenerator::new()),
            vocabulary: Arc::new(MockVocabularyAnalyzer),
            phonemes: Arc::new(MockPhonemeAnalyzer),
            settings: PipelineSettings::default(),
        };

        AppState {
            orchestrator: Arc::new(Orchestrator::new(Arc::new(pipeline))),
            liveness: HealthRegistry::new("test-liveness"),
            kv: Arc::new(kv),
            defaults: JobOptions::default(),
            max_upload_bytes: 1024 * 1024,
        }
    }

    fn multipart_upload(job_id: Option<&str>, filename: &str, content: &str) -> Request<Body> {
        let boundary = "----docflow-test-boundary";
        let mut body = String::new();
        if let Some(job_id) = job_id {
            body.push_str(&format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"job_id\"\r\n\r\n{job_id}\r\n"
            ));
        }
        body.push_str(&format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: application/pdf\r\n\r\n{content}\r\n--{boundary}--\r\n"
        ));

        Request::builder()
            .method(http::Method::POST)
            .uri("/process/async")
            .header(
                http::header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unknown_job_status_is_404() {
        let app = app::router(state_with(Arc::new(MockTransformer::new())));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/process/status/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admission_returns_202_with_processing_status() {
        let app = app::router(state_with(Arc::new(MockTransformer::new())));

        let response = app
            .oneshot(multipart_upload(Some("h1"), "a.pdf", "document text"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["job_id"], "h1");
        assert_eq!(body["status"], "PROCESSING");
    }

    #[tokio::test]
    async fn admission_requires_job_id_and_file() {
        let app = app::router(state_with(Arc::new(MockTransformer::new())));

        let response = app
            .clone()
            .oneshot(multipart_upload(None, "a.pdf", "document text"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(multipart_upload(Some("h2"), "a.pdf", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_admission_is_409() {
        let state = state_with(Arc::new(ParkedTransformer));
        let app = app::router(state);

        let first = app
            .clone()
            .oneshot(multipart_upload(Some("dup"), "a.pdf", "text"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = app
            .clone()
            .oneshot(multipart_upload(Some("dup"), "a.pdf", "text"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let body = body_json(second).await;
        assert_eq!(body["message"], "dup is already processing");

        // Clean up the parked job.
        let cancel = app
            .oneshot(
                Request::builder()
                    .method(http::Method::DELETE)
                    .uri("/jobs/dup")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(cancel.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn result_endpoint_follows_job_lifecycle() {
        let app = app::router(state_with(Arc::new(MockTransformer::new())));

        let missing = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/result/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let admitted = app
            .clone()
            .oneshot(multipart_upload(Some("r1"), "a.pdf", "document text"))
            .await
            .unwrap();
        assert_eq!(admitted.status(), StatusCode::ACCEPTED);

        // Poll until the background pipeline completes.
        let mut last = StatusCode::ACCEPTED;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri("/result/r1")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            last = response.status();
            if last == StatusCode::OK {
                let body = body_json(response).await;
                assert_eq!(body["job_id"], "r1");
                assert!(body["artifact_url"].as_str().unwrap().starts_with("memory://"));
                break;
            }
        }
        assert_eq!(last, StatusCode::OK);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_404() {
        let app = app::router(state_with(Arc::new(MockTransformer::new())));

        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::DELETE)
                    .uri("/jobs/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn readiness_reflects_kv_health() {
        let app = app::router(state_with(Arc::new(MockTransformer::new())));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/_readiness")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

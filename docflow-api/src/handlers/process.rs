use axum::extract::multipart::Multipart;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use docflow_engine::error::AdmissionError;
use docflow_engine::job::PipelineKind;
use docflow_engine::orchestrator::ProcessRequest;

use super::AppState;

#[derive(Serialize)]
pub struct ProcessAccepted {
    pub success: bool,
    pub job_id: String,
    pub message: String,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ProcessRejected {
    pub success: bool,
    pub message: String,
}

pub enum ApiError {
    Admission(AdmissionError),
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Admission(err) => {
                let status = match &err {
                    AdmissionError::AlreadyActive(_) => StatusCode::CONFLICT,
                    AdmissionError::Reservation(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, err.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
        };
        let body = Json(ProcessRejected {
            success: false,
            message,
        });
        (status, body).into_response()
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        ApiError::Admission(err)
    }
}

struct UploadFields {
    job_id: Option<String>,
    filename: Option<String>,
    file: Option<Bytes>,
    textbook_id: Option<String>,
}

async fn read_multipart(mut multipart: Multipart) -> Result<UploadFields, ApiError> {
    let mut fields = UploadFields {
        job_id: None,
        filename: None,
        file: None,
        textbook_id: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("malformed multipart body".to_owned()))?
    {
        match field.name() {
            Some("file") => {
                fields.filename = field.file_name().map(str::to_owned);
                fields.file = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|_| ApiError::BadRequest("could not read file field".to_owned()))?,
                );
            }
            Some("job_id") => {
                fields.job_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|_| ApiError::BadRequest("could not read job_id field".to_owned()))?,
                );
            }
            Some("textbook_id") => {
                fields.textbook_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|_| ApiError::BadRequest("could not read textbook_id field".to_owned()))?,
                );
            }
            other => {
                debug!("ignoring unknown multipart field {:?}", other);
            }
        }
    }

    Ok(fields)
}

fn accepted(job_id: String) -> (StatusCode, Json<ProcessAccepted>) {
    let message = format!("{job_id} accepted for processing");
    (
        StatusCode::ACCEPTED,
        Json(ProcessAccepted {
            success: true,
            job_id,
            message,
            status: "PROCESSING",
        }),
    )
}

/// `POST /process/async` (multipart): admit a full document job. Returns
/// 202 as soon as the pipeline is spawned.
pub async fn process_async(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<ProcessAccepted>), ApiError> {
    let fields = read_multipart(multipart).await?;

    let Some(job_id) = fields.job_id else {
        return Err(ApiError::BadRequest("job_id field is required".to_owned()));
    };

    let mut options = state.defaults.clone();
    options.pipeline = PipelineKind::Document;
    options.textbook_id = fields.textbook_id;

    let request = ProcessRequest {
        job_id: Some(job_id),
        filename: fields.filename.unwrap_or_default(),
        file: fields.file.unwrap_or_default(),
        options,
    };

    let job_id = state.orchestrator.admit(request).await?;
    Ok(accepted(job_id))
}

/// `POST /vocabulary/async`: same admission pattern, reduced pipeline. A
/// missing job_id is minted here.
pub async fn vocabulary_async(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<ProcessAccepted>), ApiError> {
    let fields = read_multipart(multipart).await?;

    let mut options = state.defaults.clone();
    options.pipeline = PipelineKind::VocabularyOnly;
    options.enable_enrichment = true;
    options.textbook_id = fields.textbook_id;

    let request = ProcessRequest {
        job_id: fields.job_id,
        filename: fields.filename.unwrap_or_default(),
        file: fields.file.unwrap_or_default(),
        options,
    };

    let job_id = state.orchestrator.admit(request).await?;
    Ok(accepted(job_id))
}

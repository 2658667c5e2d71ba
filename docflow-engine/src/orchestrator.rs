use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::context::JobContext;
use crate::error::{AdmissionError, RegistryError};
use crate::job::{self, JobOptions, JobProgress, JobResult, JobStatus};
use crate::registry::{JobRegistry, Reservation};
use crate::runner::Pipeline;

/// A validated admission request, as produced by the HTTP layer.
pub struct ProcessRequest {
    pub job_id: Option<String>,
    pub filename: String,
    pub file: Bytes,
    pub options: JobOptions,
}

#[derive(Debug)]
pub enum ResultLookup {
    Ready(Box<JobResult>),
    /// The job exists and is still running.
    Pending,
    Failed(String),
    NotFound,
}

struct ActiveJob {
    cancel: CancellationToken,
}

/// Front door of the engine: admits jobs, spawns their pipelines, and
/// answers queries. Admission never awaits a stage; the request returns as
/// soon as the slot is reserved and the pipeline task is detached.
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    registry: JobRegistry,
    active: Arc<Mutex<HashMap<String, ActiveJob>>>,
}

const ALLOWED_EXTENSIONS: [&str; 2] = ["pdf", "txt"];

fn has_allowed_extension(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl Orchestrator {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            registry: pipeline.registry.clone(),
            pipeline,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate, reserve the job slot, spawn the pipeline, return. A
    /// rejected admission has no side effects beyond the failed reserve.
    pub async fn admit(&self, request: ProcessRequest) -> Result<String, AdmissionError> {
        if request.file.is_empty() {
            return Err(AdmissionError::EmptyFile);
        }
        if !has_allowed_extension(&request.filename) {
            return Err(AdmissionError::UnsupportedExtension(request.filename));
        }
        let job_id = match request.job_id {
            Some(id) if job::validate_job_id(&id) => id,
            Some(id) => return Err(AdmissionError::InvalidJobId(id)),
            None => job::mint_job_id(),
        };

        match self.registry.reserve(&job_id).await? {
            Reservation::Reserved => {}
            Reservation::AlreadyActive => {
                return Err(AdmissionError::AlreadyActive(job_id));
            }
        }

        let ctx = JobContext::new(
            job_id.clone(),
            request.filename,
            request.file,
            request.options,
        );
        self.active.lock().expect("poisoned active jobs lock").insert(
            job_id.clone(),
            ActiveJob {
                cancel: ctx.cancel.clone(),
            },
        );

        let pipeline = self.pipeline.clone();
        let active = self.active.clone();
        let spawned_id = job_id.clone();
        tokio::spawn(async move {
            pipeline.execute(ctx).await;
            active.lock().expect("poisoned active jobs lock").remove(&spawned_id);
        });

        metrics::counter!("docflow_jobs_admitted_total").increment(1);
        info!("admitted job {}", job_id);
        Ok(job_id)
    }

    /// Signal cancellation to the owning pipeline. Returns immediately;
    /// the pipeline observes the token at its next suspension point.
    pub fn cancel(&self, job_id: &str) -> bool {
        let active = self.active.lock().expect("poisoned active jobs lock");
        match active.get(job_id) {
            Some(job) => {
                job.cancel.cancel();
                info!("cancellation requested for {}", job_id);
                true
            }
            None => false,
        }
    }

    pub async fn status(&self, job_id: &str) -> Result<Option<JobProgress>, RegistryError> {
        self.registry.read_progress(job_id).await
    }

    pub async fn result(&self, job_id: &str) -> Result<ResultLookup, RegistryError> {
        if let Some(result) = self.registry.read_result(job_id).await? {
            return Ok(ResultLookup::Ready(Box::new(result)));
        }

        match self.registry.read_progress(job_id).await? {
            Some(progress) => match progress.status {
                JobStatus::Failed => Ok(ResultLookup::Failed(
                    progress.error.unwrap_or_else(|| "job failed".to_owned()),
                )),
                JobStatus::Cancelled => Ok(ResultLookup::Failed("job was cancelled".to_owned())),
                _ => Ok(ResultLookup::Pending),
            },
            None => Ok(ResultLookup::NotFound),
        }
    }

    pub async fn list_active(&self) -> Result<Vec<String>, RegistryError> {
        self.registry.list_active().await
    }
}

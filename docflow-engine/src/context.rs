use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::StageError;
use crate::job::JobOptions;

/// Everything a pipeline execution owns for one job. Constructed at
/// admission, held exclusively by the pipeline task; stage workers receive
/// a shared reference plus their stage-scoped progress handle.
pub struct JobContext {
    pub job_id: String,
    pub filename: String,
    pub input: Bytes,
    pub options: JobOptions,
    pub cancel: CancellationToken,
    pub created_at: DateTime<Utc>,
}

impl JobContext {
    pub fn new(job_id: String, filename: String, input: Bytes, options: JobOptions) -> Self {
        Self {
            job_id,
            filename,
            input,
            options,
            cancel: CancellationToken::new(),
            created_at: Utc::now(),
        }
    }

    /// Cancellation poll for stage workers; call at every suspension point.
    pub fn checkpoint(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

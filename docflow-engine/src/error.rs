use docflow_common::kv::KvError;
use thiserror::Error;

/// Errors surfaced synchronously at admission. These never enter the
/// pipeline; the HTTP layer maps them to 4xx responses.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("request holds no file data")]
    EmptyFile,
    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(String),
    #[error("invalid job id: {0}")]
    InvalidJobId(String),
    #[error("{0} is already processing")]
    AlreadyActive(String),
    #[error("failed to reserve job slot: {0}")]
    Reservation(#[from] RegistryError),
}

/// Error raised by a stage worker. The pipeline runner decides whether a
/// stage failure is fatal for the job or tolerated as a partial failure.
#[derive(Error, Debug)]
pub enum StageError {
    /// Unparseable input document.
    #[error("input unreadable: {0}")]
    InputUnreadable(String),
    /// The extractor produced no text at all.
    #[error("no text could be extracted from the document")]
    EmptyExtraction,
    /// Timeouts, 5xx and transport failures. Retried per policy.
    #[error("transient stage failure: {0}")]
    Transient(String),
    /// Deterministic dependency failures (4xx, irrecoverable parse).
    /// Never retried.
    #[error("permanent stage failure: {0}")]
    Permanent(String),
    #[error("storage failed: {0}")]
    Storage(String),
    #[error("job cancelled")]
    Cancelled,
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled)
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("kv i/o failed: {0}")]
    Io(#[from] KvError),
    #[error("stored snapshot could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

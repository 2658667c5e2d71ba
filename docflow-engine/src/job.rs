use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Characters allowed in caller-supplied job ids. Ids end up in KV keys and
/// object store paths, so separators and path characters are rejected.
const JOB_ID_MAX_LEN: usize = 128;

pub fn validate_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= JOB_ID_MAX_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Mint an id for callers that did not supply one.
pub fn mint_job_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Ordered pipeline stages. Each stage owns a contiguous band of the global
/// progress range; the bands partition [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageId {
    Initialization,
    PdfPreprocessing,
    Transformation,
    ImageProcessing,
    Enrichment,
    FinalAssembly,
    Storage,
    Notification,
}

impl StageId {
    pub const ALL: [StageId; 8] = [
        StageId::Initialization,
        StageId::PdfPreprocessing,
        StageId::Transformation,
        StageId::ImageProcessing,
        StageId::Enrichment,
        StageId::FinalAssembly,
        StageId::Storage,
        StageId::Notification,
    ];

    /// The `(start, end)` percentage band this stage maps onto.
    pub fn band(&self) -> (f64, f64) {
        match self {
            StageId::Initialization => (0.0, 5.0),
            StageId::PdfPreprocessing => (5.0, 25.0),
            StageId::Transformation => (25.0, 60.0),
            StageId::ImageProcessing => (60.0, 80.0),
            StageId::Enrichment => (80.0, 90.0),
            StageId::FinalAssembly => (90.0, 95.0),
            StageId::Storage => (95.0, 99.0),
            StageId::Notification => (99.0, 100.0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Initialization => "INITIALIZATION",
            StageId::PdfPreprocessing => "PDF_PREPROCESSING",
            StageId::Transformation => "TRANSFORMATION",
            StageId::ImageProcessing => "IMAGE_PROCESSING",
            StageId::Enrichment => "ENRICHMENT",
            StageId::FinalAssembly => "FINAL_ASSEMBLY",
            StageId::Storage => "STORAGE",
            StageId::Notification => "NOTIFICATION",
        }
    }
}

/// Durable per-job progress snapshot. Written only by the owning pipeline;
/// read by the status endpoint and external observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub status: JobStatus,
    pub current_stage: StageId,
    pub global_progress: f64,
    #[serde(default)]
    pub per_stage_progress: HashMap<StageId, f64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgress {
    pub fn new(job_id: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_owned(),
            status: JobStatus::Pending,
            current_stage: StageId::Initialization,
            global_progress: 0.0,
            per_stage_progress: HashMap::new(),
            started_at: now,
            updated_at: now,
            error: None,
        }
    }
}

/// A stage that completed with some work items dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartialFailure {
    pub stage: StageId,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub total_pages: usize,
    pub total_blocks: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partial_failures: Vec<PartialFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub textbook_id: Option<String>,
}

/// Written exactly once, on the successful terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub processing_time_s: f64,
    pub artifact_url: String,
    pub metadata: ResultMetadata,
}

/// Which stage sequence a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// The full document pipeline.
    Document,
    /// Vocabulary extraction only: transformation and enrichment without
    /// image generation.
    VocabularyOnly,
}

impl Default for PipelineKind {
    fn default() -> Self {
        PipelineKind::Document
    }
}

/// Per-job processing options, defaulted from service configuration and
/// overridable at admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub pipeline: PipelineKind,
    /// Token budget per chunk handed to the transformer.
    pub max_tokens: usize,
    /// Concurrent transformer calls per job.
    pub max_concurrent: usize,
    /// Concurrent image generations per job.
    pub image_max_concurrent: usize,
    pub enable_enrichment: bool,
    /// Concurrent enrichment calls per job.
    pub enrich_max_concurrent: usize,
    /// Cap on vocabulary items reported per block.
    pub word_limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub textbook_id: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            pipeline: PipelineKind::Document,
            max_tokens: 12_000,
            max_concurrent: 8,
            image_max_concurrent: 3,
            enable_enrichment: true,
            enrich_max_concurrent: 3,
            word_limit: 15,
            textbook_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_bands_partition_the_progress_range() {
        let mut expected_start = 0.0;
        for stage in StageId::ALL {
            let (start, end) = stage.band();
            assert_eq!(start, expected_start, "gap before {:?}", stage);
            assert!(end > start, "empty band for {:?}", stage);
            expected_start = end;
        }
        assert_eq!(expected_start, 100.0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn job_id_validation() {
        assert!(validate_job_id("job-123"));
        assert!(validate_job_id("a.b_c-D9"));
        assert!(!validate_job_id(""));
        assert!(!validate_job_id("has space"));
        assert!(!validate_job_id("slash/y"));
        assert!(!validate_job_id(&"x".repeat(129)));
        assert!(validate_job_id(&mint_job_id()));
    }

    #[test]
    fn progress_snapshot_roundtrips_with_wire_names() {
        let mut progress = JobProgress::new("j1");
        progress.status = JobStatus::Processing;
        progress.current_stage = StageId::Transformation;
        progress.global_progress = 42.5;
        progress
            .per_stage_progress
            .insert(StageId::Transformation, 50.0);

        let encoded = serde_json::to_string(&progress).unwrap();
        assert!(encoded.contains("\"PROCESSING\""));
        assert!(encoded.contains("\"TRANSFORMATION\""));

        let decoded: JobProgress = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.status, JobStatus::Processing);
        assert_eq!(decoded.global_progress, 42.5);
        assert_eq!(
            decoded.per_stage_progress.get(&StageId::Transformation),
            Some(&50.0)
        );
    }
}

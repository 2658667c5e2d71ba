use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use docflow_common::retry::RetryPolicy;
use tracing::{error, info};

use crate::artifact::ArtifactStore;
use crate::bus::EventBus;
use crate::context::JobContext;
use crate::error::StageError;
use crate::job::{JobResult, PartialFailure, PipelineKind, StageId};
use crate::notifier::{BlockCallbacks, Notifier};
use crate::progress::ProgressAccountant;
use crate::registry::JobRegistry;
use crate::stages;
use crate::workers::{
    ContentTransformer, ImageGenerator, PhonemeAnalyzer, TextExtractor, VocabularyAnalyzer,
};

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub transform_retry: RetryPolicy,
    pub image_retry: RetryPolicy,
    pub enrich_retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            transform_retry: RetryPolicy::default(),
            image_retry: RetryPolicy::default(),
            enrich_retry: RetryPolicy::default(),
        }
    }
}

/// Process-wide pipeline dependencies. One instance serves every job; each
/// execution owns its `JobContext` and runs the stages linearly.
pub struct Pipeline {
    pub registry: JobRegistry,
    pub bus: EventBus,
    pub store: Arc<dyn ArtifactStore>,
    pub notifier: Arc<Notifier>,
    pub extractor: Arc<dyn TextExtractor>,
    pub transformer: Arc<dyn ContentTransformer>,
    pub images: Arc<dyn ImageGenerator>,
    pub vocabulary: Arc<dyn VocabularyAnalyzer>,
    pub phonemes: Arc<dyn PhonemeAnalyzer>,
    pub settings: PipelineSettings,
}

impl Pipeline {
    /// Drive one job from admission to a terminal state. Every exit path
    /// writes a terminal snapshot and releases the registry slot.
    pub async fn execute(&self, ctx: JobContext) {
        let accountant =
            ProgressAccountant::new(&ctx.job_id, self.registry.clone(), self.bus.clone());
        accountant.start().await;

        let started = Instant::now();
        match self.run_stages(&ctx, &accountant).await {
            Ok(()) => {
                metrics::counter!("docflow_jobs_total", "outcome" => "completed").increment(1);
                metrics::histogram!("docflow_job_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                info!("job {} completed in {:.1?}", ctx.job_id, started.elapsed());
            }
            Err(err) if err.is_cancelled() => {
                accountant.cancel().await;
                metrics::counter!("docflow_jobs_total", "outcome" => "cancelled").increment(1);
                info!("job {} cancelled after {:.1?}", ctx.job_id, started.elapsed());
            }
            Err(err) => {
                let message = err.to_string();
                accountant.fail(&message).await;
                self.bus.publish_failure(&ctx.job_id, &message).await;
                metrics::counter!("docflow_jobs_total", "outcome" => "failed").increment(1);
                error!("job {} failed: {}", ctx.job_id, message);
            }
        }

        self.registry.release(&ctx.job_id).await;
    }

    async fn run_stages(
        &self,
        ctx: &JobContext,
        accountant: &ProgressAccountant,
    ) -> Result<(), StageError> {
        let mut partial_failures: Vec<PartialFailure> = Vec::new();

        accountant.enter_stage(StageId::Initialization).await;
        ctx.checkpoint()?;
        accountant.stage(StageId::Initialization).report(100.0).await;

        accountant.enter_stage(StageId::PdfPreprocessing).await;
        let chunks = stages::preprocess::run(
            ctx,
            self.extractor.as_ref(),
            &accountant.stage(StageId::PdfPreprocessing),
        )
        .await?;

        accountant.enter_stage(StageId::Transformation).await;
        let mut callbacks = BlockCallbacks::new(
            self.notifier.clone(),
            self.vocabulary.clone(),
            ctx.options
                .enable_enrichment
                .then(|| self.phonemes.clone()),
            &ctx.job_id,
            ctx.options.textbook_id.clone(),
            ctx.options.word_limit,
        );
        let transformed = stages::transform::run(
            ctx,
            self.transformer.clone(),
            self.settings.transform_retry,
            &chunks,
            &mut callbacks,
            &accountant.stage(StageId::Transformation),
        )
        .await?;
        if transformed.failed_chunks > 0 {
            partial_failures.push(PartialFailure {
                stage: StageId::Transformation,
                count: transformed.failed_chunks,
            });
        }

        accountant.enter_stage(StageId::ImageProcessing).await;
        let (chunk_blocks, image_failures) =
            if ctx.options.pipeline == PipelineKind::VocabularyOnly {
                accountant.stage(StageId::ImageProcessing).report(100.0).await;
                (transformed.chunk_blocks, 0)
            } else {
                stages::image::run(
                    ctx,
                    self.images.clone(),
                    self.settings.image_retry,
                    transformed.chunk_blocks,
                    &accountant.stage(StageId::ImageProcessing),
                )
                .await?
            };
        if image_failures > 0 {
            partial_failures.push(PartialFailure {
                stage: StageId::ImageProcessing,
                count: image_failures,
            });
        }

        accountant.enter_stage(StageId::Enrichment).await;
        let (chunk_blocks, enrich_failures) = stages::enrich::run(
            ctx,
            self.vocabulary.clone(),
            ctx.options
                .enable_enrichment
                .then(|| self.phonemes.clone()),
            self.settings.enrich_retry,
            chunk_blocks,
            &accountant.stage(StageId::Enrichment),
        )
        .await?;
        if enrich_failures > 0 {
            partial_failures.push(PartialFailure {
                stage: StageId::Enrichment,
                count: enrich_failures,
            });
        }

        accountant.enter_stage(StageId::FinalAssembly).await;
        let document = stages::assemble::run(
            ctx,
            &chunks,
            chunk_blocks,
            partial_failures,
            &accountant.stage(StageId::FinalAssembly),
        )
        .await?;

        accountant.enter_stage(StageId::Storage).await;
        let artifact_url = stages::store::run(
            ctx,
            self.store.as_ref(),
            &document,
            &accountant.stage(StageId::Storage),
        )
        .await?;

        // Processing time stops here, just before notification.
        accountant.enter_stage(StageId::Notification).await;
        accountant.stage(StageId::Notification).report(10.0).await;
        let completed_at = Utc::now();
        let result = JobResult {
            job_id: ctx.job_id.clone(),
            filename: ctx.filename.clone(),
            created_at: ctx.created_at,
            completed_at,
            processing_time_s: (completed_at - ctx.created_at).num_milliseconds() as f64 / 1000.0,
            artifact_url: artifact_url.clone(),
            metadata: document.metadata.clone(),
        };

        if let Err(err) = self.registry.write_result(&result).await {
            return Err(StageError::Permanent(format!(
                "result persistence failed: {err}"
            )));
        }

        // Terminal snapshot first, so the result message is the last thing
        // this pipeline puts on the bus.
        accountant.complete().await;
        self.bus.publish_result(&ctx.job_id, &artifact_url).await;

        let data = serde_json::to_value(&document).unwrap_or_default();
        self.notifier
            .document_complete(&ctx.job_id, &ctx.filename, &data)
            .await;

        callbacks.drain().await;
        Ok(())
    }
}

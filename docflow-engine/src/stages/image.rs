use std::sync::Arc;

use docflow_common::retry::RetryPolicy;
use tracing::{info, warn};

use crate::context::JobContext;
use crate::document::{Block, BlockKind};
use crate::error::StageError;
use crate::executor::{run_bounded, ItemOutcome};
use crate::progress::StageProgress;
use crate::workers::ImageGenerator;

/// Generate images for PAGE_IMAGE blocks under the image semaphore. A
/// failed generation leaves its block untouched; the document ships without
/// that image.
pub async fn run(
    ctx: &JobContext,
    generator: Arc<dyn ImageGenerator>,
    retry: RetryPolicy,
    mut chunk_blocks: Vec<Vec<Block>>,
    progress: &StageProgress<'_>,
) -> Result<(Vec<Vec<Block>>, usize), StageError> {
    ctx.checkpoint()?;

    // (chunk, block) coordinates of every image still needing a URL.
    let mut targets: Vec<(usize, usize)> = Vec::new();
    let mut prompts: Vec<String> = Vec::new();
    for (ci, blocks) in chunk_blocks.iter().enumerate() {
        for (bi, block) in blocks.iter().enumerate() {
            if block.kind == BlockKind::PageImage && block.url.is_none() {
                let prompt = block
                    .image_prompt
                    .clone()
                    .or_else(|| block.text.clone())
                    .unwrap_or_default();
                targets.push((ci, bi));
                prompts.push(prompt);
            }
        }
    }

    if targets.is_empty() {
        progress.report(100.0).await;
        return Ok((chunk_blocks, 0));
    }

    let job_id = ctx.job_id.clone();
    let worker = generator.clone();
    let outcomes = run_bounded(
        prompts,
        ctx.options.image_max_concurrent,
        &ctx.cancel,
        retry,
        Some(progress),
        move |_, prompt| {
            let worker = worker.clone();
            let job_id = job_id.clone();
            async move { worker.generate(&job_id, &prompt).await }
        },
    )
    .await?;

    let mut failed = 0usize;
    for ((ci, bi), outcome) in targets.into_iter().zip(outcomes) {
        match outcome {
            ItemOutcome::Ok(url) => chunk_blocks[ci][bi].url = Some(url),
            ItemOutcome::Failed(err) => {
                warn!("image generation failed for {} block {}: {}", ctx.job_id, chunk_blocks[ci][bi].id, err);
                failed += 1;
            }
        }
    }

    info!("image stage for {} finished ({} failed)", ctx.job_id, failed);
    Ok((chunk_blocks, failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusChannels, EventBus};
    use crate::job::{JobOptions, StageId};
    use crate::progress::ProgressAccountant;
    use crate::registry::{JobRegistry, RegistryConfig};
    use crate::workers::MockImageGenerator;
    use bytes::Bytes;
    use docflow_common::kv::MockKvClient;
    use std::time::Duration;

    fn accountant(kv: &MockKvClient) -> ProgressAccountant {
        ProgressAccountant::new(
            "j1",
            JobRegistry::new(Arc::new(kv.clone()), RegistryConfig::default()),
            EventBus::new(Arc::new(kv.clone()), BusChannels::default()),
        )
    }

    fn image_block(id: &str, prompt: &str) -> Block {
        Block {
            id: id.to_owned(),
            kind: BlockKind::PageImage,
            text: None,
            items: Vec::new(),
            image_prompt: Some(prompt.to_owned()),
            url: None,
            vocabulary: Vec::new(),
            phonemes: None,
        }
    }

    fn ctx() -> JobContext {
        JobContext::new(
            "j1".to_owned(),
            "a.pdf".to_owned(),
            Bytes::from_static(b"input"),
            JobOptions::default(),
        )
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(2)).without_jitter()
    }

    #[tokio::test]
    async fn failed_generation_leaves_block_unchanged() {
        let kv = MockKvClient::new();
        let acct = accountant(&kv);
        let generator = MockImageGenerator::new();
        generator.fail_for("a broken prompt");

        let blocks = vec![vec![
            image_block("i1", "first prompt"),
            image_block("i2", "a broken prompt"),
            image_block("i3", "third prompt"),
        ]];
        let before = blocks[0][1].clone();

        let context = ctx();
        let (result, failed) = run(
            &context,
            Arc::new(generator),
            fast_retry(),
            blocks,
            &acct.stage(StageId::ImageProcessing),
        )
        .await
        .unwrap();

        assert_eq!(failed, 1);
        assert!(result[0][0].url.is_some());
        assert_eq!(result[0][1], before);
        assert!(result[0][2].url.is_some());
    }

    #[tokio::test]
    async fn no_image_blocks_is_a_fast_noop() {
        let kv = MockKvClient::new();
        let acct = accountant(&kv);

        let blocks = vec![vec![Block::text_block("t1", "just text")]];
        let context = ctx();
        let (result, failed) = run(
            &context,
            Arc::new(MockImageGenerator::new()),
            fast_retry(),
            blocks,
            &acct.stage(StageId::ImageProcessing),
        )
        .await
        .unwrap();

        assert_eq!(failed, 0);
        assert!(result[0][0].url.is_none());
    }
}

use std::sync::Arc;

use docflow_common::retry::RetryPolicy;
use tracing::{info, warn};

use crate::context::JobContext;
use crate::document::{parse_blocks, salvage_blocks, Block, BlockKind, Chunk};
use crate::error::StageError;
use crate::executor::{run_bounded, ItemOutcome};
use crate::notifier::BlockCallbacks;
use crate::progress::StageProgress;
use crate::workers::ContentTransformer;

pub struct TransformOutput {
    /// Blocks per chunk, in chunk order. A chunk whose final attempt failed
    /// contributes an empty array.
    pub chunk_blocks: Vec<Vec<Block>>,
    pub failed_chunks: usize,
}

impl TransformOutput {
    pub fn total_blocks(&self) -> usize {
        self.chunk_blocks.iter().map(Vec::len).sum()
    }
}

/// Transform chunks into typed blocks, fanning out under the job's
/// transform semaphore. Transport failures are retried per policy; parse
/// failures go through salvage instead, they are never worth a retry.
pub async fn run(
    ctx: &JobContext,
    transformer: Arc<dyn ContentTransformer>,
    retry: RetryPolicy,
    chunks: &[Chunk],
    callbacks: &mut BlockCallbacks,
    progress: &StageProgress<'_>,
) -> Result<TransformOutput, StageError> {
    ctx.checkpoint()?;

    let worker = transformer.clone();
    let outcomes = run_bounded(
        chunks.to_vec(),
        ctx.options.max_concurrent,
        &ctx.cancel,
        retry,
        Some(progress),
        move |_, chunk| {
            let worker = worker.clone();
            async move { worker.transform_chunk(&chunk).await }
        },
    )
    .await?;

    let mut chunk_blocks = Vec::with_capacity(outcomes.len());
    let mut failed_chunks = 0usize;

    for (chunk, outcome) in chunks.iter().zip(outcomes) {
        let blocks = match outcome {
            ItemOutcome::Ok(raw) => blocks_from_response(&raw, chunk.index),
            ItemOutcome::Failed(err) => {
                warn!("chunk {} of {} dropped: {}", chunk.index, ctx.job_id, err);
                failed_chunks += 1;
                Vec::new()
            }
        };

        for block in &blocks {
            if block.kind == BlockKind::Text {
                callbacks.schedule(chunk.index + 1, block);
            }
        }
        chunk_blocks.push(blocks);
    }

    let output = TransformOutput {
        chunk_blocks,
        failed_chunks,
    };
    info!(
        "transformed {} chunks into {} blocks for {} ({} failed)",
        chunks.len(),
        output.total_blocks(),
        ctx.job_id,
        failed_chunks
    );
    Ok(output)
}

fn blocks_from_response(raw: &str, chunk_index: usize) -> Vec<Block> {
    let id_prefix = format!("c{chunk_index}");
    let mut blocks = match parse_blocks(raw) {
        Ok(blocks) => blocks,
        Err(err) => {
            warn!("strict block parse failed for chunk {}: {}", chunk_index, err);
            salvage_blocks(raw, &id_prefix)
        }
    };

    for (i, block) in blocks.iter_mut().enumerate() {
        if block.id.is_empty() {
            block.id = format!("{id_prefix}-b{i}");
        }
    }
    blocks
}

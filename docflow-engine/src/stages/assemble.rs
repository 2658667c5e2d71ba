use chrono::Utc;

use crate::context::JobContext;
use crate::document::{AssembledDocument, Block, Chunk, Page};
use crate::error::StageError;
use crate::job::{JobStatus, PartialFailure, ResultMetadata};
use crate::progress::StageProgress;

/// Compose the output document. One page per chunk, in chunk order.
pub async fn run(
    ctx: &JobContext,
    chunks: &[Chunk],
    chunk_blocks: Vec<Vec<Block>>,
    partial_failures: Vec<PartialFailure>,
    progress: &StageProgress<'_>,
) -> Result<AssembledDocument, StageError> {
    ctx.checkpoint()?;

    let pages: Vec<Page> = chunks
        .iter()
        .zip(chunk_blocks)
        .map(|(chunk, blocks)| Page {
            page_number: chunk.index + 1,
            original_content: chunk.text.clone(),
            blocks,
        })
        .collect();

    let total_blocks = pages.iter().map(|p| p.blocks.len()).sum();
    if total_blocks == 0 {
        return Err(StageError::Permanent(
            "assembly produced an empty document".to_owned(),
        ));
    }

    let completed_at = Utc::now();
    let document = AssembledDocument {
        job_id: ctx.job_id.clone(),
        filename: ctx.filename.clone(),
        status: JobStatus::Completed,
        created_at: ctx.created_at,
        completed_at,
        processing_time_s: (completed_at - ctx.created_at).num_milliseconds() as f64 / 1000.0,
        metadata: ResultMetadata {
            total_pages: pages.len(),
            total_blocks,
            partial_failures,
            textbook_id: ctx.options.textbook_id.clone(),
        },
        pages,
    };

    progress.report(100.0).await;
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusChannels, EventBus};
    use crate::job::{JobOptions, StageId};
    use crate::progress::ProgressAccountant;
    use crate::registry::{JobRegistry, RegistryConfig};
    use bytes::Bytes;
    use docflow_common::kv::MockKvClient;
    use std::sync::Arc;

    fn accountant() -> ProgressAccountant {
        let kv = MockKvClient::new();
        ProgressAccountant::new(
            "j1",
            JobRegistry::new(Arc::new(kv.clone()), RegistryConfig::default()),
            EventBus::new(Arc::new(kv), BusChannels::default()),
        )
    }

    fn ctx() -> JobContext {
        JobContext::new(
            "j1".to_owned(),
            "a.pdf".to_owned(),
            Bytes::from_static(b"input"),
            JobOptions::default(),
        )
    }

    fn chunk(index: usize) -> Chunk {
        Chunk {
            index,
            text: format!("content {index}"),
            token_estimate: 2,
        }
    }

    #[tokio::test]
    async fn page_order_follows_chunk_order() {
        let acct = accountant();
        let chunks = vec![chunk(0), chunk(1), chunk(2)];
        let blocks = vec![
            vec![Block::text_block("b0", "zero")],
            vec![],
            vec![Block::text_block("b2", "two")],
        ];

        let context = ctx();
        let document = run(
            &context,
            &chunks,
            blocks,
            Vec::new(),
            &acct.stage(StageId::FinalAssembly),
        )
        .await
        .unwrap();

        assert_eq!(document.pages.len(), 3);
        let numbers: Vec<usize> = document.pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(document.pages[0].original_content, "content 0");
        assert_eq!(document.metadata.total_blocks, 2);
    }

    #[tokio::test]
    async fn empty_document_is_a_permanent_failure() {
        let acct = accountant();
        let chunks = vec![chunk(0)];

        let context = ctx();
        let result = run(
            &context,
            &chunks,
            vec![vec![]],
            Vec::new(),
            &acct.stage(StageId::FinalAssembly),
        )
        .await;

        assert!(matches!(result, Err(StageError::Permanent(_))));
    }

    #[tokio::test]
    async fn partial_failures_land_in_metadata() {
        let acct = accountant();
        let chunks = vec![chunk(0)];
        let failures = vec![PartialFailure {
            stage: StageId::ImageProcessing,
            count: 1,
        }];

        let context = ctx();
        let document = run(
            &context,
            &chunks,
            vec![vec![Block::text_block("b0", "x")]],
            failures.clone(),
            &acct.stage(StageId::FinalAssembly),
        )
        .await
        .unwrap();

        assert_eq!(document.metadata.partial_failures, failures);
    }
}

use std::sync::Arc;

use docflow_common::retry::RetryPolicy;
use tracing::{info, warn};

use crate::context::JobContext;
use crate::document::{Block, BlockKind, VocabularyItem};
use crate::error::StageError;
use crate::executor::{run_bounded, ItemOutcome};
use crate::progress::StageProgress;
use crate::workers::{PhonemeAnalyzer, VocabularyAnalyzer};

struct Enrichment {
    vocabulary: Vec<VocabularyItem>,
    phonemes: Option<serde_json::Value>,
}

/// Vocabulary and phoneme analysis over the TEXT blocks, under the
/// enrichment semaphore. Disabled jobs pass through with an immediate
/// 0 to 100 report. Analysis failures leave the block unenriched.
pub async fn run(
    ctx: &JobContext,
    vocabulary: Arc<dyn VocabularyAnalyzer>,
    phonemes: Option<Arc<dyn PhonemeAnalyzer>>,
    retry: RetryPolicy,
    mut chunk_blocks: Vec<Vec<Block>>,
    progress: &StageProgress<'_>,
) -> Result<(Vec<Vec<Block>>, usize), StageError> {
    ctx.checkpoint()?;

    if !ctx.options.enable_enrichment {
        progress.report(100.0).await;
        return Ok((chunk_blocks, 0));
    }

    let mut targets: Vec<(usize, usize)> = Vec::new();
    let mut texts: Vec<String> = Vec::new();
    for (ci, blocks) in chunk_blocks.iter().enumerate() {
        for (bi, block) in blocks.iter().enumerate() {
            if block.kind == BlockKind::Text {
                if let Some(text) = &block.text {
                    targets.push((ci, bi));
                    texts.push(text.clone());
                }
            }
        }
    }

    if targets.is_empty() {
        progress.report(100.0).await;
        return Ok((chunk_blocks, 0));
    }

    let word_limit = ctx.options.word_limit;
    let vocab_worker = vocabulary.clone();
    let phoneme_worker = phonemes.clone();
    let outcomes = run_bounded(
        texts,
        ctx.options.enrich_max_concurrent,
        &ctx.cancel,
        retry,
        Some(progress),
        move |_, text| {
            let vocabulary = vocab_worker.clone();
            let phonemes = phoneme_worker.clone();
            async move {
                let items = vocabulary.analyze(&text, word_limit).await?;
                let analysis = match &phonemes {
                    Some(worker) => Some(worker.analyze_block(&text).await?),
                    None => None,
                };
                Ok(Enrichment {
                    vocabulary: items,
                    phonemes: analysis,
                })
            }
        },
    )
    .await?;

    let mut failed = 0usize;
    for ((ci, bi), outcome) in targets.into_iter().zip(outcomes) {
        match outcome {
            ItemOutcome::Ok(enrichment) => {
                let block = &mut chunk_blocks[ci][bi];
                block.vocabulary = enrichment.vocabulary;
                block.phonemes = enrichment.phonemes;
            }
            ItemOutcome::Failed(err) => {
                warn!("enrichment failed for {} block {}: {}", ctx.job_id, chunk_blocks[ci][bi].id, err);
                failed += 1;
            }
        }
    }

    info!("enrichment for {} finished ({} failed)", ctx.job_id, failed);
    Ok((chunk_blocks, failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusChannels, EventBus};
    use crate::job::{JobOptions, StageId};
    use crate::progress::ProgressAccountant;
    use crate::registry::{JobRegistry, RegistryConfig};
    use crate::workers::{MockPhonemeAnalyzer, MockVocabularyAnalyzer};
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

    fn ctx(enable: bool) -> JobContext {
        JobContext::new(
            "j1".to_owned(),
            "a.pdf".to_owned(),
            Bytes::from_static(b"input"),
            JobOptions {
                enable_enrichment: enable,
                ..JobOptions::default()
            },
        )
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(2)).without_jitter()
    }

    #[tokio::test]
    async fn disabled_enrichment_reports_complete_immediately() {
        let kv = MockKvClient::new();
        let acct = accountant(&kv);

        let blocks = vec![vec![Block::text_block("b1", "remarkable vocabulary")]];
        let context = ctx(false);
        let (result, failed) = run(
            &context,
            Arc::new(MockVocabularyAnalyzer),
            Some(Arc::new(MockPhonemeAnalyzer)),
            fast_retry(),
            blocks,
            &acct.stage(StageId::Enrichment),
        )
        .await
        .unwrap();

        assert_eq!(failed, 0);
        assert!(result[0][0].vocabulary.is_empty());
        assert_eq!(
            acct.snapshot().await.per_stage_progress.get(&StageId::Enrichment),
            Some(&100.0)
        );
    }

    #[tokio::test]
    async fn text_blocks_gain_vocabulary_and_phonemes() {
        let kv = MockKvClient::new();
        let acct = accountant(&kv);

        let blocks = vec![vec![
            Block::text_block("b1", "the magnificent extraordinary word"),
            Block::text_block("b2", "all short here"),
        ]];
        let context = ctx(true);
        let (result, failed) = run(
            &context,
            Arc::new(MockVocabularyAnalyzer),
            Some(Arc::new(MockPhonemeAnalyzer)),
            fast_retry(),
            blocks,
            &acct.stage(StageId::Enrichment),
        )
        .await
        .unwrap();

        assert_eq!(failed, 0);
        assert_eq!(result[0][0].vocabulary.len(), 2);
        assert!(result[0][0].phonemes.is_some());
        assert!(result[0][1].vocabulary.is_empty());
    }
}

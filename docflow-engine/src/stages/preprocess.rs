use tracing::info;

use crate::context::JobContext;
use crate::document::{normalize_paragraphs, pack_chunks, Chunk};
use crate::error::StageError;
use crate::progress::StageProgress;
use crate::workers::TextExtractor;

/// Extract page text, normalize paragraphs, and greedy-pack them into
/// chunks within the per-chunk token budget.
pub async fn run(
    ctx: &JobContext,
    extractor: &dyn TextExtractor,
    progress: &StageProgress<'_>,
) -> Result<Vec<Chunk>, StageError> {
    ctx.checkpoint()?;

    let pages = extractor.extract(&ctx.filename, &ctx.input).await?;
    progress.report(40.0).await;
    ctx.checkpoint()?;

    let mut paragraphs = Vec::new();
    for page in &pages {
        paragraphs.extend(normalize_paragraphs(&page.text));
    }
    progress.report(70.0).await;

    let chunks = pack_chunks(&paragraphs, ctx.options.max_tokens);
    if chunks.is_empty() {
        return Err(StageError::EmptyExtraction);
    }

    info!(
        "preprocessed {} into {} chunks from {} pages",
        ctx.filename,
        chunks.len(),
        pages.len()
    );
    progress.report(100.0).await;
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusChannels, EventBus};
    use crate::job::{JobOptions, StageId};
    use crate::progress::ProgressAccountant;
    use crate::registry::{JobRegistry, RegistryConfig};
    use crate::workers::PlainTextExtractor;
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

    fn ctx(input: &'static [u8]) -> JobContext {
        JobContext::new(
            "j1".to_owned(),
            "a.pdf".to_owned(),
            Bytes::from_static(input),
            JobOptions::default(),
        )
    }

    #[tokio::test]
    async fn produces_ordered_chunks() {
        let acct = accountant();
        let chunks = run(
            &ctx(b"first paragraph\n\nsecond paragraph\x0cthird on page two"),
            &PlainTextExtractor,
            &acct.stage(StageId::PdfPreprocessing),
        )
        .await
        .unwrap();

        assert!(!chunks.is_empty());
        assert!(chunks[0].text.starts_with("first paragraph"));
    }

    #[tokio::test]
    async fn whitespace_only_input_is_empty_extraction() {
        let acct = accountant();
        let result = run(
            &ctx(b"page\x0c"),
            &PlainTextExtractor,
            &acct.stage(StageId::PdfPreprocessing),
        )
        .await;
        assert!(result.is_ok());

        let empty = run(
            &ctx(b"\x0c \x0c"),
            &PlainTextExtractor,
            &acct.stage(StageId::PdfPreprocessing),
        )
        .await;
        assert!(matches!(empty, Err(StageError::EmptyExtraction)));
    }

    #[tokio::test]
    async fn cancellation_wins_before_extraction() {
        let acct = accountant();
        let context = ctx(b"text");
        context.cancel.cancel();

        let result = run(
            &context,
            &PlainTextExtractor,
            &acct.stage(StageId::PdfPreprocessing),
        )
        .await;
        assert!(matches!(result, Err(StageError::Cancelled)));
    }
}

use bytes::Bytes;

use crate::artifact::ArtifactStore;
use crate::context::JobContext;
use crate::document::AssembledDocument;
use crate::error::StageError;
use crate::progress::StageProgress;

/// Serialize the assembled document and upload it. Any failure here is
/// fatal for the job.
pub async fn run(
    ctx: &JobContext,
    store: &dyn ArtifactStore,
    document: &AssembledDocument,
    progress: &StageProgress<'_>,
) -> Result<String, StageError> {
    ctx.checkpoint()?;

    let body = serde_json::to_vec(document)
        .map_err(|err| StageError::Storage(format!("artifact encoding failed: {err}")))?;
    progress.report(30.0).await;

    let url = store.put_json(&ctx.job_id, Bytes::from(body)).await?;
    progress.report(100.0).await;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use crate::bus::{BusChannels, EventBus};
    use crate::document::Page;
    use crate::job::{JobOptions, JobStatus, ResultMetadata, StageId};
    use crate::progress::ProgressAccountant;
    use crate::registry::{JobRegistry, RegistryConfig};
    use chrono::Utc;
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

    fn document() -> AssembledDocument {
        let now = Utc::now();
        AssembledDocument {
            job_id: "j1".to_owned(),
            filename: "a.pdf".to_owned(),
            status: JobStatus::Completed,
            created_at: now,
            completed_at: now,
            processing_time_s: 0.5,
            metadata: ResultMetadata::default(),
            pages: vec![Page {
                page_number: 1,
                original_content: "content".to_owned(),
                blocks: Vec::new(),
            }],
        }
    }

    fn ctx() -> JobContext {
        JobContext::new(
            "j1".to_owned(),
            "a.pdf".to_owned(),
            bytes::Bytes::from_static(b"input"),
            JobOptions::default(),
        )
    }

    #[tokio::test]
    async fn uploads_document_as_json() {
        let acct = accountant();
        let store = MemoryArtifactStore::new();

        let context = ctx();
        let url = run(&context, &store, &document(), &acct.stage(StageId::Storage))
            .await
            .unwrap();

        assert!(url.starts_with("memory://"));
        let key = store.keys().pop().unwrap();
        let stored: AssembledDocument =
            serde_json::from_slice(&store.object(&key).unwrap()).unwrap();
        assert_eq!(stored.job_id, "j1");
        assert_eq!(stored.pages.len(), 1);
    }

    #[tokio::test]
    async fn upload_failure_surfaces_as_storage_error() {
        let acct = accountant();
        let store = MemoryArtifactStore::new();
        store.fail_uploads();

        let context = ctx();
        let result = run(&context, &store, &document(), &acct.stage(StageId::Storage)).await;
        assert!(matches!(result, Err(StageError::Storage(_))));
    }
}

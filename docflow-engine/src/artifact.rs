use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::StageError;

/// Upload target for assembled documents. The storage stage only needs one
/// operation; the trait exists so tests and dry-run deployments can swap in
/// the in-memory store.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload the final JSON artifact and return a retrievable URL.
    async fn put_json(&self, job_id: &str, body: Bytes) -> Result<String, StageError>;
}

/// Deterministic object key: `{prefix}/YYYY/MM/DD/{job_id}.json`.
pub fn artifact_key(prefix: &str, date: DateTime<Utc>, job_id: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    format!("{}/{}/{}.json", prefix, date.format("%Y/%m/%d"), job_id)
}

#[derive(Debug, Clone)]
pub struct S3StoreConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub prefix: String,
    /// Return a pre-signed GET URL instead of the direct object URL.
    pub presign: bool,
    pub presign_expiry: Duration,
}

pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    config: S3StoreConfig,
}

impl S3ArtifactStore {
    /// Credentials come from the default AWS chain (env vars, instance
    /// profile, web identity).
    pub async fn new(config: S3StoreConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config).force_path_style(true);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());

        info!("artifact store initialized for bucket {}", config.bucket);
        Self { client, config }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put_json(&self, job_id: &str, body: Bytes) -> Result<String, StageError> {
        let uploaded_at = Utc::now();
        let key = artifact_key(&self.config.prefix, uploaded_at, job_id);
        let size = body.len();

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type("application/json; charset=utf-8")
            .metadata("job-id", job_id)
            .metadata("uploaded-at", uploaded_at.to_rfc3339())
            .metadata("service", "docflow")
            .send()
            .await
            .map_err(|err| StageError::Storage(format!("upload of {key} failed: {err}")))?;

        metrics::histogram!("docflow_artifact_bytes").record(size as f64);
        info!("uploaded artifact {} ({} bytes)", key, size);

        if self.config.presign {
            let presigning = PresigningConfig::expires_in(self.config.presign_expiry)
                .map_err(|err| StageError::Storage(format!("presign config invalid: {err}")))?;
            let request = self
                .client
                .get_object()
                .bucket(&self.config.bucket)
                .key(&key)
                .presigned(presigning)
                .await
                .map_err(|err| StageError::Storage(format!("presign of {key} failed: {err}")))?;
            return Ok(request.uri().to_string());
        }

        Ok(format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            self.config.bucket, self.config.region, key
        ))
    }
}

/// In-memory store for tests and local dry runs. Upload failures can be
/// scripted to exercise the fatal-storage path.
#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

#[derive(Default)]
struct MemoryStoreState {
    objects: HashMap<String, Bytes>,
    fail: bool,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_uploads(&self) {
        self.state.lock().unwrap().fail = true;
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put_json(&self, job_id: &str, body: Bytes) -> Result<String, StageError> {
        let mut state = self.state.lock().unwrap();
        if state.fail {
            return Err(StageError::Storage("upload rejected".to_owned()));
        }
        let key = artifact_key("artifacts", Utc::now(), job_id);
        state.objects.insert(key.clone(), body);
        Ok(format!("memory://{key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_is_deterministic_and_date_partitioned() {
        let date = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(
            artifact_key("results/", date, "job-1"),
            "results/2026/03/07/job-1.json"
        );
        assert_eq!(
            artifact_key("results", date, "job-1"),
            "results/2026/03/07/job-1.json"
        );
    }

    #[tokio::test]
    async fn memory_store_roundtrip_and_failure() {
        let store = MemoryArtifactStore::new();

        let url = store
            .put_json("j1", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert!(url.starts_with("memory://artifacts/"));
        assert_eq!(store.keys().len(), 1);

        store.fail_uploads();
        let err = store.put_json("j2", Bytes::from_static(b"{}")).await;
        assert!(matches!(err, Err(StageError::Storage(_))));
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use docflow_common::kv::KvClient;
use tracing::{error, warn};

use crate::error::RegistryError;
use crate::job::{JobProgress, JobResult};

const ACTIVE_PREFIX: &str = "job:active:";
const PROGRESS_PREFIX: &str = "progress:";
const RESULT_PREFIX: &str = "result:";

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Liveness marker TTL. Must comfortably exceed the longest expected
    /// pipeline runtime, so a crashed process eventually frees its slots.
    pub active_ttl: Duration,
    pub progress_ttl: Duration,
    pub result_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            active_ttl: Duration::from_secs(2 * 3600),
            progress_ttl: Duration::from_secs(24 * 3600),
            result_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    AlreadyActive,
}

/// Durable job state: liveness markers enforcing one active pipeline per
/// job id, plus progress and result snapshots. All writes for a job come
/// from its owning pipeline, so plain overwrites are safe.
#[derive(Clone)]
pub struct JobRegistry {
    kv: Arc<dyn KvClient + Send + Sync>,
    config: RegistryConfig,
}

impl JobRegistry {
    pub fn new(kv: Arc<dyn KvClient + Send + Sync>, config: RegistryConfig) -> Self {
        Self { kv, config }
    }

    /// Atomically claim the single-active-instance slot for `job_id`.
    pub async fn reserve(&self, job_id: &str) -> Result<Reservation, RegistryError> {
        let claimed = self
            .kv
            .set_nx_ex(
                format!("{ACTIVE_PREFIX}{job_id}"),
                Utc::now().to_rfc3339(),
                self.config.active_ttl,
            )
            .await?;

        Ok(if claimed {
            Reservation::Reserved
        } else {
            Reservation::AlreadyActive
        })
    }

    /// Clear the liveness marker on a terminal transition.
    pub async fn release(&self, job_id: &str) {
        if let Err(err) = self.kv.del(format!("{ACTIVE_PREFIX}{job_id}")).await {
            // The TTL will reap the marker; the slot stays blocked until then.
            error!("failed to release job slot for {}: {}", job_id, err);
        }
    }

    /// Overwrite the progress snapshot. Progress is advisory: a failed
    /// write is retried once and then dropped, it never fails the job.
    pub async fn write_progress(&self, snapshot: &JobProgress) {
        let key = format!("{PROGRESS_PREFIX}{}", snapshot.job_id);
        let payload = match serde_json::to_string(snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to encode progress snapshot for {}: {}", snapshot.job_id, err);
                return;
            }
        };

        for attempt in 0..2 {
            match self
                .kv
                .set_ex(key.clone(), payload.clone(), self.config.progress_ttl)
                .await
            {
                Ok(()) => return,
                Err(err) if attempt == 0 => {
                    warn!("progress write for {} failed, retrying once: {}", snapshot.job_id, err);
                }
                Err(err) => {
                    error!("progress write for {} failed: {}", snapshot.job_id, err);
                }
            }
        }
    }

    pub async fn read_progress(&self, job_id: &str) -> Result<Option<JobProgress>, RegistryError> {
        let raw = self.kv.get(format!("{PROGRESS_PREFIX}{job_id}")).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist the result snapshot. Write-once: a job whose status is
    /// already terminal keeps its existing result. Returns whether the
    /// write happened. Unlike progress, a failure here is fatal for the
    /// job; the caller surfaces it.
    pub async fn write_result(&self, result: &JobResult) -> Result<bool, RegistryError> {
        if let Some(progress) = self.read_progress(&result.job_id).await? {
            if progress.status.is_terminal() {
                warn!("refusing result write for {} after terminal transition", result.job_id);
                return Ok(false);
            }
        }

        let payload = serde_json::to_string(result)?;
        self.kv
            .set_ex(
                format!("{RESULT_PREFIX}{}", result.job_id),
                payload,
                self.config.result_ttl,
            )
            .await?;
        Ok(true)
    }

    pub async fn read_result(&self, job_id: &str) -> Result<Option<JobResult>, RegistryError> {
        let raw = self.kv.get(format!("{RESULT_PREFIX}{job_id}")).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Best-effort view of the active set, straight from the liveness
    /// markers.
    pub async fn list_active(&self) -> Result<Vec<String>, RegistryError> {
        let keys = self.kv.keys(format!("{ACTIVE_PREFIX}*")).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(ACTIVE_PREFIX).map(str::to_owned))
            .collect())
    }

    pub async fn is_active(&self, job_id: &str) -> Result<bool, RegistryError> {
        Ok(self
            .kv
            .get(format!("{ACTIVE_PREFIX}{job_id}"))
            .await?
            .is_some())
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use docflow_common::kv::KvClient;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Wire format of a progress message. Field names are fixed by the
/// subscriber contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMessage {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub s3_url: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureMessage {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct BusChannels {
    pub progress: String,
    pub result: String,
    pub failure: String,
}

impl Default for BusChannels {
    fn default() -> Self {
        Self {
            progress: "progress-channel".to_owned(),
            result: "result-channel".to_owned(),
            failure: "failure-channel".to_owned(),
        }
    }
}

/// Fire-and-forget publisher for job lifecycle messages. Publish failures
/// are logged and dropped: observers tolerate missed progress, and the
/// durable snapshots in the registry remain the source of truth.
#[derive(Clone)]
pub struct EventBus {
    kv: Arc<dyn KvClient + Send + Sync>,
    channels: BusChannels,
}

impl EventBus {
    pub fn new(kv: Arc<dyn KvClient + Send + Sync>, channels: BusChannels) -> Self {
        Self { kv, channels }
    }

    pub async fn publish_progress(&self, job_id: &str, progress: f64, step: Option<&str>) {
        let message = ProgressMessage {
            job_id: job_id.to_owned(),
            progress,
            step: step.map(str::to_owned),
            timestamp: Utc::now(),
        };
        self.publish(&self.channels.progress, &message).await;
    }

    pub async fn publish_result(&self, job_id: &str, s3_url: &str) {
        let message = ResultMessage {
            job_id: job_id.to_owned(),
            s3_url: s3_url.to_owned(),
            timestamp: Utc::now(),
        };
        self.publish(&self.channels.result, &message).await;
        metrics::counter!("docflow_bus_results_total").increment(1);
    }

    pub async fn publish_failure(&self, job_id: &str, error: &str) {
        let message = FailureMessage {
            job_id: job_id.to_owned(),
            error: error.to_owned(),
        };
        self.publish(&self.channels.failure, &message).await;
        metrics::counter!("docflow_bus_failures_total").increment(1);
    }

    async fn publish<T: Serialize>(&self, channel: &str, message: &T) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to encode bus message: {}", err);
                return;
            }
        };

        debug!("publishing to {}: {}", channel, payload);
        if let Err(err) = self.kv.publish(channel.to_owned(), payload).await {
            error!("failed to publish on {}: {}", channel, err);
        }
    }
}

use std::sync::Arc;

use docflow_common::health::HealthRegistry;
use docflow_common::kv::KvClient;
use docflow_engine::job::JobOptions;
use docflow_engine::orchestrator::Orchestrator;

pub mod app;
pub mod jobs;
pub mod process;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub liveness: HealthRegistry,
    pub kv: Arc<dyn KvClient + Send + Sync>,
    /// Per-job option defaults, from configuration.
    pub defaults: JobOptions,
    pub max_upload_bytes: usize,
}

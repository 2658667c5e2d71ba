use std::str::FromStr;
use std::time::Duration;

use docflow_common::retry::RetryPolicy;
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3800")]
    pub port: u16,

    #[envconfig(default = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    #[envconfig(default = "progress-channel")]
    pub progress_channel: String,

    #[envconfig(default = "result-channel")]
    pub result_channel: String,

    #[envconfig(default = "failure-channel")]
    pub failure_channel: String,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    /// Base URL of the callback consumer; callbacks are disabled when
    /// unset.
    pub callback_base_url: Option<String>,
    pub callback_token: Option<String>,

    /// Artifact uploads go to the in-memory store when no bucket is
    /// configured; useful for local runs only.
    pub s3_bucket: Option<String>,
    #[envconfig(default = "us-east-1")]
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    #[envconfig(default = "docflow-results")]
    pub s3_prefix: String,
    #[envconfig(default = "false")]
    pub s3_presign: bool,
    #[envconfig(default = "86400")]
    pub s3_presign_expiry_secs: u64,

    #[envconfig(default = "https://api.anthropic.com/v1/messages")]
    pub llm_api_url: String,
    /// The transformer and vocabulary analyzer run against scripted mocks
    /// when no key is configured.
    pub llm_api_key: Option<String>,
    #[envconfig(default = "claude-sonnet-4-20250514")]
    pub llm_model: String,
    #[envconfig(default = "8192")]
    pub llm_max_tokens: usize,
    #[envconfig(default = "120000")]
    pub llm_timeout: EnvMsDuration,

    /// Image generation service; mocked when unset.
    pub image_api_url: Option<String>,
    #[envconfig(default = "60000")]
    pub image_timeout: EnvMsDuration,

    #[envconfig(default = "12000")]
    pub max_tokens_per_chunk: usize,
    #[envconfig(default = "8")]
    pub transform_concurrency: usize,
    #[envconfig(default = "3")]
    pub image_concurrency: usize,
    #[envconfig(default = "3")]
    pub enrich_concurrency: usize,
    #[envconfig(default = "15")]
    pub word_limit: usize,
    #[envconfig(default = "true")]
    pub enable_enrichment: bool,

    #[envconfig(default = "7200")]
    pub active_ttl_secs: u64,
    #[envconfig(default = "86400")]
    pub snapshot_ttl_secs: u64,

    #[envconfig(default = "10000")]
    pub callback_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub transform_retry: TransformRetryConfig,

    #[envconfig(nested = true)]
    pub callback_retry: CallbackRetryConfig,

    /// Upper bound on uploaded file size, in bytes.
    #[envconfig(default = "52428800")]
    pub max_upload_bytes: usize,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct TransformRetryConfig {
    #[envconfig(from = "TRANSFORM_MAX_RETRIES", default = "2")]
    pub max_retries: u32,

    #[envconfig(from = "TRANSFORM_RETRY_BASE", default = "3000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "TRANSFORM_RETRY_CAP", default = "30000")]
    pub maximum_interval: EnvMsDuration,
}

impl TransformRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.initial_interval.0,
            self.maximum_interval.0,
        )
    }
}

#[derive(Envconfig, Clone)]
pub struct CallbackRetryConfig {
    #[envconfig(from = "CALLBACK_MAX_RETRIES", default = "2")]
    pub max_retries: u32,

    #[envconfig(from = "CALLBACK_RETRY_BASE", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "CALLBACK_RETRY_CAP", default = "20000")]
    pub maximum_interval: EnvMsDuration,
}

impl CallbackRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.initial_interval.0,
            self.maximum_interval.0,
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

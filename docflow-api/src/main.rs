use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;

use docflow_common::health::HealthRegistry;
use docflow_common::kv::{KvClient, RedisKvClient};
use docflow_common::metrics::{setup_metrics_recorder, setup_metrics_routes};
use docflow_engine::artifact::{ArtifactStore, MemoryArtifactStore, S3ArtifactStore, S3StoreConfig};
use docflow_engine::bus::{BusChannels, EventBus};
use docflow_engine::job::JobOptions;
use docflow_engine::notifier::{Notifier, NotifierConfig};
use docflow_engine::orchestrator::Orchestrator;
use docflow_engine::registry::{JobRegistry, RegistryConfig};
use docflow_engine::runner::{Pipeline, PipelineSettings};
use docflow_engine::workers::{
    ContentTransformer, HttpImageGenerator, ImageGenerator, LlmClient, LlmConfig, LlmTransformer,
    LlmVocabularyAnalyzer, MockImageGenerator, MockPhonemeAnalyzer, MockTransformer,
    MockVocabularyAnalyzer, PlainTextExtractor, VocabularyAnalyzer,
};

use config::Config;
use handlers::AppState;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

fn build_pipeline(config: &Config, kv: Arc<dyn KvClient + Send + Sync>, store: Arc<dyn ArtifactStore>) -> Pipeline {
    let registry = JobRegistry::new(
        kv.clone(),
        RegistryConfig {
            active_ttl: Duration::from_secs(config.active_ttl_secs),
            progress_ttl: Duration::from_secs(config.snapshot_ttl_secs),
            result_ttl: Duration::from_secs(config.snapshot_ttl_secs),
        },
    );

    let bus = EventBus::new(
        kv,
        BusChannels {
            progress: config.progress_channel.clone(),
            result: config.result_channel.clone(),
            failure: config.failure_channel.clone(),
        },
    );

    let notifier = Notifier::new(NotifierConfig {
        callback_base: config.callback_base_url.clone(),
        callback_token: config.callback_token.clone(),
        request_timeout: config.callback_timeout.0,
        retry: config.callback_retry.policy(),
        ..NotifierConfig::default()
    });

    let (transformer, vocabulary): (Arc<dyn ContentTransformer>, Arc<dyn VocabularyAnalyzer>) =
        match &config.llm_api_key {
            Some(key) => {
                let llm = Arc::new(LlmClient::new(LlmConfig {
                    api_url: config.llm_api_url.clone(),
                    api_key: key.clone(),
                    model: config.llm_model.clone(),
                    max_tokens: config.llm_max_tokens,
                    request_timeout: config.llm_timeout.0,
                }));
                (
                    Arc::new(LlmTransformer::new(llm.clone())),
                    Arc::new(LlmVocabularyAnalyzer::new(llm)),
                )
            }
            None => {
                tracing::warn!("LLM_API_KEY unset, transformation runs against mocks");
                (
                    Arc::new(MockTransformer::new()),
                    Arc::new(MockVocabularyAnalyzer),
                )
            }
        };

    let images: Arc<dyn ImageGenerator> = match &config.image_api_url {
        Some(url) => Arc::new(HttpImageGenerator::new(url.clone(), config.image_timeout.0)),
        None => {
            tracing::warn!("IMAGE_API_URL unset, image generation runs against mocks");
            Arc::new(MockImageGenerator::new())
        }
    };

    Pipeline {
        registry,
        bus,
        store,
        notifier: Arc::new(notifier),
        extractor: Arc::new(PlainTextExtractor),
        transformer,
        images,
        vocabulary,
        // The production phoneme analyzer is an external worker; wire it
        // here when one is deployed.
        phonemes: Arc::new(MockPhonemeAnalyzer),
        settings: PipelineSettings {
            transform_retry: config.transform_retry.policy(),
            image_retry: config.transform_retry.policy(),
            enrich_retry: config.transform_retry.policy(),
        },
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let kv: Arc<dyn KvClient + Send + Sync> = Arc::new(
        RedisKvClient::new(config.redis_url.clone()).expect("failed to create redis client"),
    );

    let store: Arc<dyn ArtifactStore> = match &config.s3_bucket {
        Some(bucket) => Arc::new(
            S3ArtifactStore::new(S3StoreConfig {
                bucket: bucket.clone(),
                region: config.s3_region.clone(),
                endpoint: config.s3_endpoint.clone(),
                prefix: config.s3_prefix.clone(),
                presign: config.s3_presign,
                presign_expiry: Duration::from_secs(config.s3_presign_expiry_secs),
            })
            .await,
        ),
        None => {
            tracing::warn!("S3_BUCKET unset, artifacts stay in memory");
            Arc::new(MemoryArtifactStore::new())
        }
    };

    let pipeline = build_pipeline(&config, kv.clone(), store);
    let orchestrator = Arc::new(Orchestrator::new(Arc::new(pipeline)));

    let liveness = HealthRegistry::new("liveness");
    let heartbeat = liveness.register("api", chrono::Duration::seconds(60));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            interval.tick().await;
            heartbeat.report_healthy();
        }
    });

    let defaults = JobOptions {
        max_tokens: config.max_tokens_per_chunk,
        max_concurrent: config.transform_concurrency,
        image_max_concurrent: config.image_concurrency,
        enable_enrichment: config.enable_enrichment,
        enrich_max_concurrent: config.enrich_concurrency,
        word_limit: config.word_limit,
        ..JobOptions::default()
    };

    let state = AppState {
        orchestrator,
        liveness,
        kv,
        defaults,
        max_upload_bytes: config.max_upload_bytes,
    };

    let mut app = handlers::app::router(state);
    if config.export_prometheus {
        let recorder_handle = setup_metrics_recorder();
        app = setup_metrics_routes(app, recorder_handle);
    }

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start docflow-api http server, {}", e),
    }
}

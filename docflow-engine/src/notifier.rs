use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use docflow_common::retry::RetryPolicy;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::document::{Block, VocabularyItem};
use crate::workers::{is_retryable_status, PhonemeAnalyzer, VocabularyAnalyzer};

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Base URL of the callback consumer. `None` disables all callbacks.
    pub callback_base: Option<String>,
    pub callback_token: Option<String>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Upper bound on queued block-level callback tasks per job. Blocks
    /// beyond the bound are dropped with a warning; callbacks are
    /// best-effort by contract.
    pub block_queue_limit: usize,
    /// Concurrent block callbacks per job.
    pub block_concurrency: usize,
    /// How long the pipeline waits for straggling block callbacks before
    /// declaring the job complete anyway.
    pub drain_grace: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            callback_base: None,
            callback_token: None,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(20)),
            block_queue_limit: 256,
            block_concurrency: 4,
            drain_grace: Duration::from_secs(15),
        }
    }
}

/// Outbound HTTP callbacks. Delivery is best-effort at-least-once: retries
/// with backoff on 429/5xx/transport errors, terminal on other 4xx, and a
/// dead-letter warning on exhaustion. Nothing here can fail a job.
pub struct Notifier {
    client: reqwest::Client,
    config: NotifierConfig,
}

impl Notifier {
    pub fn new(config: NotifierConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to construct reqwest client for notifier");

        Self { client, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.callback_base.is_some()
    }

    /// POST the completed document to the consumer. Returns whether the
    /// callback was delivered; the caller only logs the answer.
    pub async fn document_complete(&self, job_id: &str, pdf_name: &str, data: &Value) -> bool {
        let Some(base) = &self.config.callback_base else {
            debug!("callbacks disabled, skipping document-complete for {}", job_id);
            return true;
        };

        let url = format!("{}/api/document/complete", base.trim_end_matches('/'));
        let payload = json!({
            "jobId": job_id,
            "pdfName": pdf_name,
            "data": data,
        });

        let delivered = self.post_with_retry(&url, &payload).await;
        let outcome = if delivered { "delivered" } else { "dead_letter" };
        metrics::counter!("docflow_callbacks_total", "kind" => "document", "outcome" => outcome)
            .increment(1);

        if !delivered {
            // Dead-letter: the job stays COMPLETED, the consumer has the
            // result channel and the status API to fall back on.
            warn!("document-complete callback for {} exhausted retries", job_id);
        }
        delivered
    }

    /// Single-attempt POST for a block-level payload.
    async fn post_block(&self, url: &str, payload: &Value) -> bool {
        match self.post_once(url, payload).await {
            Ok(()) => true,
            Err(err) => {
                debug!("block callback failed: {}", err);
                false
            }
        }
    }

    async fn post_with_retry(&self, url: &str, payload: &Value) -> bool {
        let mut attempt = 0u32;
        loop {
            match self.post_once(url, payload).await {
                Ok(()) => return true,
                Err(PostError::Terminal(detail)) => {
                    warn!("callback to {} rejected: {}", url, detail);
                    return false;
                }
                Err(PostError::Retryable(detail)) => {
                    if attempt >= self.config.retry.max_retries {
                        warn!("callback to {} failed after {} attempts: {}", url, attempt + 1, detail);
                        return false;
                    }
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    debug!("callback to {} failed ({}), retrying in {:?}", url, detail, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn post_once(&self, url: &str, payload: &Value) -> Result<(), PostError> {
        let mut request = self.client.post(url).json(payload);
        if let Some(token) = &self.config.callback_token {
            request = request.header("X-Callback-Token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| PostError::Retryable(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = format!("status {status}");
        if is_retryable_status(status) {
            Err(PostError::Retryable(detail))
        } else {
            Err(PostError::Terminal(detail))
        }
    }
}

enum PostError {
    Retryable(String),
    Terminal(String),
}

impl std::fmt::Display for PostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostError::Retryable(s) | PostError::Terminal(s) => write!(f, "{s}"),
        }
    }
}

/// Per-block vocabulary payload. Keys are duplicated in snake_case and
/// camelCase because consumer schemas disagree.
pub fn block_callback_payload(
    job_id: &str,
    textbook_id: Option<&str>,
    page_number: usize,
    block_id: &str,
    original_sentence: &str,
    vocabulary_items: &[VocabularyItem],
) -> Value {
    let created_at = Utc::now().to_rfc3339();
    let items = serde_json::to_value(vocabulary_items).unwrap_or_else(|_| json!([]));

    json!({
        "job_id": job_id,
        "jobId": job_id,
        "textbook_id": textbook_id,
        "textbookId": textbook_id,
        "page_number": page_number,
        "pageNumber": page_number,
        "block_id": block_id,
        "blockId": block_id,
        "original_sentence": original_sentence,
        "originalSentence": original_sentence,
        "vocabulary_items": items.clone(),
        "vocabularyItems": items,
        "created_at": created_at,
        "createdAt": created_at,
    })
}

/// Supervised background queue for block-level callbacks. Tasks run beside
/// the pipeline without ever blocking it; the runner drains the queue (with
/// a grace period) before declaring the job complete. Dropping the queue
/// aborts whatever is still in flight, which is what cancellation wants.
pub struct BlockCallbacks {
    notifier: Arc<Notifier>,
    vocabulary: Arc<dyn VocabularyAnalyzer>,
    phonemes: Option<Arc<dyn PhonemeAnalyzer>>,
    job_id: String,
    textbook_id: Option<String>,
    word_limit: usize,
    semaphore: Arc<Semaphore>,
    queue_limit: usize,
    drain_grace: Duration,
    tasks: JoinSet<()>,
}

impl BlockCallbacks {
    pub fn new(
        notifier: Arc<Notifier>,
        vocabulary: Arc<dyn VocabularyAnalyzer>,
        phonemes: Option<Arc<dyn PhonemeAnalyzer>>,
        job_id: &str,
        textbook_id: Option<String>,
        word_limit: usize,
    ) -> Self {
        let config = &notifier.config;
        Self {
            semaphore: Arc::new(Semaphore::new(config.block_concurrency)),
            queue_limit: config.block_queue_limit,
            drain_grace: config.drain_grace,
            notifier,
            vocabulary,
            phonemes,
            job_id: job_id.to_owned(),
            textbook_id,
            word_limit,
            tasks: JoinSet::new(),
        }
    }

    /// Schedule the enrich-and-notify task for one produced text block.
    /// Never blocks: over-limit blocks are dropped with a warning.
    pub fn schedule(&mut self, page_number: usize, block: &Block) {
        if !self.notifier.is_enabled() {
            return;
        }
        let Some(text) = block.text.clone() else {
            return;
        };
        if self.tasks.len() >= self.queue_limit {
            warn!(
                "block callback queue full for {}, dropping block {}",
                self.job_id, block.id
            );
            metrics::counter!("docflow_block_callbacks_dropped_total").increment(1);
            return;
        }

        let notifier = self.notifier.clone();
        let vocabulary = self.vocabulary.clone();
        let phonemes = self.phonemes.clone();
        let semaphore = self.semaphore.clone();
        let job_id = self.job_id.clone();
        let textbook_id = self.textbook_id.clone();
        let block_id = block.id.clone();
        let word_limit = self.word_limit;

        self.tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };

            let items = match vocabulary.analyze(&text, word_limit).await {
                Ok(items) => items,
                Err(err) => {
                    debug!("vocabulary analysis failed for block {}: {}", block_id, err);
                    return;
                }
            };
            if items.is_empty() {
                return;
            }

            let mut payload =
                block_callback_payload(&job_id, textbook_id.as_deref(), page_number, &block_id, &text, &items);

            if let Some(phonemes) = phonemes {
                if let Ok(analysis) = phonemes.analyze_block(&text).await {
                    payload["phoneme_analysis"] = analysis.clone();
                    payload["phonemeAnalysis"] = analysis;
                }
            }

            let Some(base) = &notifier.config.callback_base else {
                return;
            };
            let url = format!("{}/api/vocabulary/block", base.trim_end_matches('/'));
            let delivered = notifier.post_block(&url, &payload).await;
            let outcome = if delivered { "delivered" } else { "failed" };
            metrics::counter!("docflow_callbacks_total", "kind" => "block", "outcome" => outcome)
                .increment(1);
        });
    }

    pub fn scheduled(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for in-flight callbacks, up to the grace period. Leftover tasks
    /// are aborted; they are best-effort by contract.
    pub async fn drain(mut self) {
        let waited = tokio::time::timeout(self.drain_grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        if waited.is_err() {
            warn!(
                "abandoning {} block callbacks for {} after grace period",
                self.tasks.len(),
                self.job_id
            );
        }
    }
}

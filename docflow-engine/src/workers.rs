use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::document::{Chunk, VocabularyItem};
use crate::error::StageError;

/// One page of extracted text, in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub number: usize,
    pub text: String,
}

/// PDF/text extraction. The production extractor is an external service;
/// anything implementing this trait plugs into the preprocessing stage.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, filename: &str, bytes: &[u8]) -> Result<Vec<PageText>, StageError>;
}

/// LLM-backed chunk-to-blocks transformation. Returns the raw model
/// response; parsing and salvage happen in the stage so parse failures are
/// never retried as transport failures.
#[async_trait]
pub trait ContentTransformer: Send + Sync {
    async fn transform_chunk(&self, chunk: &Chunk) -> Result<String, StageError>;
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generate an image for `prompt` and return its retrievable URL.
    async fn generate(&self, job_id: &str, prompt: &str) -> Result<String, StageError>;
}

#[async_trait]
pub trait VocabularyAnalyzer: Send + Sync {
    async fn analyze(&self, text: &str, word_limit: usize)
        -> Result<Vec<VocabularyItem>, StageError>;
}

#[async_trait]
pub trait PhonemeAnalyzer: Send + Sync {
    async fn analyze_block(&self, text: &str) -> Result<serde_json::Value, StageError>;
}

/// Retry classification shared by every outbound HTTP call: 429 and 5xx
/// are worth retrying, other 4xx are deterministic client errors.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn classify_response_error(status: StatusCode, detail: &str) -> StageError {
    if is_retryable_status(status) {
        StageError::Transient(format!("upstream returned {status}: {detail}"))
    } else {
        StageError::Permanent(format!("upstream returned {status}: {detail}"))
    }
}

/// Plain-text extractor used as the built-in fallback and in tests. Pages
/// are separated by form feeds, the way text-layer dumps arrive.
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, filename: &str, bytes: &[u8]) -> Result<Vec<PageText>, StageError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| StageError::InputUnreadable(format!("{filename} is not valid text")))?;

        let pages: Vec<PageText> = text
            .split('\u{0c}')
            .enumerate()
            .filter(|(_, page)| !page.trim().is_empty())
            .map(|(i, page)| PageText {
                number: i + 1,
                text: page.to_owned(),
            })
            .collect();

        if pages.is_empty() {
            return Err(StageError::EmptyExtraction);
        }
        Ok(pages)
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: usize,
    pub request_timeout: Duration,
}

/// Shared client for the messages API of the configured LLM. The
/// transformer and the vocabulary analyzer both speak through it.
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<MessageContent>,
}

#[derive(Deserialize)]
struct MessageContent {
    text: String,
}

const TRANSFORM_INSTRUCTION: &str = "Rewrite the following textbook passage into accessible \
reading blocks. Respond with a JSON array of blocks, each {\"id\", \"type\", \"text\"} with type \
one of TEXT, HEADING, LIST, TABLE, PAGE_IMAGE. Respond with JSON only.";

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to construct reqwest client for llm calls");

        Self { client, config }
    }

    pub async fn complete(&self, prompt: String) -> Result<String, StageError> {
        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|err| StageError::Transient(format!("llm request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_response_error(status, &detail));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|err| StageError::Permanent(format!("unreadable llm response: {err}")))?;

        let text = parsed
            .content
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");
        debug!("llm returned {} chars", text.len());
        Ok(text)
    }
}

pub struct LlmTransformer {
    llm: Arc<LlmClient>,
}

impl LlmTransformer {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ContentTransformer for LlmTransformer {
    async fn transform_chunk(&self, chunk: &Chunk) -> Result<String, StageError> {
        self.llm
            .complete(format!("{TRANSFORM_INSTRUCTION}\n\n{}", chunk.text))
            .await
    }
}

const VOCABULARY_INSTRUCTION: &str = "List the words in the following passage a struggling \
reader would find difficult, at most {limit}. Respond with a JSON array of \
{\"word\", \"meaning\", \"example\"} objects and nothing else.";

pub struct LlmVocabularyAnalyzer {
    llm: Arc<LlmClient>,
}

impl LlmVocabularyAnalyzer {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl VocabularyAnalyzer for LlmVocabularyAnalyzer {
    async fn analyze(
        &self,
        text: &str,
        word_limit: usize,
    ) -> Result<Vec<VocabularyItem>, StageError> {
        let instruction = VOCABULARY_INSTRUCTION.replace("{limit}", &word_limit.to_string());
        let raw = self.llm.complete(format!("{instruction}\n\n{text}")).await?;

        let trimmed = raw.trim();
        let payload = match (trimmed.find('['), trimmed.rfind(']')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => {
                return Err(StageError::Permanent(
                    "vocabulary response carries no JSON array".to_owned(),
                ))
            }
        };

        let mut items: Vec<VocabularyItem> = serde_json::from_str(payload)
            .map_err(|err| StageError::Permanent(format!("unreadable vocabulary response: {err}")))?;
        items.truncate(word_limit);
        Ok(items)
    }
}

/// Adapter for the external image generation service.
pub struct HttpImageGenerator {
    client: reqwest::Client,
    api_url: String,
}

#[derive(Deserialize)]
struct ImageResponse {
    url: String,
}

impl HttpImageGenerator {
    pub fn new(api_url: String, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for image generation");

        Self { client, api_url }
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, job_id: &str, prompt: &str) -> Result<String, StageError> {
        let response = self
            .client
            .post(&self.api_url)
            .json(&json!({ "job_id": job_id, "prompt": prompt }))
            .send()
            .await
            .map_err(|err| StageError::Transient(format!("image request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_response_error(status, &detail));
        }

        let parsed: ImageResponse = response
            .json()
            .await
            .map_err(|err| StageError::Permanent(format!("unreadable image response: {err}")))?;
        Ok(parsed.url)
    }
}

// Scripted in-memory workers, for tests and the dry-run wiring.

/// Transformer that replays canned responses per chunk index, with optional
/// scripted failures. Thread-safe so fan-out tests can share it.
#[derive(Clone, Default)]
pub struct MockTransformer {
    state: Arc<Mutex<MockTransformerState>>,
}

#[derive(Default)]
struct MockTransformerState {
    responses: HashMap<usize, String>,
    /// chunk index -> number of transient failures before success
    transient_failures: HashMap<usize, usize>,
    permanent_failures: Vec<usize>,
    calls: usize,
}

impl MockTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, chunk_index: usize, response: &str) -> &Self {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert(chunk_index, response.to_owned());
        self
    }

    pub fn fail_transiently(&self, chunk_index: usize, times: usize) -> &Self {
        self.state
            .lock()
            .unwrap()
            .transient_failures
            .insert(chunk_index, times);
        self
    }

    pub fn fail_permanently(&self, chunk_index: usize) -> &Self {
        self.state.lock().unwrap().permanent_failures.push(chunk_index);
        self
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }
}

#[async_trait]
impl ContentTransformer for MockTransformer {
    async fn transform_chunk(&self, chunk: &Chunk) -> Result<String, StageError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;

        if state.permanent_failures.contains(&chunk.index) {
            return Err(StageError::Permanent("scripted permanent failure".to_owned()));
        }
        if let Some(remaining) = state.transient_failures.get_mut(&chunk.index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StageError::Transient("scripted transient failure".to_owned()));
            }
        }

        Ok(state
            .responses
            .get(&chunk.index)
            .cloned()
            .unwrap_or_else(|| {
                format!(r#"[{{"id":"c{}-b0","type":"TEXT","text":"block"}}]"#, chunk.index)
            }))
    }
}

/// Image generator returning deterministic URLs, with scripted failures.
#[derive(Clone, Default)]
pub struct MockImageGenerator {
    failing_prompts: Arc<Mutex<Vec<String>>>,
}

impl MockImageGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, prompt: &str) -> &Self {
        self.failing_prompts.lock().unwrap().push(prompt.to_owned());
        self
    }
}

#[async_trait]
impl ImageGenerator for MockImageGenerator {
    async fn generate(&self, job_id: &str, prompt: &str) -> Result<String, StageError> {
        if self.failing_prompts.lock().unwrap().iter().any(|p| p == prompt) {
            return Err(StageError::Permanent("scripted image failure".to_owned()));
        }
        Ok(format!("https://images.example.com/{job_id}/{}.png", prompt.len()))
    }
}

/// Vocabulary analyzer that marks every word longer than six letters.
#[derive(Clone, Default)]
pub struct MockVocabularyAnalyzer;

#[async_trait]
impl VocabularyAnalyzer for MockVocabularyAnalyzer {
    async fn analyze(
        &self,
        text: &str,
        word_limit: usize,
    ) -> Result<Vec<VocabularyItem>, StageError> {
        Ok(text
            .split_whitespace()
            .filter(|w| w.len() > 6)
            .take(word_limit)
            .map(|w| VocabularyItem {
                word: w.to_owned(),
                meaning: None,
                example: None,
            })
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct MockPhonemeAnalyzer;

#[async_trait]
impl PhonemeAnalyzer for MockPhonemeAnalyzer {
    async fn analyze_block(&self, text: &str) -> Result<serde_json::Value, StageError> {
        Ok(json!({ "syllable_count": text.split_whitespace().count() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification_matches_policy() {
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn plain_text_extractor_splits_pages_on_form_feed() {
        let pages = PlainTextExtractor
            .extract("a.txt", b"page one\x0cpage two")
            .await
            .unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].number, 1);
        assert_eq!(pages[1].text, "page two");
    }

    #[tokio::test]
    async fn plain_text_extractor_error_cases() {
        let empty = PlainTextExtractor.extract("a.txt", b"  \x0c  ").await;
        assert!(matches!(empty, Err(StageError::EmptyExtraction)));

        let broken = PlainTextExtractor.extract("a.bin", &[0xff, 0xfe]).await;
        assert!(matches!(broken, Err(StageError::InputUnreadable(_))));
    }

    #[tokio::test]
    async fn mock_transformer_scripts_failures() {
        let transformer = MockTransformer::new();
        transformer.fail_transiently(0, 1);

        let chunk = Chunk {
            index: 0,
            text: "t".to_owned(),
            token_estimate: 1,
        };

        assert!(transformer.transform_chunk(&chunk).await.is_err());
        assert!(transformer.transform_chunk(&chunk).await.is_ok());
        assert_eq!(transformer.calls(), 2);
    }
}

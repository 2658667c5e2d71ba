use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobStatus, ResultMetadata};

/// A typed structural element of the output document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockKind {
    Text,
    Heading,
    List,
    Table,
    PageImage,
}

/// Per-word enrichment attached to a block by the vocabulary analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyItem {
    pub word: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meaning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BlockKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
    /// Prompt for the image generator; only meaningful on PAGE_IMAGE blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_prompt: Option<String>,
    /// Set by image processing on success; absent otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vocabulary: Vec<VocabularyItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phonemes: Option<serde_json::Value>,
}

impl Block {
    pub fn text_block(id: &str, text: &str) -> Block {
        Block {
            id: id.to_owned(),
            kind: BlockKind::Text,
            text: Some(text.to_owned()),
            items: Vec::new(),
            image_prompt: None,
            url: None,
            vocabulary: Vec::new(),
            phonemes: None,
        }
    }
}

/// A contiguous span of input text sized to a token budget; the unit of
/// transformation parallelism and, downstream, one output page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub token_estimate: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub page_number: usize,
    pub original_content: String,
    pub blocks: Vec<Block>,
}

/// The final artifact uploaded to the object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledDocument {
    pub job_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub processing_time_s: f64,
    pub metadata: ResultMetadata,
    pub pages: Vec<Page>,
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("response carries no JSON payload")]
    NoJson,
    #[error("invalid block JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct BlockEnvelope {
    blocks: Vec<Block>,
}

/// Strict parse of a transformer response into blocks. Accepts a bare JSON
/// array or a `{"blocks": [...]}` envelope, optionally inside a fenced code
/// block. Anything else is a `ParseError`; the caller decides whether to
/// salvage.
pub fn parse_blocks(response: &str) -> Result<Vec<Block>, ParseError> {
    let payload = strip_code_fence(response.trim());
    if payload.is_empty() {
        return Err(ParseError::NoJson);
    }

    if payload.starts_with('[') {
        return Ok(serde_json::from_str::<Vec<Block>>(payload)?);
    }
    if payload.starts_with('{') {
        return Ok(serde_json::from_str::<BlockEnvelope>(payload)?.blocks);
    }
    Err(ParseError::NoJson)
}

/// Best-effort recovery of blocks from a malformed response. Tries to carve
/// out the outermost JSON array; falls back to wrapping the raw text in a
/// single TEXT block. Returns an empty vec only for blank input.
pub fn salvage_blocks(response: &str, id_prefix: &str) -> Vec<Block> {
    let payload = strip_code_fence(response.trim());

    if let (Some(start), Some(end)) = (payload.find('['), payload.rfind(']')) {
        if start < end {
            if let Ok(blocks) = serde_json::from_str::<Vec<Block>>(&payload[start..=end]) {
                return blocks;
            }
        }
    }

    if payload.is_empty() {
        return Vec::new();
    }

    vec![Block::text_block(&format!("{id_prefix}-salvaged"), payload)]
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Rough token count used for chunk budgeting. Four characters per token is
/// close enough for packing; exactness doesn't matter here.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4).max(1)
}

/// Collapse runs of whitespace and split page text into paragraphs on blank
/// lines, preserving order.
pub fn normalize_paragraphs(raw: &str) -> Vec<String> {
    raw.split("\n\n")
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .collect()
}

/// Greedily pack paragraphs into chunks of at most `max_tokens` each. A
/// single paragraph over the budget becomes its own chunk rather than being
/// split mid-sentence.
pub fn pack_chunks(paragraphs: &[String], max_tokens: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;

    for paragraph in paragraphs {
        let tokens = estimate_tokens(paragraph);
        if !current.is_empty() && current_tokens + tokens > max_tokens {
            chunks.push(Chunk {
                index: chunks.len(),
                token_estimate: current_tokens,
                text: std::mem::take(&mut current),
            });
            current_tokens = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
        current_tokens += tokens;
    }

    if !current.is_empty() {
        chunks.push(Chunk {
            index: chunks.len(),
            token_estimate: current_tokens,
            text: current,
        });
    }

    chunks
}

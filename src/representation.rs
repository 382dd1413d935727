//! Representation generators.
//!
//! The Enriched→Indexed stage hands chunk text to a
//! [`RepresentationGenerator`] and expects exactly one [`Representation`]
//! back per chunk, in input order. Three generators ship with the crate:
//!
//! - **[`HashingEmbedder`]**: deterministic feature-hashing vectors,
//!   computed locally. The default; needs no network.
//! - **[`SummaryGenerator`]**: extractive summary made of the leading
//!   sentences of each chunk.
//! - **[`OpenAiEmbedder`]**: calls the OpenAI embeddings API with batching,
//!   retry and backoff.
//!
//! # Retry Strategy
//!
//! The OpenAI generator uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;

use crate::config::RepresentationConfig;
use crate::error::{GovernanceError, Result};
use crate::models::Representation;

/// External generator turning chunk text into searchable representations.
#[async_trait]
pub trait RepresentationGenerator: Send + Sync {
    /// Provider/model identifier used in logs.
    fn name(&self) -> &str;

    /// One representation per input text, same order.
    async fn represent(&self, texts: &[String]) -> Result<Vec<Representation>>;
}

/// Build the generator named by `[representation].provider`.
pub fn create_generator(
    config: &RepresentationConfig,
) -> anyhow::Result<Arc<dyn RepresentationGenerator>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dims))),
        "summary" => Ok(Arc::new(SummaryGenerator::default())),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        other => bail!("Unknown representation provider: {}", other),
    }
}

// ============ Hashing Embedder ============

/// Local embedder using signed feature hashing over lowercase word tokens.
///
/// Output vectors are L2-normalized, so cosine similarity reduces to a dot
/// product. Identical text always yields an identical vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let slot = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vec[slot] += sign;
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl RepresentationGenerator for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    async fn represent(&self, texts: &[String]) -> Result<Vec<Representation>> {
        Ok(texts
            .iter()
            .map(|t| Representation::Vector(self.embed(t)))
            .collect())
    }
}

/// Lowercase alphanumeric word tokens.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

// ============ Summary Generator ============

/// Extractive summarizer: the leading sentences of a chunk, capped at
/// `max_chars`.
#[derive(Debug, Clone)]
pub struct SummaryGenerator {
    max_chars: usize,
}

impl Default for SummaryGenerator {
    fn default() -> Self {
        Self { max_chars: 240 }
    }
}

impl SummaryGenerator {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    pub fn summarize(&self, text: &str) -> String {
        let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut summary = String::new();
        for sentence in flat.split_inclusive(['.', '!', '?']) {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }
            let extra = if summary.is_empty() { 0 } else { 1 };
            if !summary.is_empty() && summary.len() + extra + sentence.len() > self.max_chars {
                break;
            }
            if !summary.is_empty() {
                summary.push(' ');
            }
            summary.push_str(sentence);
        }
        if summary.len() > self.max_chars {
            let mut cut = self.max_chars;
            while cut > 0 && !summary.is_char_boundary(cut) {
                cut -= 1;
            }
            summary.truncate(cut);
        }
        summary
    }
}

#[async_trait]
impl RepresentationGenerator for SummaryGenerator {
    fn name(&self) -> &str {
        "summary"
    }

    async fn represent(&self, texts: &[String]) -> Result<Vec<Representation>> {
        Ok(texts
            .iter()
            .map(|t| Representation::Summary(self.summarize(t)))
            .collect())
    }
}

// ============ OpenAI Embedder ============

/// Generator using the OpenAI embeddings API.
///
/// Calls `POST /v1/embeddings` with the configured model. Requires the
/// `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    model: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &RepresentationConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("representation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl RepresentationGenerator for OpenAiEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    async fn represent(&self, texts: &[String]) -> Result<Vec<Representation>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| GovernanceError::Representation(e.to_string()))?;
                        return parse_openai_response(&json).map(|vectors| {
                            vectors.into_iter().map(Representation::Vector).collect()
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let message = format!("OpenAI API error {}: {}", status, body_text);
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(attempt, %status, "embedding request failed, retrying");
                        last_err = Some(message);
                        continue;
                    }
                    return Err(GovernanceError::Representation(message));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "embedding request failed, retrying");
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(GovernanceError::Representation(
            last_err.unwrap_or_else(|| "embedding failed after retries".to_string()),
        ))
    }
}

/// Extract `data[].embedding` arrays, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let invalid = |what: &str| GovernanceError::Representation(format!("invalid OpenAI response: {}", what));

    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| invalid("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| invalid("missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(position as u64);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);

    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Cosine similarity of two vectors; 0.0 for empty or mismatched input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashing_is_deterministic_and_one_per_input() {
        let embedder = HashingEmbedder::new(64);
        let texts = vec!["quarterly revenue".to_string(), "lunch menu".to_string()];
        let a = embedder.represent(&texts).await.unwrap();
        let b = embedder.represent(&texts).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a, b);
        match &a[0] {
            Representation::Vector(v) => assert_eq!(v.len(), 64),
            other => panic!("expected vector, got {:?}", other),
        }
    }

    #[test]
    fn hashing_similarity_tracks_shared_words() {
        let embedder = HashingEmbedder::new(256);
        let q = embedder.embed("salary review");
        let near = embedder.embed("annual salary review for engineering");
        let far = embedder.embed("cafeteria opening hours");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let v = HashingEmbedder::new(8).embed("");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn summary_keeps_leading_sentences() {
        let summary = SummaryGenerator::new(40)
            .summarize("First sentence here. Second one follows.\n\nThird is cut off entirely.");
        assert_eq!(summary, "First sentence here. Second one follows.");
    }

    #[test]
    fn summary_truncates_a_long_first_sentence() {
        let summary = SummaryGenerator::new(10).summarize("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(summary.len(), 10);
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn cosine_edge_cases() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn factory_selects_provider() {
        let mut config = RepresentationConfig::default();
        assert_eq!(create_generator(&config).unwrap().name(), "hashing");
        config.provider = "summary".to_string();
        assert_eq!(create_generator(&config).unwrap().name(), "summary");
        config.provider = "bogus".to_string();
        assert!(create_generator(&config).is_err());
    }
}

//! Embedding providers and the text preparation around them.

use anyhow::{Context, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

/// Configuration for embedding providers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// In-process feature hashing. Deterministic, needs no network.
    Hash { dimensions: usize },
    /// Ollama local embedding server
    Ollama {
        url: String,
        model: String,
        dimensions: usize,
        timeout_secs: u64,
    },
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::Hash { dimensions: 384 }
    }
}

/// Trait for embedding providers
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Generate embeddings for multiple texts, in order.
    async fn embed_batch(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Model identifier stored next to every vector.
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;
}

/// Create an embedding provider from configuration
pub fn create_provider(config: &ProviderConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match config {
        ProviderConfig::Hash { dimensions } => Ok(Arc::new(HashingProvider::new(*dimensions)?)),
        ProviderConfig::Ollama {
            url,
            model,
            dimensions,
            timeout_secs,
        } => Ok(Arc::new(OllamaProvider::new(
            url,
            model,
            *dimensions,
            Duration::from_secs(*timeout_secs),
        )?)),
    }
}

/// Signed feature hashing over lowercase alphanumeric tokens.
///
/// Texts sharing vocabulary land close together under cosine similarity,
/// which is enough for local setups and for tests.
pub struct HashingProvider {
    dimensions: usize,
    model: String,
}

impl HashingProvider {
    pub fn new(dimensions: usize) -> anyhow::Result<Self> {
        if dimensions == 0 {
            bail!("hash embedding dimensions must be positive");
        }
        Ok(Self {
            dimensions,
            model: format!("hash-{}", dimensions),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = md5::compute(token.to_lowercase());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]);
            let slot = (bucket % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
            tokens += 1;
        }
        if tokens == 0 {
            bail!("no tokens to embed");
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Ollama embedding provider
pub struct OllamaProvider {
    client: Client,
    url: String,
    model: String,
    dimensions: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaProvider {
    /// The server is not contacted here; an unreachable backend surfaces as
    /// retryable enrichment failures instead of a startup error.
    pub fn new(url: &str, model: &str, dimensions: usize, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building embedding http client")?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimensions,
        })
    }

    async fn request(&self, input: Vec<&str>) -> anyhow::Result<Vec<Vec<f32>>> {
        let expected = input.len();
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&EmbedRequest {
                model: &self.model,
                input,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama embed failed ({}): {}", status, body);
        }

        let embed_response: EmbedResponse = response.json().await?;
        if embed_response.embeddings.len() != expected {
            bail!(
                "Ollama returned {} embeddings for {} texts",
                embed_response.embeddings.len(),
                expected
            );
        }
        for embedding in &embed_response.embeddings {
            if embedding.len() != self.dimensions {
                bail!(
                    "Ollama returned {} dimensions, expected {}",
                    embedding.len(),
                    self.dimensions
                );
            }
        }
        Ok(embed_response.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.request(vec![text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Ollama returned no embeddings"))
    }

    async fn embed_batch(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts.to_vec()).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Split text into chunks of at most `words_per_chunk` whitespace-separated
/// words. Chunks without a single letter or digit carry nothing to embed and
/// are dropped.
pub fn chunk_words(text: &str, words_per_chunk: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(words_per_chunk.max(1))
        .filter(|chunk| chunk.iter().any(|w| w.chars().any(char::is_alphanumeric)))
        .map(|chunk| chunk.join(" "))
        .collect()
}

/// Average chunk vectors into one document vector, then normalize it.
pub fn mean_pool(vectors: &[Vec<f32>]) -> anyhow::Result<Vec<f32>> {
    let Some(first) = vectors.first() else {
        bail!("nothing to pool");
    };
    let dims = first.len();
    let mut pooled = vec![0.0f32; dims];
    for vector in vectors {
        if vector.len() != dims {
            bail!("chunk vectors disagree on dimensions");
        }
        for (acc, v) in pooled.iter_mut().zip(vector) {
            *acc += v;
        }
    }
    let n = vectors.len() as f32;
    pooled.iter_mut().for_each(|v| *v /= n);
    l2_normalize(&mut pooled);
    Ok(pooled)
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::vector_index::cosine_similarity;

    #[tokio::test]
    async fn hashing_is_deterministic_and_normalized() {
        let provider = HashingProvider::new(64).unwrap();
        let a = provider.embed("The quick brown fox").await.unwrap();
        let b = provider.embed("the QUICK brown fox").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn shared_vocabulary_scores_higher() {
        let provider = HashingProvider::new(256).unwrap();
        let query = provider.embed("rust async runtime").await.unwrap();
        let near = provider.embed("an async runtime written in rust").await.unwrap();
        let far = provider.embed("banana bread recipe").await.unwrap();
        assert!(cosine_similarity(&query, &near) > cosine_similarity(&query, &far));
    }

    #[tokio::test]
    async fn empty_text_is_an_error() {
        let provider = HashingProvider::new(8).unwrap();
        assert!(provider.embed("  \n\t ").await.is_err());
        assert!(HashingProvider::new(0).is_err());
    }

    #[test]
    fn chunking_respects_word_budget() {
        let text = (0..1203).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let chunks = chunk_words(&text, 500);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].split_whitespace().count(), 500);
        assert_eq!(chunks[2].split_whitespace().count(), 203);
        assert!(chunk_words("   ", 500).is_empty());
    }

    #[test]
    fn punctuation_only_chunks_are_dropped() {
        assert!(chunk_words("--- *** ... !!", 2).is_empty());
        let chunks = chunk_words("=== title === ---- ----", 2);
        assert_eq!(chunks, vec!["=== title"]);
    }

    #[test]
    fn mean_pool_normalizes() {
        let pooled = mean_pool(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        assert!((pooled[0] - pooled[1]).abs() < 1e-6);
        assert!((pooled[0] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
        assert!(mean_pool(&[]).is_err());
        assert!(mean_pool(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }
}

use async_trait::async_trait;

use crate::util::text::{hash_text, word_tokens};

/// Sentence embedding backend.
///
/// Implementations must encode every text independently: the vector for a
/// text never depends on which other texts share its batch.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable identifier; part of the embedding cache key.
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn encode(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

const BIGRAM_WEIGHT: f32 = 0.5;

/// Feature-hashed bag of words and bigrams, L2-normalised.
///
/// Deterministic and cheap; the default when no transformer backend is
/// compiled in.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            model_id: format!("hashing-bow-{}", dimension.max(1)),
        }
    }

    #[must_use]
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        let tokens = word_tokens(text);

        for token in &tokens {
            self.accumulate(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, &bigram, BIGRAM_WEIGHT);
        }

        normalize(&mut vector);
        vector
    }

    #[allow(clippy::cast_possible_truncation)]
    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = hash_text(feature);
        let index = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Compute cosine similarity between two vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(feature = "bert")]
pub use bert::BertEmbedder;

#[cfg(feature = "bert")]
mod bert {
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use rust_bert::pipelines::sentence_embeddings::{
        SentenceEmbeddingsBuilder, SentenceEmbeddingsModel, SentenceEmbeddingsModelType,
    };
    use tokio::sync::Mutex;

    use super::Embedder;

    /// all-MiniLM-L6-v2 sentence embeddings via rust-bert, on CPU.
    #[derive(Clone)]
    pub struct BertEmbedder {
        model: Arc<Mutex<SentenceEmbeddingsModel>>,
    }

    impl std::fmt::Debug for BertEmbedder {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("BertEmbedder")
                .field("model", &"<SentenceEmbeddingsModel>")
                .finish()
        }
    }

    impl BertEmbedder {
        /// Load the model, downloading it on first use.
        ///
        /// # Errors
        /// Returns an error when the model cannot be fetched or loaded.
        pub fn new() -> Result<Self> {
            // Model construction blocks; keep it off the async runtime threads.
            let model = std::thread::spawn(|| {
                SentenceEmbeddingsBuilder::remote(SentenceEmbeddingsModelType::AllMiniLmL6V2)
                    .create_model()
            })
            .join()
            .map_err(|_| anyhow::anyhow!("Failed to join model creation thread"))??;

            Ok(Self {
                model: Arc::new(Mutex::new(model)),
            })
        }
    }

    #[async_trait]
    impl Embedder for BertEmbedder {
        fn model_id(&self) -> &'static str {
            "sentence-transformers/all-MiniLM-L6-v2"
        }

        fn dimension(&self) -> usize {
            384
        }

        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let model = self.model.clone();
            let texts = texts.to_vec();

            // One text per forward pass so padding never depends on batch mates.
            tokio::task::spawn_blocking(move || {
                let model = model.blocking_lock();
                texts
                    .iter()
                    .map(|text| {
                        model
                            .encode(std::slice::from_ref(text))?
                            .into_iter()
                            .next()
                            .ok_or_else(|| anyhow::anyhow!("model returned no embedding"))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .await
            .context("Failed to join embedding task")?
            .context("Failed to encode texts")
        }
    }
}

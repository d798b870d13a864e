/// Cluster summarisation: grounded text, topic, sentiment and confidence.
///
/// The summary model only ever sees the member texts of one cluster. Its
/// output is checked against those texts and replaced by an extractive
/// summary when it mentions content the members do not contain.
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tracing::debug;

use super::cluster::Cluster;
use super::topic::{SentimentLexicon, TopicTaxonomy};
use crate::config::{ConfidenceConfig, PipelineConfig, SummarizerConfig};
use crate::schema::{ClusterSummary, SummaryKind};
use crate::util::error::{FailureTarget, PipelineError, Stage};
use crate::util::text::{
    chunk_sentences, content_tokens, fingerprint, is_near_duplicate, split_sentences, truncate_chars,
};

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSummary {
    pub text: String,
    /// Model-reported likelihood in [0, 1], when the backend exposes one.
    pub likelihood: Option<f32>,
    pub kind: SummaryKind,
}

/// Text summarisation backend.
#[async_trait]
pub trait SummaryModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// Summarise one chunk of text no longer than the configured input cap.
    async fn generate(&self, input: &str) -> anyhow::Result<GeneratedSummary>;
}

/// Picks the most central sentences of the input. Never invents text.
#[derive(Debug, Clone)]
pub struct ExtractiveSummaryModel {
    max_sentences: usize,
    min_sentence_chars: usize,
}

impl ExtractiveSummaryModel {
    #[must_use]
    pub fn new(config: &SummarizerConfig) -> Self {
        Self {
            max_sentences: config.max_sentences,
            min_sentence_chars: config.min_sentence_chars,
        }
    }
}

impl Default for ExtractiveSummaryModel {
    fn default() -> Self {
        Self::new(&SummarizerConfig::default())
    }
}

#[async_trait]
impl SummaryModel for ExtractiveSummaryModel {
    fn model_id(&self) -> &'static str {
        "extractive-centrality"
    }

    async fn generate(&self, input: &str) -> anyhow::Result<GeneratedSummary> {
        Ok(GeneratedSummary {
            text: extract_key_sentences(&[input], self.max_sentences, self.min_sentence_chars),
            likelihood: None,
            kind: SummaryKind::Extractive,
        })
    }
}

/// Up to `max_sentences` sentences ranked by how many frequent corpus words
/// they contain, emitted in their original order.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn extract_key_sentences(
    texts: &[&str],
    max_sentences: usize,
    min_sentence_chars: usize,
) -> String {
    let sentences: Vec<String> = texts.iter().flat_map(|text| split_sentences(text)).collect();
    if sentences.is_empty() {
        return String::new();
    }

    let mut frequency: BTreeMap<String, usize> = BTreeMap::new();
    for sentence in &sentences {
        let unique: FxHashSet<String> = content_tokens(sentence).into_iter().collect();
        for token in unique {
            *frequency.entry(token).or_default() += 1;
        }
    }

    let mut candidates: Vec<(usize, f32)> = sentences
        .iter()
        .enumerate()
        .filter(|(_, sentence)| sentence.chars().count() >= min_sentence_chars)
        .map(|(index, sentence)| {
            let tokens = content_tokens(sentence);
            let score = if tokens.is_empty() {
                0.0
            } else {
                tokens
                    .iter()
                    .map(|token| frequency.get(token).copied().unwrap_or_default() as f32)
                    .sum::<f32>()
                    / tokens.len() as f32
            };
            (index, score)
        })
        .collect();

    if candidates.is_empty() {
        return sentences[0].clone();
    }

    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let fingerprints: Vec<String> = sentences.iter().map(|s| fingerprint(s)).collect();
    let mut chosen: Vec<usize> = Vec::new();
    for (index, _) in candidates {
        if chosen.len() >= max_sentences {
            break;
        }
        let duplicate = chosen
            .iter()
            .any(|kept| is_near_duplicate(&fingerprints[*kept], &fingerprints[index], 5, 0.8));
        if !duplicate {
            chosen.push(index);
        }
    }
    chosen.sort_unstable();
    chosen
        .into_iter()
        .map(|index| sentences[index].as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Confidence of a cluster summary from cohesion, support and likelihood.
///
/// For fixed cohesion and likelihood the score never decreases as support
/// grows.
#[derive(Debug, Clone)]
pub struct ConfidenceModel {
    config: ConfidenceConfig,
}

impl ConfidenceModel {
    #[must_use]
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(
        &self,
        cohesion: f32,
        support: usize,
        likelihood: Option<f32>,
        unclustered: bool,
    ) -> f32 {
        let config = &self.config;
        let cohesion = cohesion.clamp(0.0, 1.0);
        let support = support as f32;
        let support_factor = support / (support + config.support_half_saturation);

        let mut weighted = config.cohesion_weight * cohesion + config.support_weight * support_factor;
        let mut total_weight = config.cohesion_weight + config.support_weight;
        if let Some(likelihood) = likelihood {
            weighted += config.likelihood_weight * likelihood.clamp(0.0, 1.0);
            total_weight += config.likelihood_weight;
        }

        let mut score = if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        };
        if cohesion < config.min_cohesion {
            score = score.min(config.low_cohesion_cap);
        }
        if unclustered {
            score = score.min(config.fallback_confidence_cap);
        }
        score.clamp(0.0, 1.0)
    }
}

pub struct ClusterSummarizer {
    model: Arc<dyn SummaryModel>,
    taxonomy: TopicTaxonomy,
    lexicon: SentimentLexicon,
    confidence: ConfidenceModel,
    config: SummarizerConfig,
    min_cohesion: f32,
}

impl std::fmt::Debug for ClusterSummarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSummarizer")
            .field("model", &self.model.model_id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ClusterSummarizer {
    pub fn new(model: Arc<dyn SummaryModel>, config: &PipelineConfig) -> Self {
        Self {
            model,
            taxonomy: TopicTaxonomy::new(&config.topic_keywords),
            lexicon: SentimentLexicon::new(config.aggregation.sentiment_ratio),
            confidence: ConfidenceModel::new(config.confidence.clone()),
            config: config.summarizer.clone(),
            min_cohesion: config.confidence.min_cohesion,
        }
    }

    /// Summarise one cluster from its members' texts (in member order).
    ///
    /// # Errors
    /// Returns [`PipelineError::ModelFailure`] naming the cluster when the
    /// summary model fails.
    pub async fn summarize(
        &self,
        cluster: &Cluster,
        member_texts: &[String],
    ) -> Result<ClusterSummary, PipelineError> {
        let texts: Vec<&str> = member_texts.iter().map(String::as_str).collect();
        let topic_tag = self.taxonomy.classify(texts.iter().copied());
        let sentiment = self.lexicon.classify(texts.iter().copied());
        let support_count = cluster.support();

        let (text, likelihood, kind) = if cluster.cohesion < self.min_cohesion {
            (
                format!("Insufficient consensus on {topic_tag}."),
                None,
                SummaryKind::Placeholder,
            )
        } else {
            let generated = self.generate(cluster, &texts).await?;
            if !generated.text.is_empty() && self.is_grounded(&generated.text, &texts) {
                (generated.text, generated.likelihood, generated.kind)
            } else {
                debug!(
                    course = %cluster.course,
                    cluster_id = cluster.id,
                    "generated summary not grounded in members, using extractive fallback"
                );
                let fallback = extract_key_sentences(
                    &texts,
                    self.config.max_sentences,
                    self.config.min_sentence_chars,
                );
                (fallback, None, SummaryKind::Extractive)
            }
        };

        let confidence = self.confidence.score(
            cluster.cohesion,
            support_count,
            likelihood,
            cluster.low_confidence,
        );

        Ok(ClusterSummary {
            cluster_id: cluster.id,
            course: cluster.course.clone(),
            text: truncate_chars(&text, self.config.max_summary_chars),
            topic_tag,
            sentiment,
            confidence,
            support_count,
            cohesion: cluster.cohesion,
            kind,
        })
    }

    /// Chunk, summarise each chunk, merge; re-summarise once if the merged
    /// text is still over the input cap.
    async fn generate(
        &self,
        cluster: &Cluster,
        texts: &[&str],
    ) -> Result<GeneratedSummary, PipelineError> {
        let joined = texts
            .iter()
            .map(|text| terminate_sentence(text))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_sentences(&joined, self.config.max_input_chars);

        let mut parts = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            parts.push(self.call_model(cluster, chunk).await?);
        }

        let merged_text = parts
            .iter()
            .map(|part| part.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let likelihood = mean_likelihood(&parts);
        let kind = if parts.iter().all(|part| part.kind == SummaryKind::Extractive) {
            SummaryKind::Extractive
        } else {
            SummaryKind::Abstractive
        };

        if parts.len() > 1 && merged_text.chars().count() > self.config.max_input_chars {
            let condensed = truncate_chars(&merged_text, self.config.max_input_chars);
            return self.call_model(cluster, &condensed).await;
        }

        Ok(GeneratedSummary {
            text: merged_text,
            likelihood,
            kind,
        })
    }

    async fn call_model(
        &self,
        cluster: &Cluster,
        input: &str,
    ) -> Result<GeneratedSummary, PipelineError> {
        self.model
            .generate(input)
            .await
            .map_err(|error| PipelineError::ModelFailure {
                stage: Stage::Summarization,
                target: FailureTarget::Cluster {
                    course: cluster.course.clone(),
                    cluster_id: cluster.id,
                },
                message: format!("{error:#}"),
            })
    }

    /// Every sentence must draw enough of its content words from the members.
    #[allow(clippy::cast_precision_loss)]
    fn is_grounded(&self, summary: &str, texts: &[&str]) -> bool {
        let vocabulary: FxHashSet<String> = texts
            .iter()
            .flat_map(|text| content_tokens(text))
            .collect();

        split_sentences(summary).iter().all(|sentence| {
            let tokens = content_tokens(sentence);
            if tokens.is_empty() {
                return true;
            }
            let supported = tokens.iter().filter(|t| vocabulary.contains(*t)).count();
            supported as f32 / tokens.len() as f32 >= self.config.grounding_threshold
        })
    }
}

fn terminate_sentence(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.ends_with(['.', '!', '?']) {
        trimmed.to_string()
    } else {
        format!("{trimmed}.")
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean_likelihood(parts: &[GeneratedSummary]) -> Option<f32> {
    let values: Vec<f32> = parts.iter().filter_map(|part| part.likelihood).collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

#[cfg(feature = "bert")]
pub use bart::BartSummaryModel;

#[cfg(feature = "bert")]
mod bart {
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use rust_bert::pipelines::summarization::{SummarizationConfig, SummarizationModel};
    use tokio::sync::Mutex;

    use super::{GeneratedSummary, SummaryModel};
    use crate::schema::SummaryKind;

    /// BART-large-CNN abstractive summaries via rust-bert, greedy decoding.
    #[derive(Clone)]
    pub struct BartSummaryModel {
        model: Arc<Mutex<SummarizationModel>>,
    }

    impl std::fmt::Debug for BartSummaryModel {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("BartSummaryModel")
                .field("model", &"<SummarizationModel>")
                .finish()
        }
    }

    impl BartSummaryModel {
        /// Load the model, downloading it on first use.
        ///
        /// # Errors
        /// Returns an error when the model cannot be fetched or loaded.
        pub fn new() -> Result<Self> {
            let model = std::thread::spawn(|| {
                SummarizationModel::new(SummarizationConfig {
                    do_sample: false,
                    ..SummarizationConfig::default()
                })
            })
            .join()
            .map_err(|_| anyhow::anyhow!("Failed to join model creation thread"))??;

            Ok(Self {
                model: Arc::new(Mutex::new(model)),
            })
        }
    }

    #[async_trait]
    impl SummaryModel for BartSummaryModel {
        fn model_id(&self) -> &'static str {
            "facebook/bart-large-cnn"
        }

        async fn generate(&self, input: &str) -> Result<GeneratedSummary> {
            let model = self.model.clone();
            let input = input.to_string();

            let text = tokio::task::spawn_blocking(move || {
                let model = model.blocking_lock();
                model
                    .summarize(&[input])
                    .map(|mut outputs| outputs.pop().unwrap_or_default())
            })
            .await
            .context("Failed to join summarization task")?
            .context("Failed to summarize text")?;

            Ok(GeneratedSummary {
                text,
                likelihood: None,
                kind: SummaryKind::Abstractive,
            })
        }
    }
}

//! Hierarchical aggregator and its builder.
//!
//! Drives reviews through preprocess -> course normalisation -> dedup ->
//! embedding -> clustering -> cluster summaries -> course and professor
//! rollups. Courses are processed one at a time so only a single course's
//! embeddings are alive at once.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::cluster::{Cluster, ClusterEngine, DensityClusterer, HdbscanClusterer};
use super::course_code::{CourseCodeNormalizer, CrossListingGraph, DepartmentAliases};
use super::dedup::Deduplicator;
use super::embedding::{Embedder, HashingEmbedder};
use super::embedding_cache::{EmbeddingCache, EmbeddingStore, InMemoryEmbeddingStore};
use super::preprocess::{PreprocessedReview, TextPreprocessor};
use super::rollup::{self, CourseRollupInput};
use super::summarizer::{ClusterSummarizer, ExtractiveSummaryModel, SummaryModel};
use crate::config::PipelineConfig;
use crate::observability::metrics::Metrics;
use crate::schema::{
    CleanedReviewUnit, ClusterSummary, CourseSummary, NormalizedCourseCode, ProfessorSummary,
    RawReview,
};
use crate::util::error::{PipelineError, UnitFailure, is_retryable};

/// All reviews of one professor, as handed to [`HierarchicalAggregator::process_professors`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProfessorBatch {
    pub professor_id: String,
    pub reviews: Vec<RawReview>,
}

impl ProfessorBatch {
    /// Split reviews by professor, ordered by professor id.
    #[must_use]
    pub fn group(reviews: Vec<RawReview>) -> Vec<Self> {
        let mut by_professor: BTreeMap<String, Vec<RawReview>> = BTreeMap::new();
        for review in reviews {
            by_professor
                .entry(review.professor_id.clone())
                .or_default()
                .push(review);
        }
        by_professor
            .into_iter()
            .map(|(professor_id, reviews)| Self {
                professor_id,
                reviews,
            })
            .collect()
    }
}

/// A professor whose run failed outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfessorFailure {
    pub professor_id: String,
    pub message: String,
    pub retryable: bool,
}

/// Result of a multi-professor run, both lists ordered by professor id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub summaries: Vec<ProfessorSummary>,
    pub failures: Vec<ProfessorFailure>,
}

/// Runs the full summarisation pipeline for courses and professors.
#[derive(Debug, Clone)]
pub struct HierarchicalAggregator {
    config: Arc<PipelineConfig>,
    preprocessor: TextPreprocessor,
    deduplicator: Deduplicator,
    normalizer: Arc<CourseCodeNormalizer>,
    cross_listings: Arc<CrossListingGraph>,
    cache: Arc<EmbeddingCache>,
    engine: Arc<ClusterEngine>,
    summarizer: Arc<ClusterSummarizer>,
    metrics: Option<Arc<Metrics>>,
}

impl HierarchicalAggregator {
    #[must_use]
    pub fn builder(config: PipelineConfig) -> HierarchicalAggregatorBuilder {
        HierarchicalAggregatorBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn normalizer(&self) -> &CourseCodeNormalizer {
        &self.normalizer
    }

    #[must_use]
    pub fn cross_listings(&self) -> &CrossListingGraph {
        &self.cross_listings
    }

    #[must_use]
    pub fn embedding_cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Summarise `reviews` as a single course, whatever course code each
    /// review carries.
    ///
    /// # Errors
    /// Returns [`PipelineError::Unparseable`] when `course_code` itself has
    /// no department or number. Model and clustering failures are isolated
    /// into [`CourseSummary::failures`].
    pub async fn process_single_course(
        &self,
        reviews: &[RawReview],
        course_code: &str,
    ) -> Result<CourseSummary, PipelineError> {
        let course = self.normalizer.normalize(course_code, &self.cross_listings)?;
        self.count_received(reviews.len());

        let cleaned = self.preprocessor.clean(reviews);
        self.count_dropped(reviews.len() - cleaned.len());

        let units = cleaned
            .into_iter()
            .map(|review| to_unit(review, course.clone()))
            .collect();
        let units = self.deduplicate(units);

        Ok(self.summarize_course(course, units).await)
    }

    /// Summarise every course a professor taught, then the professor.
    ///
    /// Reviews of other professors are ignored. Reviews whose course code
    /// cannot be parsed are counted in
    /// [`ProfessorSummary::uncategorized_reviews`] and nowhere else.
    ///
    /// # Errors
    /// Currently infallible in practice: failures below the professor level
    /// are isolated into each course's `failures`.
    pub async fn process_professor_reviews(
        &self,
        reviews: &[RawReview],
        professor_id: &str,
    ) -> Result<ProfessorSummary, PipelineError> {
        let own: Vec<&RawReview> = reviews
            .iter()
            .filter(|review| review.professor_id == professor_id)
            .collect();
        self.count_received(own.len());

        let hint = self.department_hint(own.iter().copied());
        let cleaned = self.preprocessor.clean(own.iter().copied());
        self.count_dropped(own.len() - cleaned.len());

        let mut units = Vec::with_capacity(cleaned.len());
        let mut uncategorized = 0;
        for review in cleaned {
            match self.normalizer.normalize_with_hint(
                &review.raw.course_code,
                &self.cross_listings,
                hint.as_deref(),
            ) {
                Ok(course) => units.push(to_unit(review, course)),
                Err(error) => {
                    debug!(
                        professor_id,
                        review_id = %review.raw.id,
                        error = %error,
                        "review left uncategorized"
                    );
                    uncategorized += 1;
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.unparseable_codes.inc_by(count(uncategorized));
        }

        let units = self.deduplicate(units);
        let stats = rollup::review_stats(&units, self.config.aggregation.professor_top_tags);

        let mut by_course: BTreeMap<NormalizedCourseCode, Vec<CleanedReviewUnit>> = BTreeMap::new();
        for unit in units {
            by_course.entry(unit.course.clone()).or_default().push(unit);
        }

        let mut course_summaries = Vec::with_capacity(by_course.len());
        for (course, units) in by_course {
            course_summaries.push(self.summarize_course(course, units).await);
        }

        let summary = rollup::aggregate_professor(
            professor_id,
            course_summaries,
            uncategorized,
            stats,
            &self.config.aggregation,
        );
        info!(
            professor_id,
            courses = summary.course_summaries.len(),
            reviews = summary.total_reviews,
            uncategorized,
            confidence = summary.confidence,
            "professor summarized"
        );
        Ok(summary)
    }

    /// Summarise many professors with at most `max_concurrency` in flight.
    ///
    /// A professor that fails (or panics) is recorded in
    /// [`BatchReport::failures`]; the others are unaffected.
    pub async fn process_professors(
        &self,
        batches: Vec<ProfessorBatch>,
        max_concurrency: NonZeroUsize,
    ) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(max_concurrency.get()));
        let mut tasks = Vec::with_capacity(batches.len());

        for batch in batches {
            let aggregator = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let professor_id = batch.professor_id.clone();
            let handle = tokio::spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                aggregator
                    .process_professor_reviews(&batch.reviews, &batch.professor_id)
                    .await
            });
            tasks.push(async move { (professor_id, handle.await) });
        }

        let mut report = BatchReport::default();
        for (professor_id, joined) in futures::future::join_all(tasks).await {
            match joined {
                Ok(Ok(summary)) => report.summaries.push(summary),
                Ok(Err(error)) => {
                    warn!(professor_id = %professor_id, error = %error, "professor run failed");
                    report.failures.push(ProfessorFailure {
                        retryable: is_retryable(&error),
                        message: error.to_string(),
                        professor_id,
                    });
                }
                Err(join_error) => {
                    let message = match join_error.try_into_panic() {
                        Ok(payload) => payload
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic payload".to_string()),
                        Err(join_error) => join_error.to_string(),
                    };
                    error!(professor_id = %professor_id, message, "professor task panicked");
                    report.failures.push(ProfessorFailure {
                        professor_id,
                        message,
                        retryable: false,
                    });
                }
            }
        }

        report
            .summaries
            .sort_by(|a, b| a.professor_id.cmp(&b.professor_id));
        report
            .failures
            .sort_by(|a, b| a.professor_id.cmp(&b.professor_id));
        info!(
            summaries = report.summaries.len(),
            failures = report.failures.len(),
            "batch completed"
        );
        report
    }

    /// Embed, cluster, summarise and roll up one course's units.
    async fn summarize_course(
        &self,
        course: NormalizedCourseCode,
        units: Vec<CleanedReviewUnit>,
    ) -> CourseSummary {
        let started = Instant::now();
        let stats = rollup::review_stats(&units, self.config.aggregation.course_top_tags);

        let embedded = self.cache.embed(&units).await;
        let mut failures: Vec<UnitFailure> = embedded.failures;

        let clusters = match self.cluster(&course, embedded.embeddings).await {
            Ok(clusters) => clusters,
            Err(error) => {
                warn!(course = %course, error = %error, "clustering failed, course left unsummarized");
                failures.extend(error.as_unit_failure());
                Vec::new()
            }
        };

        let noise_reviews: usize = clusters
            .iter()
            .filter(|cluster| cluster.is_noise)
            .map(Cluster::support)
            .sum();

        let texts: BTreeMap<&str, &str> = units
            .iter()
            .map(|unit| (unit.source_review_id.as_str(), unit.normalized_text.as_str()))
            .collect();
        let cluster_summaries = self.summarize_clusters(&clusters, &texts, &mut failures).await;

        if let Some(metrics) = &self.metrics {
            metrics
                .clusters_created
                .inc_by(count(clusters.iter().filter(|c| !c.is_noise).count()));
            metrics.noise_units.inc_by(count(noise_reviews));
            metrics.cluster_summaries.inc_by(count(cluster_summaries.len()));
        }

        let summary = rollup::aggregate_course(
            CourseRollupInput {
                course,
                cluster_summaries,
                total_reviews: units.len(),
                noise_reviews,
                stats,
                failures,
            },
            &self.config.aggregation,
        );

        if let Some(metrics) = &self.metrics {
            metrics
                .course_duration
                .observe(started.elapsed().as_secs_f64());
        }
        info!(
            course = %summary.course,
            units = summary.total_reviews,
            noise = summary.noise_reviews,
            clusters = summary.cluster_summaries.len(),
            failures = summary.failures.len(),
            confidence = summary.confidence,
            "course summarized"
        );
        summary
    }

    async fn cluster(
        &self,
        course: &NormalizedCourseCode,
        embeddings: BTreeMap<String, super::embedding_cache::Embedding>,
    ) -> Result<Vec<Cluster>, PipelineError> {
        let started = Instant::now();
        let engine = Arc::clone(&self.engine);
        let target = course.clone();

        // HDBSCAN is CPU-bound; keep it off the async workers.
        let result = tokio::task::spawn_blocking(move || engine.cluster(&target, &embeddings))
            .await
            .unwrap_or_else(|join_error| {
                Err(PipelineError::Clustering {
                    course: course.clone(),
                    message: format!("clustering task failed: {join_error}"),
                })
            });

        if let Some(metrics) = &self.metrics {
            metrics
                .clustering_duration
                .observe(started.elapsed().as_secs_f64());
        }
        result
    }

    async fn summarize_clusters(
        &self,
        clusters: &[Cluster],
        texts: &BTreeMap<&str, &str>,
        failures: &mut Vec<UnitFailure>,
    ) -> Vec<ClusterSummary> {
        let started = Instant::now();
        let mut summaries = Vec::new();

        for cluster in clusters.iter().filter(|cluster| !cluster.is_noise) {
            let member_texts: Vec<String> = cluster
                .member_unit_ids
                .iter()
                .filter_map(|id| texts.get(id.as_str()))
                .map(|text| (*text).to_string())
                .collect();

            match self.summarizer.summarize(cluster, &member_texts).await {
                Ok(summary) => {
                    debug!(
                        course = %cluster.course,
                        cluster_id = cluster.id,
                        topic = %summary.topic_tag,
                        support = summary.support_count,
                        confidence = summary.confidence,
                        "cluster summarized"
                    );
                    summaries.push(summary);
                }
                Err(error) => {
                    warn!(
                        course = %cluster.course,
                        cluster_id = cluster.id,
                        error = %error,
                        "cluster summary failed, excluding cluster"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.model_failures.inc();
                    }
                    failures.extend(error.as_unit_failure());
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .summarization_duration
                .observe(started.elapsed().as_secs_f64());
        }
        summaries
    }

    /// Most common department among a professor's parseable codes; ties go
    /// to the alphabetically first.
    fn department_hint<'a, I>(&self, reviews: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a RawReview>,
    {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for review in reviews {
            if let Some(department) = self.normalizer.department_of(&review.course_code) {
                *counts.entry(department).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(department, _)| department)
    }

    fn deduplicate(&self, units: Vec<CleanedReviewUnit>) -> Vec<CleanedReviewUnit> {
        let outcome = self.deduplicator.deduplicate(units);
        if let Some(metrics) = &self.metrics {
            metrics.duplicates_removed.inc_by(count(outcome.removed));
        }
        outcome.units
    }

    fn count_received(&self, reviews: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.reviews_received.inc_by(count(reviews));
        }
    }

    fn count_dropped(&self, reviews: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.reviews_dropped.inc_by(count(reviews));
        }
    }
}

fn to_unit(review: PreprocessedReview<'_>, course: NormalizedCourseCode) -> CleanedReviewUnit {
    let raw = review.raw;
    CleanedReviewUnit {
        source_review_id: raw.id.clone(),
        normalized_text: review.text,
        course,
        professor_id: raw.professor_id.clone(),
        rating: raw.rating,
        difficulty: raw.difficulty,
        tags: raw.tags.clone(),
    }
}

#[allow(clippy::cast_precision_loss)]
fn count(n: usize) -> f64 {
    n as f64
}

/// Builder for [`HierarchicalAggregator`]; every strategy has a
/// deterministic in-process default.
pub struct HierarchicalAggregatorBuilder {
    config: PipelineConfig,
    embedder: Option<Arc<dyn Embedder>>,
    store: Option<Arc<dyn EmbeddingStore>>,
    clusterer: Option<Arc<dyn DensityClusterer>>,
    summary_model: Option<Arc<dyn SummaryModel>>,
    cross_listings: Option<CrossListingGraph>,
    metrics: Option<Arc<Metrics>>,
}

impl HierarchicalAggregatorBuilder {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            embedder: None,
            store: None,
            clusterer: None,
            summary_model: None,
            cross_listings: None,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn with_embedding_store(mut self, store: Arc<dyn EmbeddingStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_clusterer(mut self, clusterer: Arc<dyn DensityClusterer>) -> Self {
        self.clusterer = Some(clusterer);
        self
    }

    #[must_use]
    pub fn with_summary_model(mut self, model: Arc<dyn SummaryModel>) -> Self {
        self.summary_model = Some(model);
        self
    }

    #[must_use]
    pub fn with_cross_listings(mut self, graph: CrossListingGraph) -> Self {
        self.cross_listings = Some(graph);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and assemble the aggregator.
    ///
    /// # Errors
    /// Returns [`PipelineError::Config`] when the configuration is invalid.
    pub fn build(self) -> Result<HierarchicalAggregator, PipelineError> {
        self.config.validate()?;
        let config = self.config;

        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(HashingEmbedder::new(config.embedding.dimension)));
        if embedder.dimension() != config.embedding.dimension {
            warn!(
                configured = config.embedding.dimension,
                model = embedder.dimension(),
                model_id = embedder.model_id(),
                "embedder dimension differs from configuration, using the embedder's"
            );
        }
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryEmbeddingStore::new()));
        let mut cache = EmbeddingCache::new(store, embedder, config.embedding.batch_size);
        if let Some(metrics) = &self.metrics {
            cache = cache.with_metrics(Arc::clone(metrics));
        }

        let clusterer = self
            .clusterer
            .unwrap_or_else(|| Arc::new(HdbscanClusterer));
        let summary_model = self
            .summary_model
            .unwrap_or_else(|| Arc::new(ExtractiveSummaryModel::new(&config.summarizer)));
        let normalizer =
            CourseCodeNormalizer::new(DepartmentAliases::new(config.department_aliases.clone()));

        Ok(HierarchicalAggregator {
            preprocessor: TextPreprocessor::new(&config.preprocess),
            deduplicator: Deduplicator::new(&config.preprocess),
            normalizer: Arc::new(normalizer),
            cross_listings: Arc::new(
                self.cross_listings
                    .unwrap_or_else(CrossListingGraph::builtin),
            ),
            cache: Arc::new(cache),
            engine: Arc::new(ClusterEngine::new(clusterer, config.clustering.clone())),
            summarizer: Arc::new(ClusterSummarizer::new(summary_model, &config)),
            metrics: self.metrics,
            config: Arc::new(config),
        })
    }
}

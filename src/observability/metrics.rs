/// Prometheus metrics for the summarisation pipeline.
use prometheus::{
    Counter, Encoder, Histogram, Registry, TextEncoder, register_counter_with_registry,
    register_histogram_with_registry,
};

/// Counters and latency histograms shared by all pipeline stages.
#[derive(Debug, Clone)]
pub struct Metrics {
    // counters
    pub reviews_received: Counter,
    pub reviews_dropped: Counter,
    pub duplicates_removed: Counter,
    pub unparseable_codes: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub embedder_invocations: Counter,
    pub clusters_created: Counter,
    pub noise_units: Counter,
    pub cluster_summaries: Counter,
    pub model_failures: Counter,

    // histograms
    pub embedding_duration: Histogram,
    pub clustering_duration: Histogram,
    pub summarization_duration: Histogram,
    pub course_duration: Histogram,
}

impl Metrics {
    /// Register every metric against `registry`.
    ///
    /// # Errors
    /// Fails when a metric with the same name is already registered.
    #[allow(clippy::too_many_lines)]
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            reviews_received: register_counter_with_registry!(
                "review_summarizer_reviews_received_total",
                "Raw reviews handed to the pipeline",
                registry
            )?,
            reviews_dropped: register_counter_with_registry!(
                "review_summarizer_reviews_dropped_total",
                "Reviews dropped during cleaning (empty or too short)",
                registry
            )?,
            duplicates_removed: register_counter_with_registry!(
                "review_summarizer_duplicates_removed_total",
                "Near-duplicate reviews removed within a course/professor scope",
                registry
            )?,
            unparseable_codes: register_counter_with_registry!(
                "review_summarizer_unparseable_codes_total",
                "Reviews whose course code could not be parsed",
                registry
            )?,
            cache_hits: register_counter_with_registry!(
                "review_summarizer_embedding_cache_hits_total",
                "Embeddings served from the cache or a coalesced computation",
                registry
            )?,
            cache_misses: register_counter_with_registry!(
                "review_summarizer_embedding_cache_misses_total",
                "Embeddings that had to be computed",
                registry
            )?,
            embedder_invocations: register_counter_with_registry!(
                "review_summarizer_embedder_invocations_total",
                "Calls into the embedding backend",
                registry
            )?,
            clusters_created: register_counter_with_registry!(
                "review_summarizer_clusters_created_total",
                "Non-noise clusters produced",
                registry
            )?,
            noise_units: register_counter_with_registry!(
                "review_summarizer_noise_units_total",
                "Units assigned to a noise cluster",
                registry
            )?,
            cluster_summaries: register_counter_with_registry!(
                "review_summarizer_cluster_summaries_total",
                "Cluster summaries generated",
                registry
            )?,
            model_failures: register_counter_with_registry!(
                "review_summarizer_model_failures_total",
                "Embedding, clustering or summarization failures that were isolated",
                registry
            )?,
            embedding_duration: register_histogram_with_registry!(
                "review_summarizer_embedding_duration_seconds",
                "Duration of the embedding stage per course",
                registry
            )?,
            clustering_duration: register_histogram_with_registry!(
                "review_summarizer_clustering_duration_seconds",
                "Duration of density clustering per course",
                registry
            )?,
            summarization_duration: register_histogram_with_registry!(
                "review_summarizer_summarization_duration_seconds",
                "Duration of cluster summarization per course",
                registry
            )?,
            course_duration: register_histogram_with_registry!(
                "review_summarizer_course_duration_seconds",
                "End-to-end duration of one course",
                registry
            )?,
        })
    }
}

/// Encode every metric of `registry` in the Prometheus text format.
#[must_use]
pub fn render(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}

use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use review_summarizer::{
    CourseCodeNormalizer, CrossListingGraph, DepartmentAliases, Embedder, EmbeddingStore,
    HierarchicalAggregator, InMemoryEmbeddingStore, PipelineConfig, ProfessorBatch, RawReview,
    RunnerConfig, SqliteEmbeddingStore, SummaryModel, observability::Telemetry,
};

/// Batch input: reviews plus the cross-listing table from the course database.
#[derive(Debug, Deserialize)]
struct RunnerInput {
    reviews: Vec<RawReview>,
    #[serde(default)]
    cross_listings: Option<Vec<(String, String)>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                column = location.column(),
                message,
                "panic occurred"
            );
        } else {
            error!(
                thread = thread_name,
                message, "panic occurred without location information"
            );
        }
    }));

    let telemetry = Telemetry::new().context("failed to initialize telemetry")?;
    let runner = RunnerConfig::from_env().context("failed to load runner configuration")?;

    let config = match runner.pipeline_config_path() {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load pipeline config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let raw = tokio::fs::read_to_string(runner.input_path())
        .await
        .with_context(|| format!("failed to read {}", runner.input_path().display()))?;
    let input: RunnerInput =
        serde_json::from_str(&raw).context("failed to parse review input")?;

    let cross_listings = match &input.cross_listings {
        Some(pairs) => {
            let normalizer =
                CourseCodeNormalizer::new(DepartmentAliases::new(config.department_aliases.clone()));
            CrossListingGraph::from_pairs(pairs.iter().map(|(a, b)| (a.as_str(), b.as_str())), &normalizer)
                .context("invalid cross-listing table")?
        }
        None => CrossListingGraph::builtin(),
    };

    let store: Arc<dyn EmbeddingStore> = match runner.cache_db_path() {
        Some(path) => Arc::new(
            SqliteEmbeddingStore::open(path)
                .await
                .with_context(|| format!("failed to open embedding cache {}", path.display()))?,
        ),
        None => {
            warn!("no cache database configured, embeddings will not outlive this run");
            Arc::new(InMemoryEmbeddingStore::new())
        }
    };

    let (embedder, summary_model) = model_backends(&config)?;
    info!(
        embedder = embedder.model_id(),
        summarizer = summary_model.model_id(),
        reviews = input.reviews.len(),
        max_concurrency = runner.max_concurrency().get(),
        "starting batch"
    );

    let aggregator = HierarchicalAggregator::builder(config)
        .with_embedder(embedder)
        .with_summary_model(summary_model)
        .with_embedding_store(store)
        .with_cross_listings(cross_listings)
        .with_metrics(telemetry.metrics())
        .build()
        .context("failed to build pipeline")?;

    let report = aggregator
        .process_professors(ProfessorBatch::group(input.reviews), runner.max_concurrency())
        .await;
    let rendered = serde_json::to_vec_pretty(&report).context("failed to serialize report")?;

    match runner.output_path() {
        Some(path) => tokio::fs::write(path, &rendered)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&rendered).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    if let Some(path) = runner.metrics_path() {
        tokio::fs::write(path, telemetry.render_prometheus())
            .await
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
    }

    info!(
        professors = report.summaries.len(),
        failures = report.failures.len(),
        "batch finished"
    );
    Ok(())
}

#[cfg(feature = "bert")]
fn model_backends(
    _config: &PipelineConfig,
) -> anyhow::Result<(Arc<dyn Embedder>, Arc<dyn SummaryModel>)> {
    use review_summarizer::pipeline::{embedding::BertEmbedder, summarizer::BartSummaryModel};

    let embedder = BertEmbedder::new().context("failed to load sentence embedding model")?;
    let summarizer = BartSummaryModel::new().context("failed to load summarization model")?;
    Ok((Arc::new(embedder), Arc::new(summarizer)))
}

#[cfg(not(feature = "bert"))]
#[allow(clippy::unnecessary_wraps)]
fn model_backends(
    config: &PipelineConfig,
) -> anyhow::Result<(Arc<dyn Embedder>, Arc<dyn SummaryModel>)> {
    use review_summarizer::{ExtractiveSummaryModel, HashingEmbedder};

    Ok((
        Arc::new(HashingEmbedder::new(config.embedding.dimension)),
        Arc::new(ExtractiveSummaryModel::new(&config.summarizer)),
    ))
}

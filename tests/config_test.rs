/// Pipeline configuration loading and runner settings.
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use review_summarizer::schema::TopicTag;
use review_summarizer::{
    ConfigError, HierarchicalAggregator, PipelineConfig, PipelineError, RunnerConfig,
};
use rstest::rstest;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    move |name| map.get(name).cloned()
}

#[test]
fn yaml_file_overrides_only_named_values() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        "clustering:\n  min_cluster_size: 6\naggregation:\n  confidence_floor: 0.1\ntopic_keywords:\n  exams: [exam, midterm]\n"
    )
    .expect("write yaml");

    let config = PipelineConfig::from_yaml_file(file.path()).expect("valid config");
    let defaults = PipelineConfig::default();

    assert_eq!(config.clustering.min_cluster_size, 6);
    assert_eq!(config.clustering.min_samples, defaults.clustering.min_samples);
    assert!((config.aggregation.confidence_floor - 0.1).abs() < f32::EPSILON);
    assert_eq!(config.topic_keywords.len(), 1);
    assert_eq!(config.topic_keywords[&TopicTag::Exams], vec!["exam", "midterm"]);
    assert_eq!(config.summarizer, defaults.summarizer);
}

#[test]
fn missing_yaml_file_is_an_invalid_config() {
    let error = PipelineConfig::from_yaml_file(Path::new("/nonexistent/pipeline.yaml"))
        .expect_err("file does not exist");
    assert!(matches!(
        error,
        ConfigError::Invalid {
            name: "pipeline_config",
            ..
        }
    ));
}

#[rstest]
#[case("clustering:\n  min_cluster_size: 1\n", "clustering.min_cluster_size")]
#[case("embedding:\n  batch_size: 0\n", "embedding.batch_size")]
#[case("summarizer:\n  grounding_threshold: 1.5\n", "summarizer.grounding_threshold")]
#[case("confidence:\n  cohesion_weight: -0.1\n", "confidence.weights")]
#[case("aggregation:\n  sentiment_ratio: 0.5\n", "aggregation.sentiment_ratio")]
#[case("topic_keywords:\n  other: [misc]\n", "topic_keywords")]
#[case("clustering: [not, a, map]\n", "pipeline_config")]
fn out_of_range_values_are_rejected(#[case] yaml: &str, #[case] field: &str) {
    match PipelineConfig::from_yaml_str(yaml) {
        Err(ConfigError::Invalid { name, .. }) => assert_eq!(name, field),
        other => panic!("expected invalid {field}, got {other:?}"),
    }
}

#[test]
fn builder_refuses_an_invalid_config() {
    let mut config = PipelineConfig::default();
    config.aggregation.max_clusters_per_topic = 0;

    let error = HierarchicalAggregator::builder(config)
        .build()
        .expect_err("invalid config");
    assert!(matches!(error, PipelineError::Config(_)));
}

#[test]
fn runner_reads_every_setting() {
    let runner = RunnerConfig::from_lookup(lookup_from(&[
        ("REVIEW_SUMMARIZER_INPUT", "/data/reviews.json"),
        ("REVIEW_SUMMARIZER_OUTPUT", "/data/summaries.json"),
        ("REVIEW_SUMMARIZER_CONFIG", "/etc/summarizer.yaml"),
        ("REVIEW_SUMMARIZER_CACHE_DB", "/var/cache/embeddings.db"),
        ("REVIEW_SUMMARIZER_MAX_CONCURRENCY", "3"),
        ("REVIEW_SUMMARIZER_METRICS", "/data/metrics.prom"),
    ]))
    .expect("runner config");

    assert_eq!(runner.input_path(), Path::new("/data/reviews.json"));
    assert_eq!(runner.output_path(), Some(Path::new("/data/summaries.json")));
    assert_eq!(
        runner.pipeline_config_path(),
        Some(Path::new("/etc/summarizer.yaml"))
    );
    assert_eq!(
        runner.cache_db_path(),
        Some(Path::new("/var/cache/embeddings.db"))
    );
    assert_eq!(runner.max_concurrency().get(), 3);
    assert_eq!(runner.metrics_path(), Some(Path::new("/data/metrics.prom")));
}

#[test]
fn runner_requires_an_input_path() {
    let error = RunnerConfig::from_lookup(lookup_from(&[("REVIEW_SUMMARIZER_INPUT", "  ")]))
        .expect_err("blank input");
    assert!(matches!(error, ConfigError::Missing("REVIEW_SUMMARIZER_INPUT")));
}

#[rstest]
#[case("0")]
#[case("many")]
fn runner_rejects_bad_concurrency(#[case] value: &str) {
    let error = RunnerConfig::from_lookup(lookup_from(&[
        ("REVIEW_SUMMARIZER_INPUT", "/data/reviews.json"),
        ("REVIEW_SUMMARIZER_MAX_CONCURRENCY", value),
    ]))
    .expect_err("invalid concurrency");
    assert!(matches!(
        error,
        ConfigError::Invalid {
            name: "REVIEW_SUMMARIZER_MAX_CONCURRENCY",
            ..
        }
    ));
}

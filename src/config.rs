use std::{
    collections::BTreeMap,
    env,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::TopicTag;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl ConfigError {
    fn invalid(name: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Invalid {
            name,
            source: anyhow::anyhow!("{message}"),
        }
    }
}

/// Parameters of the summarisation pipeline.
///
/// Every field has a default, so a partial YAML document only needs to
/// name the values it overrides. The pipeline never reads the process
/// environment; callers build this struct and hand it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub preprocess: PreprocessConfig,
    pub clustering: ClusteringConfig,
    pub embedding: EmbeddingConfig,
    pub summarizer: SummarizerConfig,
    pub confidence: ConfidenceConfig,
    pub aggregation: AggregationConfig,
    /// Alias department code -> canonical department code.
    pub department_aliases: BTreeMap<String, String>,
    pub topic_keywords: BTreeMap<TopicTag, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Reviews with fewer words after cleaning are dropped.
    pub min_words: usize,
    /// Cleaned text is truncated to this many characters.
    pub max_chars: usize,
    pub near_duplicate_threshold: f64,
    pub shingle_window: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub min_cluster_size: usize,
    pub min_samples: usize,
    /// Courses with fewer units skip density clustering entirely.
    pub min_units_for_clustering: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub batch_size: usize,
    pub dimension: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Longest chunk handed to the summary model in one call.
    pub max_input_chars: usize,
    pub max_summary_chars: usize,
    pub max_sentences: usize,
    pub min_sentence_chars: usize,
    /// Share of a generated sentence's content words that must occur in
    /// the member texts.
    pub grounding_threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub cohesion_weight: f32,
    pub support_weight: f32,
    pub likelihood_weight: f32,
    pub support_half_saturation: f32,
    pub min_cohesion: f32,
    pub low_cohesion_cap: f32,
    pub fallback_confidence_cap: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub max_clusters_per_topic: usize,
    pub min_reviews_for_full_confidence: usize,
    pub confidence_floor: f32,
    pub sentiment_ratio: f32,
    pub max_themes: usize,
    pub theme_chars: usize,
    pub course_top_tags: usize,
    pub professor_top_tags: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            min_words: 8,
            max_chars: 2000,
            near_duplicate_threshold: 0.95,
            shingle_window: 5,
        }
    }
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 3,
            min_samples: 2,
            min_units_for_clustering: 5,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            dimension: 384,
        }
    }
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_input_chars: 3000,
            max_summary_chars: 600,
            max_sentences: 3,
            min_sentence_chars: 20,
            grounding_threshold: 0.6,
        }
    }
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            cohesion_weight: 0.5,
            support_weight: 0.35,
            likelihood_weight: 0.15,
            support_half_saturation: 5.0,
            min_cohesion: 0.2,
            low_cohesion_cap: 0.25,
            fallback_confidence_cap: 0.4,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_clusters_per_topic: 2,
            min_reviews_for_full_confidence: 10,
            confidence_floor: 0.0,
            sentiment_ratio: 1.5,
            max_themes: 5,
            theme_chars: 120,
            course_top_tags: 5,
            professor_top_tags: 10,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preprocess: PreprocessConfig::default(),
            clustering: ClusteringConfig::default(),
            embedding: EmbeddingConfig::default(),
            summarizer: SummarizerConfig::default(),
            confidence: ConfidenceConfig::default(),
            aggregation: AggregationConfig::default(),
            department_aliases: default_department_aliases(),
            topic_keywords: default_topic_keywords(),
        }
    }
}

fn default_department_aliases() -> BTreeMap<String, String> {
    [
        ("CPCS", "CSCE"),
        ("CPSC", "CSCE"),
        ("COSC", "CSCE"),
        ("CS", "CSCE"),
        ("ELEN", "ECEN"),
        ("EE", "ECEN"),
        ("ELEC", "ECEN"),
        ("MATHS", "MATH"),
        ("ENGI", "ENGR"),
        ("PHY", "PHYS"),
        ("CHM", "CHEM"),
        ("ID", "IDIS"),
    ]
    .into_iter()
    .map(|(alias, canonical)| (alias.to_string(), canonical.to_string()))
    .collect()
}

fn default_topic_keywords() -> BTreeMap<TopicTag, Vec<String>> {
    let table: [(TopicTag, &[&str]); 4] = [
        (
            TopicTag::Teaching,
            &[
                "teach", "teaching", "teaches", "lecture", "lectures", "explain", "explains",
                "explained", "clear", "confusing", "understand", "present", "presents",
            ],
        ),
        (
            TopicTag::Exams,
            &[
                "exam", "exams", "test", "tests", "quiz", "quizzes", "midterm", "midterms",
                "final", "finals", "assessment",
            ],
        ),
        (
            TopicTag::Grading,
            &[
                "grade", "grades", "grading", "graded", "grader", "point", "points", "curve",
                "curved", "fair", "harsh", "strict", "lenient",
            ],
        ),
        (
            TopicTag::Workload,
            &[
                "work", "workload", "homework", "homeworks", "assignment", "assignments",
                "project", "projects", "busy", "time", "heavy", "light",
            ],
        ),
    ];
    table
        .into_iter()
        .map(|(tag, words)| (tag, words.iter().map(|w| (*w).to_string()).collect()))
        .collect()
}

impl PipelineConfig {
    /// Parse a YAML document and validate it.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] when the document is malformed or a
    /// value is out of range.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw).map_err(|error| ConfigError::Invalid {
            name: "pipeline_config",
            source: anyhow::Error::new(error),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] when the file cannot be read or parsed.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| ConfigError::Invalid {
            name: "pipeline_config",
            source: anyhow::Error::new(error).context(format!("reading {}", path.display())),
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Check ranges the pipeline relies on.
    ///
    /// # Errors
    /// Returns the first out-of-range value as [`ConfigError::Invalid`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let preprocess = &self.preprocess;
        if preprocess.max_chars == 0 {
            return Err(ConfigError::invalid("preprocess.max_chars", "must be positive"));
        }
        if !(0.0..=1.0).contains(&preprocess.near_duplicate_threshold) {
            return Err(ConfigError::invalid(
                "preprocess.near_duplicate_threshold",
                "must be within [0, 1]",
            ));
        }
        if preprocess.shingle_window == 0 {
            return Err(ConfigError::invalid("preprocess.shingle_window", "must be positive"));
        }

        let clustering = &self.clustering;
        if clustering.min_cluster_size < 2 {
            return Err(ConfigError::invalid(
                "clustering.min_cluster_size",
                "must be at least 2",
            ));
        }
        if clustering.min_samples == 0 {
            return Err(ConfigError::invalid("clustering.min_samples", "must be positive"));
        }

        if self.embedding.batch_size == 0 {
            return Err(ConfigError::invalid("embedding.batch_size", "must be positive"));
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::invalid("embedding.dimension", "must be positive"));
        }

        let summarizer = &self.summarizer;
        if summarizer.max_input_chars == 0 || summarizer.max_summary_chars == 0 {
            return Err(ConfigError::invalid(
                "summarizer.max_input_chars",
                "character caps must be positive",
            ));
        }
        if summarizer.max_sentences == 0 {
            return Err(ConfigError::invalid("summarizer.max_sentences", "must be positive"));
        }
        if !(0.0..=1.0).contains(&summarizer.grounding_threshold) {
            return Err(ConfigError::invalid(
                "summarizer.grounding_threshold",
                "must be within [0, 1]",
            ));
        }

        let confidence = &self.confidence;
        let weights = [
            confidence.cohesion_weight,
            confidence.support_weight,
            confidence.likelihood_weight,
        ];
        if weights.iter().any(|w| *w < 0.0) || confidence.cohesion_weight + confidence.support_weight <= 0.0 {
            return Err(ConfigError::invalid(
                "confidence.weights",
                "weights must be non-negative and cohesion + support must be positive",
            ));
        }
        if confidence.support_half_saturation <= 0.0 {
            return Err(ConfigError::invalid(
                "confidence.support_half_saturation",
                "must be positive",
            ));
        }
        for (name, value) in [
            ("confidence.min_cohesion", confidence.min_cohesion),
            ("confidence.low_cohesion_cap", confidence.low_cohesion_cap),
            ("confidence.fallback_confidence_cap", confidence.fallback_confidence_cap),
            ("aggregation.confidence_floor", self.aggregation.confidence_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::invalid(name, "must be within [0, 1]"));
            }
        }

        let aggregation = &self.aggregation;
        if aggregation.max_clusters_per_topic == 0 {
            return Err(ConfigError::invalid(
                "aggregation.max_clusters_per_topic",
                "must be positive",
            ));
        }
        if aggregation.min_reviews_for_full_confidence == 0 {
            return Err(ConfigError::invalid(
                "aggregation.min_reviews_for_full_confidence",
                "must be positive",
            ));
        }
        if aggregation.sentiment_ratio < 1.0 {
            return Err(ConfigError::invalid(
                "aggregation.sentiment_ratio",
                "must be at least 1.0",
            ));
        }
        if self.topic_keywords.contains_key(&TopicTag::Other) {
            return Err(ConfigError::invalid(
                "topic_keywords",
                "`other` is the fallback topic and takes no keywords",
            ));
        }
        Ok(())
    }
}

/// Process-level settings for the batch runner binary.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    input_path: PathBuf,
    output_path: Option<PathBuf>,
    pipeline_config_path: Option<PathBuf>,
    cache_db_path: Option<PathBuf>,
    max_concurrency: NonZeroUsize,
    metrics_path: Option<PathBuf>,
}

impl RunnerConfig {
    /// 環境変数からランナーの設定値を読み込む。
    ///
    /// # Errors
    /// `REVIEW_SUMMARIZER_INPUT` が未設定、もしくは値のパースに失敗した場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`RunnerConfig::from_env`], reading values through `lookup`.
    ///
    /// # Errors
    /// See [`RunnerConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let input_path = PathBuf::from(required(&lookup, "REVIEW_SUMMARIZER_INPUT")?);
        let output_path = optional_path(&lookup, "REVIEW_SUMMARIZER_OUTPUT");
        let pipeline_config_path = optional_path(&lookup, "REVIEW_SUMMARIZER_CONFIG");
        let cache_db_path = optional_path(&lookup, "REVIEW_SUMMARIZER_CACHE_DB");
        let max_concurrency =
            parse_non_zero_usize(&lookup, "REVIEW_SUMMARIZER_MAX_CONCURRENCY", num_cpus::get())?;
        let metrics_path = optional_path(&lookup, "REVIEW_SUMMARIZER_METRICS");

        Ok(Self {
            input_path,
            output_path,
            pipeline_config_path,
            cache_db_path,
            max_concurrency,
            metrics_path,
        })
    }

    #[must_use]
    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    #[must_use]
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    #[must_use]
    pub fn pipeline_config_path(&self) -> Option<&Path> {
        self.pipeline_config_path.as_deref()
    }

    #[must_use]
    pub fn cache_db_path(&self) -> Option<&Path> {
        self.cache_db_path.as_deref()
    }

    #[must_use]
    pub fn max_concurrency(&self) -> NonZeroUsize {
        self.max_concurrency
    }

    #[must_use]
    pub fn metrics_path(&self) -> Option<&Path> {
        self.metrics_path.as_deref()
    }
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn optional_path<F>(lookup: &F, name: &str) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn parse_non_zero_usize<F>(
    lookup: &F,
    name: &'static str,
    default: usize,
) -> Result<NonZeroUsize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name).unwrap_or_else(|| default.to_string());
    let value = raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    NonZeroUsize::new(value).ok_or_else(|| ConfigError::invalid(name, "must be greater than zero"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_reference_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.preprocess.min_words, 8);
        assert!((config.preprocess.near_duplicate_threshold - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.clustering.min_cluster_size, 3);
        assert_eq!(config.clustering.min_samples, 2);
        assert_eq!(config.embedding.batch_size, 64);
        assert_eq!(config.department_aliases.get("CPSC").map(String::as_str), Some("CSCE"));
        assert!(config.topic_keywords[&TopicTag::Exams].contains(&"midterm".to_string()));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn yaml_overrides_only_named_values() {
        let yaml = r"
clustering:
  min_cluster_size: 4
department_aliases:
  COMP: CSCE
";
        let config = PipelineConfig::from_yaml_str(yaml).expect("valid yaml");
        assert_eq!(config.clustering.min_cluster_size, 4);
        assert_eq!(config.clustering.min_samples, 2);
        assert_eq!(config.department_aliases.len(), 1);
        assert_eq!(config.preprocess.min_words, 8);
    }

    #[test]
    fn yaml_accepts_topic_keyword_tables() {
        let yaml = r"
topic_keywords:
  teaching: [lecture]
  exams: [exam]
";
        let config = PipelineConfig::from_yaml_str(yaml).expect("valid yaml");
        assert_eq!(config.topic_keywords.len(), 2);
        assert_eq!(config.topic_keywords[&TopicTag::Teaching], vec!["lecture"]);
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let mut config = PipelineConfig::default();
        config.preprocess.near_duplicate_threshold = 1.5;
        let error = config.validate().expect_err("threshold out of range");
        assert!(matches!(
            error,
            ConfigError::Invalid { name: "preprocess.near_duplicate_threshold", .. }
        ));
    }

    #[test]
    fn validate_rejects_keywords_for_other_topic() {
        let mut config = PipelineConfig::default();
        config
            .topic_keywords
            .insert(TopicTag::Other, vec!["misc".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_yaml_is_invalid() {
        let error = PipelineConfig::from_yaml_str("clustering: [1, 2").expect_err("malformed");
        assert!(matches!(error, ConfigError::Invalid { name: "pipeline_config", .. }));
    }

    #[test]
    fn runner_config_uses_defaults_when_optional_missing() {
        let config = RunnerConfig::from_lookup(lookup_from(&[(
            "REVIEW_SUMMARIZER_INPUT",
            "/data/reviews.json",
        )]))
        .expect("config should load");

        assert_eq!(config.input_path(), Path::new("/data/reviews.json"));
        assert!(config.output_path().is_none());
        assert!(config.cache_db_path().is_none());
        assert_eq!(config.max_concurrency().get(), num_cpus::get());
    }

    #[test]
    fn runner_config_overrides_values() {
        let config = RunnerConfig::from_lookup(lookup_from(&[
            ("REVIEW_SUMMARIZER_INPUT", "in.json"),
            ("REVIEW_SUMMARIZER_OUTPUT", "out.json"),
            ("REVIEW_SUMMARIZER_CONFIG", "pipeline.yaml"),
            ("REVIEW_SUMMARIZER_CACHE_DB", "cache.db"),
            ("REVIEW_SUMMARIZER_MAX_CONCURRENCY", "3"),
            ("REVIEW_SUMMARIZER_METRICS", "metrics.prom"),
        ]))
        .expect("config should load");

        assert_eq!(config.output_path(), Some(Path::new("out.json")));
        assert_eq!(config.pipeline_config_path(), Some(Path::new("pipeline.yaml")));
        assert_eq!(config.cache_db_path(), Some(Path::new("cache.db")));
        assert_eq!(config.max_concurrency().get(), 3);
        assert_eq!(config.metrics_path(), Some(Path::new("metrics.prom")));
    }

    #[test]
    fn runner_config_errors_when_input_missing() {
        let error = RunnerConfig::from_lookup(lookup_from(&[])).expect_err("input is required");
        assert!(matches!(error, ConfigError::Missing("REVIEW_SUMMARIZER_INPUT")));
    }

    #[test]
    fn runner_config_rejects_zero_concurrency() {
        let error = RunnerConfig::from_lookup(lookup_from(&[
            ("REVIEW_SUMMARIZER_INPUT", "in.json"),
            ("REVIEW_SUMMARIZER_MAX_CONCURRENCY", "0"),
        ]))
        .expect_err("zero is rejected");
        assert!(matches!(
            error,
            ConfigError::Invalid { name: "REVIEW_SUMMARIZER_MAX_CONCURRENCY", .. }
        ));
    }
}

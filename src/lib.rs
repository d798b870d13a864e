#![deny(warnings, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod observability;
pub mod pipeline;
pub mod schema;
pub mod util;

pub use config::{ConfigError, PipelineConfig, RunnerConfig};
pub use pipeline::cluster::{DensityClusterer, HdbscanClusterer};
pub use pipeline::course_code::{
    CourseCodeError, CourseCodeNormalizer, CrossListingGraph, DepartmentAliases,
};
pub use pipeline::embedding::{Embedder, HashingEmbedder};
pub use pipeline::embedding_cache::{
    CacheError, CacheKey, EmbeddingCache, EmbeddingStore, InMemoryEmbeddingStore,
    SqliteEmbeddingStore,
};
pub use pipeline::orchestrator::{
    BatchReport, HierarchicalAggregator, HierarchicalAggregatorBuilder, ProfessorBatch,
    ProfessorFailure,
};
pub use pipeline::summarizer::{ExtractiveSummaryModel, GeneratedSummary, SummaryModel};
pub use schema::{CourseSummary, NormalizedCourseCode, ProfessorSummary, RawReview};
pub use util::error::{PipelineError, UnitFailure};

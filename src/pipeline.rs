//! Summarisation pipeline stages, leaf-first.

pub(crate) mod dedup;
pub(crate) mod preprocess;
pub(crate) mod rollup;
pub(crate) mod topic;

pub mod cluster;
pub mod course_code;
pub mod embedding;
pub mod embedding_cache;
pub mod orchestrator;
pub mod summarizer;

/// Error taxonomy and retry classification.
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::pipeline::course_code::CourseCodeError;
use crate::pipeline::embedding_cache::CacheError;
use crate::schema::NormalizedCourseCode;

/// Pipeline stage a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Embedding,
    Clustering,
    Summarization,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Embedding => "embedding",
            Self::Clustering => "clustering",
            Self::Summarization => "summarization",
        };
        f.write_str(label)
    }
}

/// The smallest unit a caller can retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureTarget {
    Unit {
        review_id: String,
    },
    Cluster {
        course: NormalizedCourseCode,
        cluster_id: usize,
    },
    Course {
        course: NormalizedCourseCode,
    },
}

impl fmt::Display for FailureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit { review_id } => write!(f, "review {review_id}"),
            Self::Cluster { course, cluster_id } => write!(f, "cluster {cluster_id} of {course}"),
            Self::Course { course } => write!(f, "course {course}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Unparseable(#[from] CourseCodeError),
    #[error("{stage} model failure for {target}: {message}")]
    ModelFailure {
        stage: Stage,
        target: FailureTarget,
        message: String,
    },
    #[error("clustering failed for course {course}: {message}")]
    Clustering {
        course: NormalizedCourseCode,
        message: String,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A failure that was isolated instead of propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub target: FailureTarget,
    pub stage: Stage,
    pub message: String,
    pub retryable: bool,
}

impl UnitFailure {
    #[must_use]
    pub fn new(target: FailureTarget, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            target,
            stage,
            message: message.into(),
            retryable: true,
        }
    }
}

impl PipelineError {
    /// The isolated-failure record for errors that only affect part of a result.
    #[must_use]
    pub fn as_unit_failure(&self) -> Option<UnitFailure> {
        match self {
            PipelineError::ModelFailure {
                stage,
                target,
                message,
            } => Some(UnitFailure::new(target.clone(), *stage, message.clone())),
            PipelineError::Clustering { course, message } => Some(UnitFailure::new(
                FailureTarget::Course {
                    course: course.clone(),
                },
                Stage::Clustering,
                message.clone(),
            )),
            _ => None,
        }
    }
}

/// Error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient; retrying the batch job may succeed (model or store hiccup).
    Retryable,
    /// The input itself is unusable.
    NonRetryable,
    /// Misconfiguration; nothing will succeed until it is fixed.
    Fatal,
}

#[must_use]
pub fn classify_error(error: &PipelineError) -> ErrorKind {
    match error {
        PipelineError::ModelFailure { .. }
        | PipelineError::Clustering { .. }
        | PipelineError::Cache(_) => ErrorKind::Retryable,
        PipelineError::Unparseable(_) => ErrorKind::NonRetryable,
        PipelineError::Config(_) => ErrorKind::Fatal,
    }
}

#[must_use]
pub fn is_retryable(error: &PipelineError) -> bool {
    matches!(classify_error(error), ErrorKind::Retryable)
}

#[must_use]
pub fn is_fatal(error: &PipelineError) -> bool {
    matches!(classify_error(error), ErrorKind::Fatal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course() -> NormalizedCourseCode {
        NormalizedCourseCode::new("CSCE", "221")
    }

    #[test]
    fn model_failure_is_retryable() {
        let error = PipelineError::ModelFailure {
            stage: Stage::Embedding,
            target: FailureTarget::Unit {
                review_id: "r-1".into(),
            },
            message: "backend down".into(),
        };
        assert!(is_retryable(&error));
        assert!(!is_fatal(&error));
        assert_eq!(
            error.to_string(),
            "embedding model failure for review r-1: backend down"
        );
    }

    #[test]
    fn unparseable_is_not_retryable() {
        let error = PipelineError::from(CourseCodeError::Unparseable {
            code: "???".into(),
        });
        assert_eq!(classify_error(&error), ErrorKind::NonRetryable);
        assert!(error.as_unit_failure().is_none());
    }

    #[test]
    fn clustering_error_maps_to_course_failure() {
        let error = PipelineError::Clustering {
            course: course(),
            message: "empty input".into(),
        };
        let failure = error
            .as_unit_failure()
            .expect("clustering errors are isolatable");
        assert_eq!(failure.stage, Stage::Clustering);
        assert_eq!(failure.target, FailureTarget::Course { course: course() });
    }
}

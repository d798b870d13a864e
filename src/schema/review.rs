use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::NormalizedCourseCode;

/// A review as supplied by the collector. Never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReview {
    pub id: String,
    pub professor_id: String,
    #[serde(default)]
    pub course_code: String,
    #[serde(alias = "review_text")]
    pub text: String,
    #[serde(default)]
    pub rating: Option<f32>,
    #[serde(default)]
    pub difficulty: Option<f32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawReview {
    /// Minimal review, mostly useful for tests and fixtures.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        professor_id: impl Into<String>,
        course_code: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            professor_id: professor_id.into(),
            course_code: course_code.into(),
            text: text.into(),
            rating: None,
            difficulty: None,
            tags: Vec::new(),
            timestamp: None,
        }
    }

    #[must_use]
    pub fn with_rating(mut self, rating: f32) -> Self {
        self.rating = Some(rating);
        self
    }

    #[must_use]
    pub fn with_difficulty(mut self, difficulty: f32) -> Self {
        self.difficulty = Some(difficulty);
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// A cleaned review assigned to exactly one canonical course.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanedReviewUnit {
    pub source_review_id: String,
    pub normalized_text: String,
    pub course: NormalizedCourseCode,
    pub professor_id: String,
    pub rating: Option<f32>,
    pub difficulty: Option<f32>,
    pub tags: Vec<String>,
}

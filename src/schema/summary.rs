use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::NormalizedCourseCode;
use crate::util::error::UnitFailure;

/// Text stored in a topic field when no cluster supports that topic.
pub const INSUFFICIENT_DATA_PLACEHOLDER: &str = "Insufficient data.";

/// Fixed topic taxonomy. Declaration order breaks classification ties.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TopicTag {
    Teaching,
    Exams,
    Grading,
    Workload,
    Other,
}

impl TopicTag {
    pub const ALL: [TopicTag; 5] = [
        TopicTag::Teaching,
        TopicTag::Exams,
        TopicTag::Grading,
        TopicTag::Workload,
        TopicTag::Other,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Teaching => "teaching",
            Self::Exams => "exams",
            Self::Grading => "grading",
            Self::Workload => "workload",
            Self::Other => "other",
        }
    }

    /// Capitalised label used in professor-level theme lines.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Teaching => "Teaching",
            Self::Exams => "Exams",
            Self::Grading => "Grading",
            Self::Workload => "Workload",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for TopicTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    Mixed,
    Neutral,
}

/// How a cluster summary's text was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    /// Generated by the summary model and grounded in the members.
    Abstractive,
    /// Sentences copied from the members.
    Extractive,
    /// The members disagree too much to summarise.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub cluster_id: usize,
    pub course: NormalizedCourseCode,
    pub text: String,
    pub topic_tag: TopicTag,
    pub sentiment: Sentiment,
    pub confidence: f32,
    pub support_count: usize,
    pub cohesion: f32,
    pub kind: SummaryKind,
}

/// Rating, difficulty and tag statistics over a set of reviews.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReviewStats {
    pub avg_rating: Option<f32>,
    pub avg_difficulty: Option<f32>,
    pub common_tags: Vec<String>,
    pub tag_frequencies: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    Summarized,
    /// No summarisable cluster survived (all noise, or clustering failed).
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseSummary {
    pub course: NormalizedCourseCode,
    pub teaching: String,
    pub exams: String,
    pub grading: String,
    pub workload: String,
    pub other: String,
    pub topic_confidence: BTreeMap<TopicTag, f32>,
    pub confidence: f32,
    pub total_reviews: usize,
    pub noise_reviews: usize,
    pub status: SummaryStatus,
    pub cluster_summaries: Vec<ClusterSummary>,
    pub stats: ReviewStats,
    pub failures: Vec<UnitFailure>,
}

impl CourseSummary {
    #[must_use]
    pub fn topic_text(&self, topic: TopicTag) -> &str {
        match topic {
            TopicTag::Teaching => &self.teaching,
            TopicTag::Exams => &self.exams,
            TopicTag::Grading => &self.grading,
            TopicTag::Workload => &self.workload,
            TopicTag::Other => &self.other,
        }
    }

    pub(crate) fn topic_text_mut(&mut self, topic: TopicTag) -> &mut String {
        match topic {
            TopicTag::Teaching => &mut self.teaching,
            TopicTag::Exams => &mut self.exams,
            TopicTag::Grading => &mut self.grading,
            TopicTag::Workload => &mut self.workload,
            TopicTag::Other => &mut self.other,
        }
    }

    /// Whether any cluster backs the topic.
    #[must_use]
    pub fn has_topic(&self, topic: TopicTag) -> bool {
        self.topic_confidence.contains_key(&topic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallSentiment {
    Positive,
    Negative,
    Mixed,
    InsufficientData,
}

impl OverallSentiment {
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Positive => "Generally positive",
            Self::Negative => "Generally negative",
            Self::Mixed => "Mixed - varies by course",
            Self::InsufficientData => "Insufficient data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfessorSummary {
    pub professor_id: String,
    pub overall_sentiment: OverallSentiment,
    pub strengths: Vec<String>,
    pub complaints: Vec<String>,
    pub consistency: String,
    pub confidence: f32,
    pub course_summaries: Vec<CourseSummary>,
    pub total_reviews: usize,
    pub uncategorized_reviews: usize,
    pub stats: ReviewStats,
}

//! Input records and summary objects exchanged with callers.

mod course;
mod review;
mod summary;

pub use course::NormalizedCourseCode;
pub use review::{CleanedReviewUnit, RawReview};
pub use summary::{
    ClusterSummary, CourseSummary, INSUFFICIENT_DATA_PLACEHOLDER, OverallSentiment,
    ProfessorSummary, ReviewStats, Sentiment, SummaryKind, SummaryStatus, TopicTag,
};

//! Cluster -> course -> professor aggregation.
//!
//! Everything here is a pure function of already-summarised clusters, so
//! the same inputs always roll up to the same output.

use std::collections::BTreeMap;

use crate::config::AggregationConfig;
use crate::schema::{
    CleanedReviewUnit, ClusterSummary, CourseSummary, INSUFFICIENT_DATA_PLACEHOLDER,
    NormalizedCourseCode, OverallSentiment, ProfessorSummary, ReviewStats, Sentiment,
    SummaryKind, SummaryStatus, TopicTag,
};
use crate::util::error::UnitFailure;
use crate::util::text::truncate_chars;

/// Everything the course rollup needs besides the config.
#[derive(Debug, Clone)]
pub(crate) struct CourseRollupInput {
    pub(crate) course: NormalizedCourseCode,
    pub(crate) cluster_summaries: Vec<ClusterSummary>,
    pub(crate) total_reviews: usize,
    pub(crate) noise_reviews: usize,
    pub(crate) stats: ReviewStats,
    pub(crate) failures: Vec<UnitFailure>,
}

/// `min(1, reviews / full)`: scales confidence down for small samples.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn small_sample_penalty(reviews: usize, full_confidence_at: usize) -> f32 {
    if full_confidence_at == 0 {
        return 1.0;
    }
    (reviews as f32 / full_confidence_at as f32).min(1.0)
}

/// Support-weighted mean of `(value, weight)` pairs; `None` without weight.
#[allow(clippy::cast_precision_loss)]
fn weighted_mean(pairs: impl IntoIterator<Item = (f32, usize)>) -> Option<f32> {
    let (sum, weight) = pairs
        .into_iter()
        .fold((0.0_f32, 0_usize), |(sum, weight), (value, w)| {
            (sum + value * w as f32, weight + w)
        });
    (weight > 0).then(|| sum / weight as f32)
}

#[allow(clippy::cast_precision_loss)]
fn rank_score(summary: &ClusterSummary) -> f32 {
    summary.confidence * summary.support_count as f32
}

/// Highest `confidence x support` first, lower cluster id on ties.
fn by_rank(a: &&ClusterSummary, b: &&ClusterSummary) -> std::cmp::Ordering {
    rank_score(b)
        .total_cmp(&rank_score(a))
        .then_with(|| a.cluster_id.cmp(&b.cluster_id))
}

/// Fold one course's cluster summaries into a [`CourseSummary`].
pub(crate) fn aggregate_course(input: CourseRollupInput, config: &AggregationConfig) -> CourseSummary {
    let mut by_topic: BTreeMap<TopicTag, Vec<&ClusterSummary>> = BTreeMap::new();
    for summary in &input.cluster_summaries {
        by_topic.entry(summary.topic_tag).or_default().push(summary);
    }

    let mut texts: BTreeMap<TopicTag, String> = BTreeMap::new();
    let mut topic_confidence: BTreeMap<TopicTag, f32> = BTreeMap::new();
    let mut topic_support: BTreeMap<TopicTag, usize> = BTreeMap::new();

    for (topic, mut summaries) in by_topic {
        summaries.sort_by(by_rank);

        // Placeholders only speak for a topic nobody else covers.
        let grounded: Vec<&ClusterSummary> = summaries
            .iter()
            .copied()
            .filter(|summary| summary.kind != SummaryKind::Placeholder)
            .collect();
        let chosen = if grounded.is_empty() {
            &summaries[..1]
        } else {
            &grounded[..]
        };
        let text = chosen
            .iter()
            .take(config.max_clusters_per_topic.max(1))
            .map(|summary| summary.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        texts.insert(topic, text);

        if let Some(confidence) =
            weighted_mean(summaries.iter().map(|s| (s.confidence, s.support_count)))
        {
            topic_confidence.insert(topic, confidence);
        }
        topic_support.insert(topic, summaries.iter().map(|s| s.support_count).sum());
    }

    let has_grounded_text = input
        .cluster_summaries
        .iter()
        .any(|summary| summary.kind != SummaryKind::Placeholder);

    let confidence = weighted_mean(
        topic_confidence
            .iter()
            .map(|(topic, confidence)| (*confidence, topic_support[topic])),
    )
    .map_or(config.confidence_floor, |mean| {
        let penalty = small_sample_penalty(input.total_reviews, config.min_reviews_for_full_confidence);
        (mean * penalty).max(config.confidence_floor)
    })
    .clamp(0.0, 1.0);

    let mut summary = CourseSummary {
        course: input.course,
        teaching: String::new(),
        exams: String::new(),
        grading: String::new(),
        workload: String::new(),
        other: String::new(),
        topic_confidence,
        confidence,
        total_reviews: input.total_reviews,
        noise_reviews: input.noise_reviews,
        status: if has_grounded_text {
            SummaryStatus::Summarized
        } else {
            SummaryStatus::InsufficientData
        },
        cluster_summaries: input.cluster_summaries,
        stats: input.stats,
        failures: input.failures,
    };
    for topic in TopicTag::ALL {
        *summary.topic_text_mut(topic) = texts
            .remove(&topic)
            .unwrap_or_else(|| INSUFFICIENT_DATA_PLACEHOLDER.to_string());
    }
    summary
}

/// Rating/difficulty averages and the `top_n` most frequent tags.
pub(crate) fn review_stats<'a, I>(units: I, top_n: usize) -> ReviewStats
where
    I: IntoIterator<Item = &'a CleanedReviewUnit>,
{
    let mut ratings = Vec::new();
    let mut difficulties = Vec::new();
    let mut tag_frequencies: BTreeMap<String, usize> = BTreeMap::new();

    for unit in units {
        ratings.extend(unit.rating);
        difficulties.extend(unit.difficulty);
        for tag in &unit.tags {
            let tag = tag.trim();
            if !tag.is_empty() {
                *tag_frequencies.entry(tag.to_string()).or_default() += 1;
            }
        }
    }

    let mut ranked: Vec<(&String, &usize)> = tag_frequencies.iter().collect();
    // BTreeMap iteration is alphabetical and the sort is stable.
    ranked.sort_by(|a, b| b.1.cmp(a.1));
    let common_tags = ranked
        .into_iter()
        .take(top_n)
        .map(|(tag, _)| tag.clone())
        .collect();

    ReviewStats {
        avg_rating: mean(&ratings),
        avg_difficulty: mean(&difficulties),
        common_tags,
        tag_frequencies,
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f32]) -> Option<f32> {
    (!values.is_empty()).then(|| values.iter().sum::<f32>() / values.len() as f32)
}

/// Theme accumulated across courses for one (topic, polarity).
#[derive(Debug)]
struct Theme<'a> {
    topic: TopicTag,
    score: f32,
    support: usize,
    best: &'a ClusterSummary,
}

/// Fold the course summaries of one professor into a [`ProfessorSummary`].
pub(crate) fn aggregate_professor(
    professor_id: &str,
    course_summaries: Vec<CourseSummary>,
    uncategorized_reviews: usize,
    stats: ReviewStats,
    config: &AggregationConfig,
) -> ProfessorSummary {
    let strengths_themes = collect_themes(&course_summaries, Sentiment::Positive);
    let complaint_themes = collect_themes(&course_summaries, Sentiment::Negative);

    let positive_support: usize = strengths_themes.iter().map(|theme| theme.support).sum();
    let negative_support: usize = complaint_themes.iter().map(|theme| theme.support).sum();
    let overall_sentiment =
        overall_sentiment(positive_support, negative_support, config.sentiment_ratio);

    let strengths = format_themes(&strengths_themes, config);
    let complaints = format_themes(&complaint_themes, config);

    let consistency = consistency_narrative(&course_summaries);

    let categorized: usize = course_summaries.iter().map(|c| c.total_reviews).sum();
    let confidence = weighted_mean(
        course_summaries
            .iter()
            .map(|course| (course.confidence, course.total_reviews)),
    )
    .map_or(config.confidence_floor, |mean| {
        let penalty = small_sample_penalty(categorized, config.min_reviews_for_full_confidence);
        (mean * penalty).max(config.confidence_floor)
    })
    .clamp(0.0, 1.0);

    ProfessorSummary {
        professor_id: professor_id.to_string(),
        overall_sentiment,
        strengths,
        complaints,
        consistency,
        confidence,
        course_summaries,
        total_reviews: categorized + uncategorized_reviews,
        uncategorized_reviews,
        stats,
    }
}

fn collect_themes(courses: &[CourseSummary], polarity: Sentiment) -> Vec<Theme<'_>> {
    let mut themes: BTreeMap<TopicTag, Theme<'_>> = BTreeMap::new();
    let clusters = courses
        .iter()
        .flat_map(|course| &course.cluster_summaries)
        .filter(|summary| summary.sentiment == polarity && summary.kind != SummaryKind::Placeholder);

    for summary in clusters {
        let theme = themes.entry(summary.topic_tag).or_insert(Theme {
            topic: summary.topic_tag,
            score: 0.0,
            support: 0,
            best: summary,
        });
        theme.score += rank_score(summary);
        theme.support += summary.support_count;
        if by_rank(&summary, &theme.best).is_lt() {
            theme.best = summary;
        }
    }

    let mut ranked: Vec<Theme<'_>> = themes.into_values().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.topic.cmp(&b.topic)));
    ranked
}

fn format_themes(themes: &[Theme<'_>], config: &AggregationConfig) -> Vec<String> {
    themes
        .iter()
        .take(config.max_themes)
        .map(|theme| {
            format!(
                "{}: {}",
                theme.topic.label(),
                truncate_chars(&theme.best.text, config.theme_chars)
            )
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn overall_sentiment(positive: usize, negative: usize, ratio: f32) -> OverallSentiment {
    match (positive, negative) {
        (0, 0) => OverallSentiment::InsufficientData,
        (p, n) if p as f32 > n as f32 * ratio => OverallSentiment::Positive,
        (p, n) if n as f32 > p as f32 * ratio => OverallSentiment::Negative,
        _ => OverallSentiment::Mixed,
    }
}

/// Describe how much the courses agree, by rating spread when ratings exist
/// and by dominant theme polarity otherwise.
fn consistency_narrative(courses: &[CourseSummary]) -> String {
    let summarized: Vec<&CourseSummary> = courses
        .iter()
        .filter(|course| course.status == SummaryStatus::Summarized)
        .collect();

    match summarized.len() {
        0 => return "Insufficient data".to_string(),
        1 => return "Single course data available".to_string(),
        2 => return "Limited course data - patterns emerging".to_string(),
        _ => {}
    }

    let ratings: Vec<f32> = summarized
        .iter()
        .filter_map(|course| course.stats.avg_rating)
        .collect();
    if ratings.len() >= 2 {
        let (low, high) = ratings
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), r| (lo.min(*r), hi.max(*r)));
        let spread = high - low;
        let label = if spread <= 0.5 {
            "Consistent across courses"
        } else if spread <= 1.5 {
            "Somewhat consistent across courses"
        } else {
            "Varies significantly across courses"
        };
        return format!(
            "{label} (rating spread {spread:.1} over {} courses)",
            summarized.len()
        );
    }

    let polarities: Vec<Sentiment> = summarized
        .iter()
        .map(|course| dominant_polarity(course))
        .collect();
    if polarities.windows(2).all(|pair| pair[0] == pair[1]) {
        format!("Consistent across {} courses", summarized.len())
    } else {
        format!("Varies across {} courses", summarized.len())
    }
}

fn dominant_polarity(course: &CourseSummary) -> Sentiment {
    let support_for = |sentiment: Sentiment| -> usize {
        course
            .cluster_summaries
            .iter()
            .filter(|summary| summary.sentiment == sentiment)
            .map(|summary| summary.support_count)
            .sum()
    };
    let mut best = (Sentiment::Neutral, 0);
    for sentiment in [Sentiment::Positive, Sentiment::Negative, Sentiment::Mixed] {
        let support = support_for(sentiment);
        if support > best.1 {
            best = (sentiment, support);
        }
    }
    best.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course() -> NormalizedCourseCode {
        NormalizedCourseCode::new("CSCE", "221")
    }

    fn cluster(
        id: usize,
        topic: TopicTag,
        sentiment: Sentiment,
        confidence: f32,
        support: usize,
        text: &str,
    ) -> ClusterSummary {
        ClusterSummary {
            cluster_id: id,
            course: course(),
            text: text.to_string(),
            topic_tag: topic,
            sentiment,
            confidence,
            support_count: support,
            cohesion: 0.7,
            kind: SummaryKind::Extractive,
        }
    }

    fn input(clusters: Vec<ClusterSummary>, total: usize) -> CourseRollupInput {
        CourseRollupInput {
            course: course(),
            cluster_summaries: clusters,
            total_reviews: total,
            noise_reviews: 0,
            stats: ReviewStats::default(),
            failures: Vec::new(),
        }
    }

    #[test]
    fn topics_take_the_best_ranked_clusters() {
        let config = AggregationConfig {
            max_clusters_per_topic: 1,
            ..AggregationConfig::default()
        };
        let summary = aggregate_course(
            input(
                vec![
                    cluster(0, TopicTag::Exams, Sentiment::Negative, 0.4, 10, "Exams are long."),
                    cluster(1, TopicTag::Exams, Sentiment::Negative, 0.9, 8, "Exams are hard."),
                    cluster(2, TopicTag::Teaching, Sentiment::Positive, 0.8, 6, "Lectures are clear."),
                ],
                24,
            ),
            &config,
        );
        assert_eq!(summary.exams, "Exams are hard.");
        assert_eq!(summary.teaching, "Lectures are clear.");
        assert_eq!(summary.grading, INSUFFICIENT_DATA_PLACEHOLDER);
        assert_eq!(summary.status, SummaryStatus::Summarized);
        let exams = summary.topic_confidence[&TopicTag::Exams];
        assert!((exams - (0.4 * 10.0 + 0.9 * 8.0) / 18.0).abs() < 1e-5);
    }

    #[test]
    fn empty_course_sits_at_the_floor() {
        let config = AggregationConfig {
            confidence_floor: 0.05,
            ..AggregationConfig::default()
        };
        let summary = aggregate_course(input(Vec::new(), 4), &config);
        assert_eq!(summary.status, SummaryStatus::InsufficientData);
        assert!((summary.confidence - 0.05).abs() < f32::EPSILON);
        for topic in TopicTag::ALL {
            assert_eq!(summary.topic_text(topic), INSUFFICIENT_DATA_PLACEHOLDER);
        }
    }

    #[test]
    fn small_samples_are_penalised() {
        let config = AggregationConfig::default();
        let clusters = vec![cluster(0, TopicTag::Teaching, Sentiment::Positive, 0.8, 3, "Clear.")];
        let small = aggregate_course(input(clusters.clone(), 3), &config);
        let large = aggregate_course(input(clusters, 30), &config);
        assert!(small.confidence < large.confidence);
        assert!((large.confidence - 0.8).abs() < 1e-5);
    }

    #[test]
    fn review_stats_break_tag_ties_alphabetically() {
        let unit = |tags: &[&str], rating: f32| CleanedReviewUnit {
            source_review_id: "r".into(),
            normalized_text: "text".into(),
            course: course(),
            professor_id: "p".into(),
            rating: Some(rating),
            difficulty: None,
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
        };
        let units = vec![
            unit(&["tough grader", "caring"], 4.0),
            unit(&["caring", "accessible"], 2.0),
            unit(&["tough grader"], 3.0),
        ];
        let stats = review_stats(&units, 2);
        assert_eq!(stats.common_tags, vec!["caring", "tough grader"]);
        assert_eq!(stats.avg_rating, Some(3.0));
        assert_eq!(stats.avg_difficulty, None);
    }

    #[test]
    fn professor_themes_come_from_polarised_clusters() {
        let config = AggregationConfig::default();
        let first = aggregate_course(
            input(
                vec![
                    cluster(0, TopicTag::Teaching, Sentiment::Positive, 0.8, 10, "Lectures are clear."),
                    cluster(1, TopicTag::Exams, Sentiment::Negative, 0.7, 5, "Exams are hard."),
                ],
                15,
            ),
            &config,
        );
        let second = aggregate_course(
            input(
                vec![cluster(0, TopicTag::Teaching, Sentiment::Positive, 0.6, 4, "Explains well.")],
                4,
            ),
            &config,
        );
        let professor = aggregate_professor("p1", vec![first, second], 2, ReviewStats::default(), &config);

        assert_eq!(professor.strengths, vec!["Teaching: Lectures are clear."]);
        assert_eq!(professor.complaints, vec!["Exams: Exams are hard."]);
        assert_eq!(professor.overall_sentiment, OverallSentiment::Positive);
        assert_eq!(professor.total_reviews, 21);
        assert_eq!(professor.uncategorized_reviews, 2);
        assert_eq!(professor.consistency, "Limited course data - patterns emerging");
    }

    #[test]
    fn professor_without_courses_is_insufficient() {
        let professor = aggregate_professor(
            "p1",
            Vec::new(),
            3,
            ReviewStats::default(),
            &AggregationConfig::default(),
        );
        assert_eq!(professor.overall_sentiment, OverallSentiment::InsufficientData);
        assert_eq!(professor.consistency, "Insufficient data");
        assert!(professor.confidence.abs() < f32::EPSILON);
        assert_eq!(professor.total_reviews, 3);
    }

    #[test]
    fn rating_spread_drives_consistency() {
        let config = AggregationConfig::default();
        let course_with_rating = |rating: f32| {
            let mut summary = aggregate_course(
                input(vec![cluster(0, TopicTag::Teaching, Sentiment::Positive, 0.8, 5, "Clear.")], 5),
                &config,
            );
            summary.stats.avg_rating = Some(rating);
            summary
        };
        let steady = aggregate_professor(
            "p",
            vec![course_with_rating(4.0), course_with_rating(4.2), course_with_rating(4.4)],
            0,
            ReviewStats::default(),
            &config,
        );
        assert!(steady.consistency.starts_with("Consistent across courses"));

        let uneven = aggregate_professor(
            "p",
            vec![course_with_rating(1.5), course_with_rating(4.2), course_with_rating(4.9)],
            0,
            ReviewStats::default(),
            &config,
        );
        assert!(uneven.consistency.starts_with("Varies significantly"));
    }
}

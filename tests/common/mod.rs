//! Test doubles and fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use review_summarizer::config::ClusteringConfig;
use review_summarizer::{
    DensityClusterer, Embedder, GeneratedSummary, HashingEmbedder, HierarchicalAggregator,
    HierarchicalAggregatorBuilder, PipelineConfig, RawReview, SummaryModel,
};

/// Counts how many texts reach the wrapped hashing embedder.
#[derive(Debug, Default)]
pub struct CountingEmbedder {
    inner: HashingEmbedder,
    encoded: AtomicUsize,
}

impl CountingEmbedder {
    pub fn encoded(&self) -> usize {
        self.encoded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn encode(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.encoded.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.encode(texts).await
    }
}

/// Maps every text onto the same unit vector, so clusters are perfectly cohesive.
#[derive(Debug, Default)]
pub struct ConstantEmbedder;

#[async_trait]
impl Embedder for ConstantEmbedder {
    fn model_id(&self) -> &str {
        "constant"
    }

    fn dimension(&self) -> usize {
        4
    }

    async fn encode(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.5, 0.5, 0.5, 0.5]).collect())
    }
}

/// Fails for any text containing `poison`.
#[derive(Debug, Default)]
pub struct PoisonedEmbedder {
    inner: HashingEmbedder,
}

#[async_trait]
impl Embedder for PoisonedEmbedder {
    fn model_id(&self) -> &str {
        "poisoned"
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn encode(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.iter().any(|text| text.contains("poison")) {
            anyhow::bail!("cannot embed poisoned text");
        }
        self.inner.encode(texts).await
    }
}

/// Puts every point into cluster 0.
#[derive(Debug, Default)]
pub struct SingleClusterer;

impl DensityClusterer for SingleClusterer {
    fn partition(&self, points: &[Vec<f32>], _: &ClusteringConfig) -> anyhow::Result<Vec<i32>> {
        Ok(vec![0; points.len()])
    }
}

/// Declares every point an outlier.
#[derive(Debug, Default)]
pub struct NoiseClusterer;

impl DensityClusterer for NoiseClusterer {
    fn partition(&self, points: &[Vec<f32>], _: &ClusteringConfig) -> anyhow::Result<Vec<i32>> {
        Ok(vec![-1; points.len()])
    }
}

#[derive(Debug, Default)]
pub struct FailingSummaryModel;

#[async_trait]
impl SummaryModel for FailingSummaryModel {
    fn model_id(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _input: &str) -> anyhow::Result<GeneratedSummary> {
        anyhow::bail!("summarizer unavailable")
    }
}

pub fn builder() -> HierarchicalAggregatorBuilder {
    HierarchicalAggregator::builder(PipelineConfig::default())
}

/// Deterministic stack whose clusters always hold every unit of a course.
pub fn single_cluster_aggregator() -> HierarchicalAggregator {
    builder()
        .with_embedder(Arc::new(ConstantEmbedder))
        .with_clusterer(Arc::new(SingleClusterer))
        .build()
        .expect("default config is valid")
}

const OPENINGS: [&str; 10] = [
    "Data structures was the most useful course I took this year",
    "I came in knowing little about pointers and left confident",
    "This class moved quickly through trees and graphs",
    "Recursion finally made sense after the second month",
    "The labs about hashing were my favorite part of the semester",
    "Sorting algorithms were covered with plenty of diagrams",
    "The course expects comfort with C++ templates from day one",
    "Linked lists and iterators took up the first few weeks",
    "Balanced search trees were the hardest topic for me",
    "Graph traversal problems came up in almost every lab",
];

const MIDDLES: [&str; 7] = [
    "Lectures were clear and well organized.",
    "The professor explains proofs slowly and carefully.",
    "Exams were long but matched the practice material.",
    "Homework took many hours every single week.",
    "Grading on the projects felt strict but consistent.",
    "Office hours helped me debug most of my code.",
    "The textbook was optional and rarely needed.",
];

const CLOSINGS: [&str; 5] = [
    "I would take it again.",
    "Start the assignments early.",
    "Bring questions to recitation.",
    "Read the slides before class.",
    "Form a study group early on.",
];

/// `count` distinct reviews (no two are near-duplicates) for one course code.
pub fn distinct_reviews(prefix: &str, professor: &str, course_code: &str, count: usize) -> Vec<RawReview> {
    (0..count)
        .map(|i| {
            let text = format!(
                "{}. {} {}",
                OPENINGS[i % OPENINGS.len()],
                MIDDLES[i % MIDDLES.len()],
                CLOSINGS[i % CLOSINGS.len()]
            );
            RawReview::new(format!("{prefix}-{i:03}"), professor, course_code, text)
        })
        .collect()
}

const PRAISE: [&str; 5] = [
    "Great lectures that explain every idea with clear examples.",
    "The professor teaches with helpful diagrams and engaging stories.",
    "Lectures were excellent and the explanations were clear and organized.",
    "An amazing instructor who explains each concept in a clear way.",
    "Helpful professor whose lectures are organized and engaging.",
];

const PRAISE_TAILS: [&str; 4] = [
    "Would recommend to anyone in the major.",
    "Best instructor in the department so far.",
    "Really nice person and very knowledgeable.",
    "Knowledgeable and caring about every student.",
];

const COMPLAINTS: [&str; 5] = [
    "The exams were difficult and the midterm felt impossible.",
    "Every exam was awful and the final was terrible.",
    "Quizzes were difficult and the tests were horrible.",
    "The midterm exam was impossible and poorly written.",
    "Final exam questions were difficult and unfair.",
];

const COMPLAINT_TAILS: [&str; 4] = [
    "Avoid this course if possible.",
    "Worst tests I have taken so far.",
    "Bad experience with every single quiz.",
    "The second midterm was even more difficult.",
];

/// Positive reviews about teaching.
pub fn praise_reviews(professor: &str, course_code: &str, count: usize) -> Vec<RawReview> {
    (0..count)
        .map(|i| {
            let text = format!(
                "{} {}",
                PRAISE[i % PRAISE.len()],
                PRAISE_TAILS[i % PRAISE_TAILS.len()]
            );
            RawReview::new(format!("praise-{i:03}"), professor, course_code, text)
                .with_rating(4.5)
                .with_tags(["caring", "clear lectures"])
        })
        .collect()
}

/// Negative reviews about exams.
pub fn complaint_reviews(professor: &str, course_code: &str, count: usize) -> Vec<RawReview> {
    (0..count)
        .map(|i| {
            let text = format!(
                "{} {}",
                COMPLAINTS[i % COMPLAINTS.len()],
                COMPLAINT_TAILS[i % COMPLAINT_TAILS.len()]
            );
            RawReview::new(format!("complaint-{i:03}"), professor, course_code, text)
                .with_rating(1.5)
                .with_tags(["tough tests"])
        })
        .collect()
}

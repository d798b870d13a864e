use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hdbscan::{Hdbscan, HdbscanHyperParams};
use serde::Serialize;
use tracing::debug;

use super::embedding::cosine_similarity;
use super::embedding_cache::{CacheKey, Embedding};
use crate::config::ClusteringConfig;
use crate::schema::NormalizedCourseCode;
use crate::util::error::PipelineError;

/// Strategy that partitions points; a negative label marks noise.
pub trait DensityClusterer: Send + Sync {
    /// # Errors
    /// Returns an error when the backend cannot partition the points.
    fn partition(&self, points: &[Vec<f32>], params: &ClusteringConfig) -> anyhow::Result<Vec<i32>>;
}

/// HDBSCAN over Euclidean distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct HdbscanClusterer;

impl DensityClusterer for HdbscanClusterer {
    fn partition(&self, points: &[Vec<f32>], params: &ClusteringConfig) -> anyhow::Result<Vec<i32>> {
        if points.len() < params.min_cluster_size.max(2) {
            return Ok(vec![-1; points.len()]);
        }
        let hyper_params = HdbscanHyperParams::builder()
            .min_cluster_size(params.min_cluster_size)
            .min_samples(params.min_samples.min(points.len() - 1).max(1))
            .build();
        let data = points.to_vec();
        Hdbscan::new(&data, hyper_params)
            .cluster()
            .map_err(|error| anyhow::anyhow!("hdbscan failed: {error:?}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub id: usize,
    pub course: NormalizedCourseCode,
    pub member_unit_ids: BTreeSet<String>,
    pub centroid: Vec<f32>,
    /// Mean pairwise cosine similarity of the members, clamped to [0, 1].
    pub cohesion: f32,
    pub is_noise: bool,
    /// Produced without density clustering because the course was too small.
    pub low_confidence: bool,
}

impl Cluster {
    #[must_use]
    pub fn support(&self) -> usize {
        self.member_unit_ids.len()
    }
}

/// Groups one course's embeddings into clusters plus at most one noise cluster.
#[derive(Clone)]
pub struct ClusterEngine {
    clusterer: Arc<dyn DensityClusterer>,
    config: ClusteringConfig,
}

impl std::fmt::Debug for ClusterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ClusterEngine {
    pub fn new(clusterer: Arc<dyn DensityClusterer>, config: ClusteringConfig) -> Self {
        Self { clusterer, config }
    }

    /// Cluster `embeddings` (unit id -> embedding) of a single course.
    ///
    /// Non-noise clusters are numbered by size (largest first) and then by
    /// their smallest member id; the noise cluster, if any, comes last.
    ///
    /// # Errors
    /// Returns [`PipelineError::Clustering`] when the backend fails or
    /// returns a label count that does not match the input.
    pub fn cluster(
        &self,
        course: &NormalizedCourseCode,
        embeddings: &BTreeMap<String, Embedding>,
    ) -> Result<Vec<Cluster>, PipelineError> {
        let mut points: Vec<(&String, &Embedding)> = embeddings.iter().collect();
        if points.is_empty() {
            return Ok(Vec::new());
        }
        points.sort_by(|a, b| a.1.key.cmp(&b.1.key).then_with(|| a.0.cmp(b.0)));

        if points.len() < self.config.min_units_for_clustering {
            debug!(%course, units = points.len(), "too few units, skipping density clustering");
            let members: Vec<usize> = (0..points.len()).collect();
            let mut single = build_cluster(0, course, &points, &members, false);
            single.low_confidence = true;
            return Ok(vec![single]);
        }

        if is_unanimous(&points, self.config.min_cluster_size) {
            debug!(%course, units = points.len(), "units share too few distinct vectors, keeping one cluster");
            let members: Vec<usize> = (0..points.len()).collect();
            return Ok(vec![build_cluster(0, course, &points, &members, false)]);
        }

        let vectors: Vec<Vec<f32>> = points.iter().map(|(_, e)| e.vector.to_vec()).collect();
        let labels = self
            .clusterer
            .partition(&vectors, &self.config)
            .map_err(|error| PipelineError::Clustering {
                course: course.clone(),
                message: error.to_string(),
            })?;
        if labels.len() != points.len() {
            return Err(PipelineError::Clustering {
                course: course.clone(),
                message: format!(
                    "expected {} labels, got {}",
                    points.len(),
                    labels.len()
                ),
            });
        }

        let mut groups: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        let mut noise = Vec::new();
        for (index, label) in labels.iter().enumerate() {
            if *label < 0 {
                noise.push(index);
            } else {
                groups.entry(*label).or_default().push(index);
            }
        }

        let mut ordered: Vec<Vec<usize>> = groups.into_values().collect();
        ordered.sort_by(|a, b| {
            b.len()
                .cmp(&a.len())
                .then_with(|| smallest_id(&points, a).cmp(&smallest_id(&points, b)))
        });

        let mut clusters: Vec<Cluster> = ordered
            .iter()
            .enumerate()
            .map(|(id, members)| build_cluster(id, course, &points, members, false))
            .collect();
        if !noise.is_empty() {
            clusters.push(build_cluster(clusters.len(), course, &points, &noise, true));
        }

        debug!(
            %course,
            clusters = clusters.iter().filter(|c| !c.is_noise).count(),
            noise = noise.len(),
            "course clustered"
        );
        Ok(clusters)
    }
}

/// Density clustering labels identical points as noise, so a course whose
/// units collapse onto fewer distinct vectors than a minimum cluster is
/// treated as a single group.
fn is_unanimous(points: &[(&String, &Embedding)], min_cluster_size: usize) -> bool {
    let distinct_keys: BTreeSet<CacheKey> = points.iter().map(|(_, e)| e.key).collect();
    if distinct_keys.len() < min_cluster_size.max(2) {
        return true;
    }
    let first = &points[0].1.vector;
    points.iter().all(|(_, e)| e.vector == *first)
}

fn smallest_id<'a>(points: &[(&'a String, &Embedding)], members: &[usize]) -> Option<&'a String> {
    members.iter().map(|index| points[*index].0).min()
}

fn build_cluster(
    id: usize,
    course: &NormalizedCourseCode,
    points: &[(&String, &Embedding)],
    members: &[usize],
    is_noise: bool,
) -> Cluster {
    let vectors: Vec<&[f32]> = members.iter().map(|i| &*points[*i].1.vector).collect();
    Cluster {
        id,
        course: course.clone(),
        member_unit_ids: members.iter().map(|i| points[*i].0.clone()).collect(),
        centroid: centroid(&vectors),
        cohesion: cohesion(&vectors),
        is_noise,
        low_confidence: false,
    }
}

#[allow(clippy::cast_precision_loss)]
fn centroid(vectors: &[&[f32]]) -> Vec<f32> {
    let dimension = vectors.first().map_or(0, |v| v.len());
    let mut sum = vec![0.0_f32; dimension];
    for vector in vectors {
        for (acc, value) in sum.iter_mut().zip(vector.iter()) {
            *acc += value;
        }
    }
    let count = vectors.len().max(1) as f32;
    sum.iter().map(|value| value / count).collect()
}

/// Mean pairwise cosine similarity; a single member is perfectly cohesive.
#[allow(clippy::cast_precision_loss)]
fn cohesion(vectors: &[&[f32]]) -> f32 {
    if vectors.len() < 2 {
        return if vectors.is_empty() { 0.0 } else { 1.0 };
    }
    let mut total = 0.0_f64;
    let mut pairs = 0_u64;
    for (i, left) in vectors.iter().enumerate() {
        for right in &vectors[i + 1..] {
            total += f64::from(cosine_similarity(left, right));
            pairs += 1;
        }
    }
    #[allow(clippy::cast_possible_truncation)]
    let mean = (total / pairs as f64) as f32;
    mean.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLabels(Vec<i32>);

    impl DensityClusterer for FixedLabels {
        fn partition(&self, _: &[Vec<f32>], _: &ClusteringConfig) -> anyhow::Result<Vec<i32>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl DensityClusterer for Failing {
        fn partition(&self, _: &[Vec<f32>], _: &ClusteringConfig) -> anyhow::Result<Vec<i32>> {
            anyhow::bail!("backend exploded")
        }
    }

    fn course() -> NormalizedCourseCode {
        NormalizedCourseCode::new("CSCE", "221")
    }

    fn embeddings(vectors: &[(&str, Vec<f32>)]) -> BTreeMap<String, Embedding> {
        vectors
            .iter()
            .map(|(id, vector)| {
                (
                    (*id).to_string(),
                    Embedding {
                        key: CacheKey::for_text("test", id),
                        vector: vector.clone().into(),
                    },
                )
            })
            .collect()
    }

    fn blob(prefix: &str, center: [f32; 2], count: usize) -> Vec<(String, Vec<f32>)> {
        (0..count)
            .map(|i| {
                let jitter = i as f32 * 0.01;
                (
                    format!("{prefix}-{i}"),
                    vec![center[0] + jitter, center[1] - jitter],
                )
            })
            .collect()
    }

    fn config() -> ClusteringConfig {
        ClusteringConfig {
            min_cluster_size: 3,
            min_samples: 2,
            min_units_for_clustering: 4,
        }
    }

    #[test]
    fn small_courses_become_one_low_confidence_cluster() {
        let engine = ClusterEngine::new(Arc::new(Failing), config());
        let clusters = engine
            .cluster(
                &course(),
                &embeddings(&[("a", vec![1.0, 0.0]), ("b", vec![0.0, 1.0])]),
            )
            .expect("fallback never calls the backend");
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].low_confidence);
        assert!(!clusters[0].is_noise);
        assert_eq!(clusters[0].support(), 2);
    }

    #[test]
    fn empty_input_yields_no_clusters() {
        let engine = ClusterEngine::new(Arc::new(HdbscanClusterer), config());
        assert!(engine.cluster(&course(), &BTreeMap::new()).expect("ok").is_empty());
    }

    #[test]
    fn identical_vectors_form_one_cluster() {
        let engine = ClusterEngine::new(Arc::new(HdbscanClusterer), config());
        let ids: Vec<String> = (0..10).map(|i| format!("same-{i}")).collect();
        let pairs: Vec<(&str, Vec<f32>)> =
            ids.iter().map(|id| (id.as_str(), vec![0.6, 0.8])).collect();

        let clusters = engine.cluster(&course(), &embeddings(&pairs)).expect("clusters");

        assert_eq!(clusters.len(), 1);
        assert!(!clusters[0].is_noise);
        assert!(!clusters[0].low_confidence);
        assert_eq!(clusters[0].support(), 10);
        assert!((clusters[0].cohesion - 1.0).abs() < 1e-6);
    }

    #[test]
    fn repeated_texts_skip_the_backend() {
        let engine = ClusterEngine::new(Arc::new(Failing), config());
        let key = CacheKey::for_text("test", "same review");
        let points: BTreeMap<String, Embedding> = (0..6)
            .map(|i| {
                let vector = if i % 2 == 0 { vec![1.0, 0.0] } else { vec![0.0, 1.0] };
                let key = if i % 2 == 0 { key } else { CacheKey::for_text("test", "other") };
                (format!("r-{i}"), Embedding { key, vector: vector.into() })
            })
            .collect();

        let clusters = engine
            .cluster(&course(), &points)
            .expect("two distinct texts never reach the backend");
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].support(), 6);
    }

    #[test]
    fn noise_is_kept_in_a_trailing_cluster() {
        let engine = ClusterEngine::new(Arc::new(FixedLabels(vec![0, -1, 0, 1, 1, 1])), config());
        let points = embeddings(&[
            ("a", vec![1.0, 0.0]),
            ("b", vec![0.9, 0.1]),
            ("c", vec![0.0, 1.0]),
            ("d", vec![0.1, 0.9]),
            ("e", vec![0.5, 0.5]),
            ("f", vec![0.2, 0.8]),
        ]);
        let clusters = engine.cluster(&course(), &points).expect("clusters");

        assert_eq!(clusters.len(), 3);
        assert_eq!(clusters[0].support(), 3);
        assert_eq!(clusters[1].support(), 2);
        assert!(clusters[2].is_noise);
        assert_eq!(clusters[2].id, 2);
        let total: usize = clusters.iter().map(Cluster::support).sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn backend_failure_names_the_course() {
        let engine = ClusterEngine::new(Arc::new(Failing), config());
        let points = embeddings(&[
            ("a", vec![1.0, 0.0]),
            ("b", vec![0.9, 0.1]),
            ("c", vec![0.0, 1.0]),
            ("d", vec![0.1, 0.9]),
        ]);
        let error = engine.cluster(&course(), &points).expect_err("backend fails");
        assert!(matches!(error, PipelineError::Clustering { course: c, .. } if c == course()));
    }

    #[test]
    fn label_count_mismatch_is_an_error() {
        let engine = ClusterEngine::new(Arc::new(FixedLabels(vec![0, 0])), config());
        let points = embeddings(&[
            ("a", vec![1.0, 0.0]),
            ("b", vec![0.9, 0.1]),
            ("c", vec![0.0, 1.0]),
            ("d", vec![0.1, 0.9]),
        ]);
        assert!(engine.cluster(&course(), &points).is_err());
    }

    #[test]
    fn hdbscan_separates_distant_blobs_deterministically() {
        let mut raw = blob("left", [0.0, 0.0], 6);
        raw.extend(blob("right", [10.0, 10.0], 6));
        let pairs: Vec<(&str, Vec<f32>)> =
            raw.iter().map(|(id, v)| (id.as_str(), v.clone())).collect();
        let points = embeddings(&pairs);
        let engine = ClusterEngine::new(Arc::new(HdbscanClusterer), config());

        let first = engine.cluster(&course(), &points).expect("clusters");
        let second = engine.cluster(&course(), &points).expect("clusters");
        assert_eq!(first, second);

        let real: Vec<&Cluster> = first.iter().filter(|c| !c.is_noise).collect();
        assert_eq!(real.len(), 2);
        for cluster in real {
            let prefixes: BTreeSet<&str> = cluster
                .member_unit_ids
                .iter()
                .filter_map(|id| id.split('-').next())
                .collect();
            assert_eq!(prefixes.len(), 1, "a cluster mixes blobs");
        }
    }

    #[test]
    fn cohesion_is_clamped_and_reflects_tightness() {
        let tight = [&[1.0_f32, 0.0][..], &[0.99, 0.01][..]];
        let opposite = [&[1.0_f32, 0.0][..], &[-1.0, 0.0][..]];
        assert!(cohesion(&tight) > 0.9);
        assert!(cohesion(&opposite).abs() < f32::EPSILON);
        assert!((cohesion(&[&[1.0_f32][..]]) - 1.0).abs() < f32::EPSILON);
    }
}

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use crate::config::PreprocessConfig;
use crate::schema::{CleanedReviewUnit, NormalizedCourseCode};
use crate::util::text::{fingerprint, jaccard, shingles};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DedupOutcome {
    pub(crate) units: Vec<CleanedReviewUnit>,
    pub(crate) removed: usize,
}

#[derive(Default)]
struct Scope {
    fingerprints: FxHashSet<String>,
    shingle_sets: Vec<FxHashSet<u64>>,
}

/// Drops near-identical reviews within one (course, professor) scope,
/// keeping the first occurrence.
#[derive(Debug, Clone)]
pub(crate) struct Deduplicator {
    threshold: f64,
    window: usize,
}

impl Deduplicator {
    pub(crate) fn new(config: &PreprocessConfig) -> Self {
        Self {
            threshold: config.near_duplicate_threshold,
            window: config.shingle_window,
        }
    }

    pub(crate) fn deduplicate(&self, units: Vec<CleanedReviewUnit>) -> DedupOutcome {
        let mut scopes: BTreeMap<(NormalizedCourseCode, String), Scope> = BTreeMap::new();
        let mut kept = Vec::with_capacity(units.len());
        let mut removed = 0;

        for unit in units {
            let key = (unit.course.clone(), unit.professor_id.clone());
            let scope = scopes.entry(key).or_default();
            let print = fingerprint(&unit.normalized_text);

            if scope.fingerprints.contains(&print) {
                removed += 1;
                continue;
            }

            let candidate = shingles(&print, self.window);
            let near_duplicate = scope
                .shingle_sets
                .iter()
                .any(|existing| jaccard(existing, &candidate) >= self.threshold);
            if near_duplicate {
                removed += 1;
                continue;
            }

            scope.fingerprints.insert(print);
            scope.shingle_sets.push(candidate);
            kept.push(unit);
        }

        DedupOutcome {
            units: kept,
            removed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, course: &str, professor: &str, text: &str) -> CleanedReviewUnit {
        CleanedReviewUnit {
            source_review_id: id.into(),
            normalized_text: text.into(),
            course: NormalizedCourseCode::new("CSCE", course),
            professor_id: professor.into(),
            rating: None,
            difficulty: None,
            tags: Vec::new(),
        }
    }

    fn deduplicator() -> Deduplicator {
        Deduplicator::new(&PreprocessConfig::default())
    }

    #[test]
    fn same_text_twice_counts_once() {
        let text = "Lectures were clear and the exams matched the homework closely.";
        let once = deduplicator().deduplicate(vec![unit("r-1", "221", "p", text)]);
        let twice = deduplicator().deduplicate(vec![
            unit("r-1", "221", "p", text),
            unit("r-2", "221", "p", text),
        ]);
        assert_eq!(once.units.len(), twice.units.len());
        assert_eq!(twice.removed, 1);
        assert_eq!(twice.units[0].source_review_id, "r-1");
    }

    #[test]
    fn case_and_punctuation_differences_are_duplicates() {
        let outcome = deduplicator().deduplicate(vec![
            unit("r-1", "221", "p", "Great professor, fair grading overall!"),
            unit("r-2", "221", "p", "great professor fair grading overall"),
        ]);
        assert_eq!(outcome.units.len(), 1);
    }

    #[test]
    fn scopes_are_independent() {
        let text = "Homework took about ten hours every single week.";
        let outcome = deduplicator().deduplicate(vec![
            unit("r-1", "221", "p", text),
            unit("r-2", "222", "p", text),
            unit("r-3", "221", "q", text),
        ]);
        assert_eq!(outcome.units.len(), 3);
        assert_eq!(outcome.removed, 0);
    }

    #[test]
    fn distinct_texts_survive() {
        let outcome = deduplicator().deduplicate(vec![
            unit("r-1", "221", "p", "The midterm was much harder than the practice exam."),
            unit("r-2", "221", "p", "Office hours helped me understand recursion finally."),
        ]);
        assert_eq!(outcome.units.len(), 2);
    }
}

//! Course code canonicalisation.
//!
//! A raw code goes through three steps: department/number extraction with
//! number repair, department alias resolution, and cross-listing lookup.
//! The result depends only on the code, the alias table and the graph.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use petgraph::unionfind::UnionFind;
use thiserror::Error;

use crate::schema::NormalizedCourseCode;

const CANONICAL_DIGITS: usize = 3;
const MIN_COURSE_NUMBER: u32 = 100;
const MAX_COURSE_NUMBER: u32 = 999;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CourseCodeError {
    #[error("unparseable course code: {code:?}")]
    Unparseable { code: String },
}

/// Static department alias table, e.g. `CPSC -> CSCE`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepartmentAliases {
    aliases: BTreeMap<String, String>,
}

impl DepartmentAliases {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self {
            aliases: entries
                .into_iter()
                .map(|(alias, canonical)| {
                    (
                        alias.as_ref().to_uppercase(),
                        canonical.as_ref().to_uppercase(),
                    )
                })
                .collect(),
        }
    }

    /// Canonical department for `department`; unknown codes pass through.
    #[must_use]
    pub fn resolve(&self, department: &str) -> String {
        self.aliases
            .get(department)
            .cloned()
            .unwrap_or_else(|| department.to_string())
    }
}

/// Connected components of documented cross-listings, each collapsed to one
/// representative (smallest department, then smallest number).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrossListingGraph {
    representatives: BTreeMap<NormalizedCourseCode, NormalizedCourseCode>,
}

impl CrossListingGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from already-canonical course pairs.
    pub fn from_codes<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (NormalizedCourseCode, NormalizedCourseCode)>,
    {
        let edges: Vec<_> = pairs.into_iter().collect();
        let nodes: Vec<NormalizedCourseCode> = edges
            .iter()
            .flat_map(|(left, right)| [left.clone(), right.clone()])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index_of = |code: &NormalizedCourseCode| nodes.binary_search(code).ok();

        let mut components = UnionFind::<usize>::new(nodes.len());
        for (left, right) in &edges {
            if let (Some(l), Some(r)) = (index_of(left), index_of(right)) {
                components.union(l, r);
            }
        }

        let mut best: BTreeMap<usize, &NormalizedCourseCode> = BTreeMap::new();
        for (index, code) in nodes.iter().enumerate() {
            let root = components.find(index);
            best.entry(root)
                .and_modify(|current| {
                    if code.canonical_cmp(current) == Ordering::Less {
                        *current = code;
                    }
                })
                .or_insert(code);
        }

        let representatives = nodes
            .iter()
            .enumerate()
            .filter_map(|(index, code)| {
                best.get(&components.find(index))
                    .map(|rep| (code.clone(), (*rep).clone()))
            })
            .collect();

        Self { representatives }
    }

    /// Build from raw code strings, repairing and alias-resolving every
    /// node first so that representatives are themselves canonical.
    ///
    /// # Errors
    /// Returns [`CourseCodeError::Unparseable`] for the first pair member
    /// that carries no department or number.
    pub fn from_pairs<I, S>(pairs: I, normalizer: &CourseCodeNormalizer) -> Result<Self, CourseCodeError>
    where
        I: IntoIterator<Item = (S, S)>,
        S: AsRef<str>,
    {
        let mut codes = Vec::new();
        for (left, right) in pairs {
            let left = normalizer.parse(left.as_ref(), None)?;
            let right = normalizer.parse(right.as_ref(), None)?;
            codes.push((left, right));
        }
        Ok(Self::from_codes(codes))
    }

    /// Cross-listings that are always known (CSCE/ECEN 222 and 314).
    #[must_use]
    pub fn builtin() -> Self {
        Self::from_codes([
            (
                NormalizedCourseCode::new("CSCE", "222"),
                NormalizedCourseCode::new("ECEN", "222"),
            ),
            (
                NormalizedCourseCode::new("CSCE", "314"),
                NormalizedCourseCode::new("ECEN", "314"),
            ),
        ])
    }

    #[must_use]
    pub fn representative(&self, code: &NormalizedCourseCode) -> Option<&NormalizedCourseCode> {
        self.representatives.get(code)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.representatives.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CodeTokens {
    department: Option<String>,
    digits: Option<String>,
}

/// Maps raw course identifiers to [`NormalizedCourseCode`].
#[derive(Debug, Clone, Default)]
pub struct CourseCodeNormalizer {
    aliases: DepartmentAliases,
}

impl CourseCodeNormalizer {
    #[must_use]
    pub fn new(aliases: DepartmentAliases) -> Self {
        Self { aliases }
    }

    /// Canonical course for `code`.
    ///
    /// # Errors
    /// Returns [`CourseCodeError::Unparseable`] when no department or no
    /// number can be extracted.
    pub fn normalize(
        &self,
        code: &str,
        cross_listings: &CrossListingGraph,
    ) -> Result<NormalizedCourseCode, CourseCodeError> {
        self.normalize_with_hint(code, cross_listings, None)
    }

    /// Like [`CourseCodeNormalizer::normalize`], borrowing `department_hint`
    /// when the code is a bare number.
    ///
    /// # Errors
    /// Returns [`CourseCodeError::Unparseable`] when no department (and no
    /// hint) or no number can be extracted.
    pub fn normalize_with_hint(
        &self,
        code: &str,
        cross_listings: &CrossListingGraph,
        department_hint: Option<&str>,
    ) -> Result<NormalizedCourseCode, CourseCodeError> {
        let parsed = self.parse(code, department_hint)?;
        Ok(cross_listings
            .representative(&parsed)
            .cloned()
            .unwrap_or(parsed))
    }

    /// Alias-resolved department of a code that also carries a number.
    #[must_use]
    pub fn department_of(&self, code: &str) -> Option<String> {
        let tokens = tokenize(code);
        match tokens {
            CodeTokens {
                department: Some(department),
                digits: Some(_),
            } => Some(self.aliases.resolve(&department)),
            _ => None,
        }
    }

    fn parse(
        &self,
        code: &str,
        department_hint: Option<&str>,
    ) -> Result<NormalizedCourseCode, CourseCodeError> {
        let unparseable = || CourseCodeError::Unparseable {
            code: code.to_string(),
        };
        let tokens = tokenize(code);
        let department = tokens
            .department
            .or_else(|| department_hint.map(str::to_uppercase))
            .ok_or_else(unparseable)?;
        let digits = tokens.digits.ok_or_else(unparseable)?;
        let number = repair_number(&digits);
        Ok(NormalizedCourseCode::new(
            self.aliases.resolve(&department),
            number,
        ))
    }
}

/// First letter run before the first digit run, and that digit run.
fn tokenize(code: &str) -> CodeTokens {
    let mut department = None;
    for run in alphanumeric_runs(&code.to_uppercase()) {
        if run.starts_with(|ch: char| ch.is_ascii_digit()) {
            return CodeTokens {
                department,
                digits: Some(run),
            };
        }
        department.get_or_insert(run);
    }
    CodeTokens {
        department,
        digits: None,
    }
}

/// Maximal runs of ASCII letters or ASCII digits; everything else separates.
fn alphanumeric_runs(text: &str) -> Vec<String> {
    let mut runs: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        let same_class = current
            .chars()
            .last()
            .is_some_and(|last| last.is_ascii_digit() == ch.is_ascii_digit());
        if (!ch.is_ascii_alphanumeric() || !same_class) && !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
        if ch.is_ascii_alphanumeric() {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

/// Repair concatenated or padded course numbers.
///
/// Runs of six or more digits are read as several numbers glued together
/// and the first one in the valid range wins; four or five digits lose
/// leading zeros and keep their first canonical-length prefix.
fn repair_number(digits: &str) -> String {
    if digits.len() >= CANONICAL_DIGITS * 2 {
        return digits
            .as_bytes()
            .chunks_exact(CANONICAL_DIGITS)
            .filter_map(|chunk| std::str::from_utf8(chunk).ok())
            .find(|chunk| {
                chunk
                    .parse::<u32>()
                    .is_ok_and(|n| (MIN_COURSE_NUMBER..=MAX_COURSE_NUMBER).contains(&n))
            })
            .unwrap_or(&digits[..CANONICAL_DIGITS])
            .to_string();
    }
    if digits.len() > CANONICAL_DIGITS {
        let trimmed = digits.trim_start_matches('0');
        let source = if trimmed.len() >= CANONICAL_DIGITS {
            trimmed
        } else {
            digits
        };
        return source[..CANONICAL_DIGITS].to_string();
    }
    digits.to_string()
}

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical (department, number) pair every alias of a course resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NormalizedCourseCode {
    pub department: String,
    pub number: String,
}

impl NormalizedCourseCode {
    #[must_use]
    pub fn new(department: impl Into<String>, number: impl Into<String>) -> Self {
        Self {
            department: department.into(),
            number: number.into(),
        }
    }

    /// Ordering used to pick a cross-listing representative: department
    /// alphabetically, then course number numerically.
    #[must_use]
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.department
            .cmp(&other.department)
            .then_with(|| self.number.len().cmp(&other.number.len()))
            .then_with(|| self.number.cmp(&other.number))
    }
}

impl fmt::Display for NormalizedCourseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.department, self.number)
    }
}

impl PartialEq<str> for NormalizedCourseCode {
    fn eq(&self, other: &str) -> bool {
        other
            .split_once(' ')
            .is_some_and(|(department, number)| {
                department == self.department && number == self.number
            })
    }
}

impl PartialEq<&str> for NormalizedCourseCode {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

//! Three-valued logic for matching.
//!
//! Matching an assertion against an entry has three outcomes: it matched, it
//! did not, or the question does not apply (no matching rule, an attribute
//! that cannot be ordered, a virtual attribute that refuses substring
//! matching). Callers get the third outcome as a value instead of an error.

use std::ops::Not;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionResult {
    True,
    False,
    Undefined,
}

impl ConditionResult {
    /// Three-valued AND: any `False` wins, then any `Undefined`.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::False, _) | (_, Self::False) => Self::False,
            (Self::True, Self::True) => Self::True,
            _ => Self::Undefined,
        }
    }

    /// Three-valued OR: any `True` wins, then any `Undefined`.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::True, _) | (_, Self::True) => Self::True,
            (Self::False, Self::False) => Self::False,
            _ => Self::Undefined,
        }
    }

    /// AND over an iterator. The empty conjunction is `True`.
    pub fn all(results: impl IntoIterator<Item = Self>) -> Self {
        results.into_iter().fold(Self::True, Self::and)
    }

    /// OR over an iterator. The empty disjunction is `False`.
    pub fn any(results: impl IntoIterator<Item = Self>) -> Self {
        results.into_iter().fold(Self::False, Self::or)
    }

    #[must_use]
    pub fn is_true(self) -> bool {
        self == Self::True
    }
}

impl Not for ConditionResult {
    type Output = Self;

    fn not(self) -> Self {
        match self {
            Self::True => Self::False,
            Self::False => Self::True,
            Self::Undefined => Self::Undefined,
        }
    }
}

impl From<bool> for ConditionResult {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

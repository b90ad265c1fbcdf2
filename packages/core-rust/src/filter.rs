//! Search filters and their three-valued evaluation.

use serde::{Deserialize, Serialize};

use crate::condition::ConditionResult;
use crate::entry::Entry;

/// A decoded search filter (RFC 4511 §4.5.1, without extensible match).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equality(String, String),
    Substring {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        final_: Option<String>,
    },
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
}

/// Per-assertion matching capability.
///
/// `Entry` implements this over its stored values; backends wrap it to splice
/// in virtual attributes that answer with their own rules.
pub trait AttributeMatcher {
    fn present(&self, attribute: &str) -> ConditionResult;
    fn equality(&self, attribute: &str, value: &str) -> ConditionResult;
    fn substring(
        &self,
        attribute: &str,
        initial: Option<&str>,
        any: &[String],
        final_: Option<&str>,
    ) -> ConditionResult;
    /// `greater` selects `>=`; otherwise `<=`.
    fn ordering(&self, attribute: &str, value: &str, greater: bool) -> ConditionResult;
}

impl Filter {
    /// `(objectClass=*)`, the usual match-everything filter.
    #[must_use]
    pub fn match_all() -> Self {
        Self::Present("objectclass".to_string())
    }

    pub fn evaluate(&self, target: &impl AttributeMatcher) -> ConditionResult {
        match self {
            Self::And(filters) => ConditionResult::all(filters.iter().map(|f| f.evaluate(target))),
            Self::Or(filters) => ConditionResult::any(filters.iter().map(|f| f.evaluate(target))),
            Self::Not(inner) => !inner.evaluate(target),
            Self::Present(attribute) => target.present(attribute),
            Self::Equality(attribute, value) => target.equality(attribute, value),
            Self::Substring {
                attribute,
                initial,
                any,
                final_,
            } => target.substring(attribute, initial.as_deref(), any, final_.as_deref()),
            Self::GreaterOrEqual(attribute, value) => target.ordering(attribute, value, true),
            Self::LessOrEqual(attribute, value) => target.ordering(attribute, value, false),
        }
    }
}

impl AttributeMatcher for Entry {
    fn present(&self, attribute: &str) -> ConditionResult {
        self.has_attribute(attribute).into()
    }

    fn equality(&self, attribute: &str, value: &str) -> ConditionResult {
        self.has_value(attribute, value).into()
    }

    fn substring(
        &self,
        attribute: &str,
        initial: Option<&str>,
        any: &[String],
        final_: Option<&str>,
    ) -> ConditionResult {
        let Some(values) = self.values(attribute) else {
            return ConditionResult::False;
        };
        values
            .iter()
            .any(|v| substring_matches(&v.to_lowercase(), initial, any, final_))
            .into()
    }

    fn ordering(&self, attribute: &str, value: &str, greater: bool) -> ConditionResult {
        let Some(values) = self.values(attribute) else {
            return ConditionResult::False;
        };
        ConditionResult::any(values.iter().map(|v| compare_ordered(v, value, greater)))
    }
}

fn substring_matches(
    value: &str,
    initial: Option<&str>,
    any: &[String],
    final_: Option<&str>,
) -> bool {
    let mut rest = value;
    if let Some(initial) = initial {
        let initial = initial.to_lowercase();
        let Some(stripped) = rest.strip_prefix(initial.as_str()) else {
            return false;
        };
        rest = stripped;
    }
    for fragment in any {
        let fragment = fragment.to_lowercase();
        let Some(pos) = rest.find(fragment.as_str()) else {
            return false;
        };
        rest = &rest[pos + fragment.len()..];
    }
    match final_ {
        Some(final_) => rest.ends_with(final_.to_lowercase().as_str()),
        None => true,
    }
}

/// Integer assertions order numerically and cannot order a non-integer
/// value; anything else orders case-insensitively by string.
fn compare_ordered(value: &str, assertion: &str, greater: bool) -> ConditionResult {
    let ordering = if let Ok(asserted) = assertion.trim().parse::<i64>() {
        match value.trim().parse::<i64>() {
            Ok(actual) => actual.cmp(&asserted),
            Err(_) => return ConditionResult::Undefined,
        }
    } else {
        value.to_lowercase().cmp(&assertion.to_lowercase())
    };
    if greater {
        ordering.is_ge().into()
    } else {
        ordering.is_le().into()
    }
}

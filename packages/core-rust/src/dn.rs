//! Distinguished names.
//!
//! The schema subsystem owns real matching rules; this module applies the
//! one rule every layer of the core needs: attribute types and values compare
//! case-insensitively with surrounding whitespace ignored. That is enough to
//! key entries, resolve `dn:` authentication ids, and compare identities.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Errors from parsing a distinguished name string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnError {
    #[error("empty RDN at position {position} in {input:?}")]
    EmptyRdn { input: String, position: usize },
    #[error("RDN {rdn:?} is missing '='")]
    MissingEquals { rdn: String },
    #[error("RDN {rdn:?} has an invalid attribute type")]
    InvalidAttributeType { rdn: String },
    #[error("dangling escape at end of {input:?}")]
    DanglingEscape { input: String },
}

/// One relative distinguished name, kept in both display and normalized form.
///
/// Equality, ordering, and hashing use the normalized form only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rdn {
    display: String,
    normalized: String,
}

impl Rdn {
    fn parse(raw: &str) -> Result<Self, DnError> {
        let Some(eq) = find_unescaped(raw, '=') else {
            return Err(DnError::MissingEquals {
                rdn: raw.to_string(),
            });
        };
        let attr = raw[..eq].trim();
        let value = raw[eq + 1..].trim();
        if attr.is_empty()
            || !attr
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ';')
        {
            return Err(DnError::InvalidAttributeType {
                rdn: raw.to_string(),
            });
        }
        Ok(Self {
            display: format!("{attr}={value}"),
            normalized: format!("{}={}", attr.to_ascii_lowercase(), value.to_lowercase()),
        })
    }

    /// The attribute type of this RDN, lowercased.
    #[must_use]
    pub fn attribute_type(&self) -> &str {
        self.normalized
            .split_once('=')
            .map_or(self.normalized.as_str(), |(attr, _)| attr)
    }

    /// The value of this RDN as originally written.
    #[must_use]
    pub fn value(&self) -> &str {
        self.display
            .split_once('=')
            .map_or("", |(_, value)| value)
    }

    #[must_use]
    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Rdn {}

impl Hash for Rdn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// A parsed distinguished name, stored leaf-first.
///
/// The empty DN is the root DSE and also the identity of an anonymous client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// Parses a DN string such as `uid=test.user,o=test`.
    ///
    /// # Errors
    ///
    /// Returns `DnError` when a component is empty, lacks `=`, has an invalid
    /// attribute type, or the string ends in a lone backslash.
    pub fn parse(input: &str) -> Result<Self, DnError> {
        if input.trim().is_empty() {
            return Ok(Self::root());
        }
        if ends_with_dangling_escape(input) {
            return Err(DnError::DanglingEscape {
                input: input.to_string(),
            });
        }

        let mut rdns = Vec::new();
        for (position, part) in split_unescaped(input, ',') {
            if part.trim().is_empty() {
                return Err(DnError::EmptyRdn {
                    input: input.to_string(),
                    position,
                });
            }
            rdns.push(Rdn::parse(part)?);
        }
        Ok(Self { rdns })
    }

    /// The root DN (zero RDNs).
    #[must_use]
    pub fn root() -> Self {
        Self { rdns: Vec::new() }
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Number of RDNs.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// The leaf RDN, if any.
    #[must_use]
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// The immediate superior, or `None` for the root DN.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.rdns.is_empty() {
            return None;
        }
        Some(Self {
            rdns: self.rdns[1..].to_vec(),
        })
    }

    /// Returns true when `self` equals `base` or sits anywhere beneath it.
    #[must_use]
    pub fn is_within(&self, base: &Self) -> bool {
        if base.rdns.len() > self.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - base.rdns.len();
        self.rdns[offset..] == base.rdns[..]
    }

    /// Returns true when `self` is exactly one level beneath `base`.
    #[must_use]
    pub fn is_child_of(&self, base: &Self) -> bool {
        self.rdns.len() == base.rdns.len() + 1 && self.is_within(base)
    }

    /// The normalized string form used for comparisons and logging keys.
    #[must_use]
    pub fn normalized(&self) -> String {
        self.rdns
            .iter()
            .map(Rdn::normalized)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns == other.rdns
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rdns.hash(state);
    }
}

impl Ord for Dn {
    /// Orders by suffix first so that a `BTreeMap<Dn, _>` groups subtrees.
    fn cmp(&self, other: &Self) -> Ordering {
        self.rdns
            .iter()
            .rev()
            .map(Rdn::normalized)
            .cmp(other.rdns.iter().rev().map(Rdn::normalized))
    }
}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{rdn}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Dn {
    type Err = DnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn find_unescaped(input: &str, needle: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == needle {
            return Some(i);
        }
    }
    None
}

fn split_unescaped(input: &str, separator: char) -> Vec<(usize, &str)> {
    let mut parts = Vec::new();
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == separator {
            parts.push((start, &input[start..i]));
            start = i + c.len_utf8();
        }
    }
    parts.push((start, &input[start..]));
    parts
}

fn ends_with_dangling_escape(input: &str) -> bool {
    let trailing = input.chars().rev().take_while(|c| *c == '\\').count();
    trailing % 2 == 1
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dn::Dn;

/// A directory entry: a DN plus multi-valued attributes.
///
/// Attribute names are stored lowercased; the schema subsystem is not
/// consulted, so aliases (`cn` / `commonName`) are distinct attributes here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub dn: Dn,
    attributes: BTreeMap<String, Vec<String>>,
}

impl Entry {
    #[must_use]
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style helper that appends one value.
    #[must_use]
    pub fn with(mut self, attribute: &str, value: impl Into<String>) -> Self {
        self.add_value(attribute, value);
        self
    }

    /// Appends a value unless an equal (case-insensitive) value is present.
    pub fn add_value(&mut self, attribute: &str, value: impl Into<String>) {
        let value = value.into();
        let values = self
            .attributes
            .entry(attribute.to_ascii_lowercase())
            .or_default();
        if !values.iter().any(|v| v.eq_ignore_ascii_case(&value)) {
            values.push(value);
        }
    }

    /// Removes one value; drops the attribute when it becomes empty.
    /// Returns true when the value was present.
    pub fn remove_value(&mut self, attribute: &str, value: &str) -> bool {
        let key = attribute.to_ascii_lowercase();
        let Some(values) = self.attributes.get_mut(&key) else {
            return false;
        };
        let before = values.len();
        values.retain(|v| !v.eq_ignore_ascii_case(value));
        let removed = values.len() != before;
        if values.is_empty() {
            self.attributes.remove(&key);
        }
        removed
    }

    /// Replaces all values of an attribute; an empty list removes it.
    pub fn replace(&mut self, attribute: &str, values: Vec<String>) {
        let key = attribute.to_ascii_lowercase();
        if values.is_empty() {
            self.attributes.remove(&key);
        } else {
            self.attributes.insert(key, values);
        }
    }

    /// Removes an attribute entirely. Returns true when it existed.
    pub fn remove_attribute(&mut self, attribute: &str) -> bool {
        self.attributes
            .remove(&attribute.to_ascii_lowercase())
            .is_some()
    }

    #[must_use]
    pub fn values(&self, attribute: &str) -> Option<&[String]> {
        self.attributes
            .get(&attribute.to_ascii_lowercase())
            .map(Vec::as_slice)
    }

    #[must_use]
    pub fn first_value(&self, attribute: &str) -> Option<&str> {
        self.values(attribute)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    #[must_use]
    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.attributes
            .contains_key(&attribute.to_ascii_lowercase())
    }

    #[must_use]
    pub fn has_value(&self, attribute: &str, value: &str) -> bool {
        self.values(attribute)
            .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case(value)))
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.attributes
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Copy of this entry restricted to the named attributes. An empty list
    /// keeps every attribute.
    #[must_use]
    pub fn project(&self, requested: &[String]) -> Self {
        if requested.is_empty() {
            return self.clone();
        }
        let attributes = self
            .attributes
            .iter()
            .filter(|(name, _)| requested.iter().any(|r| r.eq_ignore_ascii_case(name)))
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect();
        Self {
            dn: self.dn.clone(),
            attributes,
        }
    }
}

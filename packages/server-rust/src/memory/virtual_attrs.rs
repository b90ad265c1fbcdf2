//! Attributes computed at read time instead of stored.
//!
//! Each provider is a narrow capability: it produces values for one
//! attribute and answers matching assertions with its own rules. Assertions
//! a provider cannot evaluate come back `Undefined`.

use std::collections::BTreeMap;
use std::sync::Arc;

use ldapd_core::{AttributeMatcher, ConditionResult, Dn, Entry};

/// The stored entries a provider may consult.
pub type EntryTree = BTreeMap<Dn, Entry>;

pub trait VirtualAttributeProvider: Send + Sync {
    /// Lowercase attribute name this provider answers for.
    fn attribute(&self) -> &'static str;

    fn values(&self, entry: &Entry, tree: &EntryTree) -> Vec<String>;

    fn present(&self, entry: &Entry, tree: &EntryTree) -> ConditionResult {
        (!self.values(entry, tree).is_empty()).into()
    }

    fn equality(&self, entry: &Entry, tree: &EntryTree, value: &str) -> ConditionResult {
        self.values(entry, tree)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(value))
            .into()
    }

    fn substring(&self, _entry: &Entry, _tree: &EntryTree) -> ConditionResult {
        ConditionResult::Undefined
    }

    fn ordering(&self, _entry: &Entry, _tree: &EntryTree) -> ConditionResult {
        ConditionResult::Undefined
    }
}

/// `hasSubordinates`: `TRUE` when at least one entry sits directly below.
///
/// Boolean syntax only supports equality. An assertion value that is not
/// `TRUE` or `FALSE` cannot be evaluated.
#[derive(Debug, Default)]
pub struct HasSubordinates;

impl HasSubordinates {
    fn has_children(entry: &Entry, tree: &EntryTree) -> bool {
        tree.keys().any(|dn| dn.is_child_of(&entry.dn))
    }
}

impl VirtualAttributeProvider for HasSubordinates {
    fn attribute(&self) -> &'static str {
        "hassubordinates"
    }

    fn values(&self, entry: &Entry, tree: &EntryTree) -> Vec<String> {
        let value = if Self::has_children(entry, tree) { "TRUE" } else { "FALSE" };
        vec![value.to_string()]
    }

    fn equality(&self, entry: &Entry, tree: &EntryTree, value: &str) -> ConditionResult {
        let asserted = match value.trim() {
            v if v.eq_ignore_ascii_case("TRUE") => true,
            v if v.eq_ignore_ascii_case("FALSE") => false,
            _ => return ConditionResult::Undefined,
        };
        (Self::has_children(entry, tree) == asserted).into()
    }
}

/// Providers keyed by attribute name.
#[derive(Clone, Default)]
pub struct VirtualAttributes {
    providers: BTreeMap<&'static str, Arc<dyn VirtualAttributeProvider>>,
}

impl VirtualAttributes {
    /// Registry containing `hasSubordinates`.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(HasSubordinates));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn VirtualAttributeProvider>) {
        self.providers.insert(provider.attribute(), provider);
    }

    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&dyn VirtualAttributeProvider> {
        self.providers
            .get(attribute.to_ascii_lowercase().as_str())
            .map(|provider| &**provider)
    }

    /// Adds the values of every requested virtual attribute to `target`.
    /// Virtual attributes are only returned when named explicitly.
    pub fn materialize(&self, target: &mut Entry, source: &Entry, tree: &EntryTree, requested: &[String]) {
        for name in requested {
            if let Some(provider) = self.get(name) {
                target.replace(provider.attribute(), provider.values(source, tree));
            }
        }
    }

    /// A matcher over `entry` that consults providers first.
    #[must_use]
    pub fn matcher<'a>(&'a self, entry: &'a Entry, tree: &'a EntryTree) -> VirtualEntry<'a> {
        VirtualEntry {
            entry,
            tree,
            registry: self,
        }
    }
}

impl std::fmt::Debug for VirtualAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.providers.keys()).finish()
    }
}

/// An entry as seen by filter evaluation, virtual attributes included.
pub struct VirtualEntry<'a> {
    entry: &'a Entry,
    tree: &'a EntryTree,
    registry: &'a VirtualAttributes,
}

impl AttributeMatcher for VirtualEntry<'_> {
    fn present(&self, attribute: &str) -> ConditionResult {
        match self.registry.get(attribute) {
            Some(p) => p.present(self.entry, self.tree),
            None => self.entry.present(attribute),
        }
    }

    fn equality(&self, attribute: &str, value: &str) -> ConditionResult {
        match self.registry.get(attribute) {
            Some(p) => p.equality(self.entry, self.tree, value),
            None => self.entry.equality(attribute, value),
        }
    }

    fn substring(
        &self,
        attribute: &str,
        initial: Option<&str>,
        any: &[String],
        final_: Option<&str>,
    ) -> ConditionResult {
        match self.registry.get(attribute) {
            Some(p) => p.substring(self.entry, self.tree),
            None => self.entry.substring(attribute, initial, any, final_),
        }
    }

    fn ordering(&self, attribute: &str, value: &str, greater: bool) -> ConditionResult {
        match self.registry.get(attribute) {
            Some(p) => p.ordering(self.entry, self.tree),
            None => self.entry.ordering(attribute, value, greater),
        }
    }
}

//! Secondary index over file metadata.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::metadata::Metadata;

/// Best-effort index kept in step with every file mutation.
pub trait SearchIndex: Send + Sync {
    fn index(&self, name: &str, metadata: &Metadata);
    fn delete(&self, name: &str);
    /// Names of files matching `query`, ordered.
    fn query(&self, query: &str) -> Vec<String>;
}

/// In-memory index.
///
/// A query is a whitespace-separated list of terms, all of which must match.
/// `Key:value` matches a metadata entry (case-insensitive, `*` for any value);
/// a bare term matches a substring of the file name.
#[derive(Default)]
pub struct MemorySearchIndex {
    entries: RwLock<BTreeMap<String, Metadata>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(name: &str, metadata: &Metadata, term: &str) -> bool {
        match term.split_once(':') {
            Some((key, value)) => match metadata.get(key) {
                Some(actual) => value == "*" || actual.eq_ignore_ascii_case(value),
                None => false,
            },
            None => name.to_lowercase().contains(&term.to_lowercase()),
        }
    }
}

impl SearchIndex for MemorySearchIndex {
    fn index(&self, name: &str, metadata: &Metadata) {
        self.entries
            .write()
            .insert(name.to_string(), metadata.clone());
    }

    fn delete(&self, name: &str) {
        self.entries.write().remove(name);
    }

    fn query(&self, query: &str) -> Vec<String> {
        let terms: Vec<&str> = query.split_whitespace().collect();
        self.entries
            .read()
            .iter()
            .filter(|(name, metadata)| terms.iter().all(|t| Self::matches(name, metadata, t)))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

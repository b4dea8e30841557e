//! File metadata: a case-preserving string map with case-insensitive lookup.

use serde::{Deserialize, Serialize};

/// Well-known metadata keys.
pub mod keys {
    pub const ETAG: &str = "ETag";
    pub const CONTENT_HASH: &str = "Content-Hash";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const LAST_MODIFIED: &str = "Last-Modified";
    pub const SYNC_VERSION: &str = "Sync-Version";
    pub const SYNC_SOURCE: &str = "Sync-Source";
    pub const SYNC_HISTORY: &str = "Sync-History";
    pub const SYNC_CONFLICT: &str = "Sync-Conflict";
    pub const SYNC_CONFLICT_RESOLUTION: &str = "Sync-Conflict-Resolution";
    pub const SYNC_DELETED: &str = "Sync-Deleted";
    pub const SYNC_RENAME: &str = "Sync-Rename";
}

/// Keys owned by the receiving server. Never merged from incoming metadata.
pub const CONTROL_KEYS: &[&str] = &[
    keys::ETAG,
    keys::CONTENT_HASH,
    keys::CONTENT_LENGTH,
    keys::SYNC_CONFLICT,
    keys::SYNC_CONFLICT_RESOLUTION,
];

/// Ordered string-to-string map. Keys keep the casing they were inserted
/// with; lookups ignore case. Equality ignores entry order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.position(key).map(|i| self.0[i].1.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Insert or replace a value. A replaced entry takes the new key casing.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(i) => self.0[i] = (key, value),
            None => self.0.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.position(key).map(|i| self.0.remove(i).1)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of this map without the receiver-owned control keys.
    pub fn without_control_keys(&self) -> Metadata {
        Metadata(
            self.0
                .iter()
                .filter(|(k, _)| !CONTROL_KEYS.iter().any(|c| c.eq_ignore_ascii_case(k)))
                .cloned()
                .collect(),
        )
    }

    /// Copy of this map with only user keys (no control or `Sync-*` keys).
    pub fn user_entries(&self) -> Metadata {
        Metadata(
            self.0
                .iter()
                .filter(|(k, _)| {
                    !CONTROL_KEYS.iter().any(|c| c.eq_ignore_ascii_case(k))
                        && !k.to_ascii_lowercase().starts_with("sync-")
                        && !k.eq_ignore_ascii_case(keys::LAST_MODIFIED)
                })
                .cloned()
                .collect(),
        )
    }

    pub fn etag(&self) -> Option<crate::tag::Etag> {
        self.get(keys::ETAG).and_then(|v| v.parse().ok())
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.get(keys::CONTENT_HASH)
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn is_conflicted(&self) -> bool {
        self.flag(keys::SYNC_CONFLICT)
    }

    /// Deleted or renamed away locally; kept only so the change can propagate.
    pub fn is_tombstone(&self) -> bool {
        self.flag(keys::SYNC_DELETED)
    }

    pub fn renamed_to(&self) -> Option<&str> {
        if self.is_tombstone() {
            self.get(keys::SYNC_RENAME)
        } else {
            None
        }
    }
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl Eq for Metadata {}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup_preserves_casing() {
        let mut metadata = Metadata::new();
        metadata.insert("Content-Type", "text/plain");
        assert_eq!(metadata.get("content-type"), Some("text/plain"));

        metadata.insert("CONTENT-TYPE", "text/html");
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata.iter().next(), Some(("CONTENT-TYPE", "text/html")));
    }

    #[test]
    fn test_control_keys_are_stripped() {
        let metadata: Metadata = [
            ("ETag", "00"),
            ("content-hash", "abc"),
            ("Sync-Conflict", "true"),
            ("Sync-Version", "3"),
            ("Owner", "ops"),
        ]
        .into_iter()
        .collect();

        let stripped = metadata.without_control_keys();
        assert_eq!(stripped.len(), 2);
        assert_eq!(stripped.get("Sync-Version"), Some("3"));
        assert_eq!(stripped.get("Owner"), Some("ops"));

        let user = metadata.user_entries();
        assert_eq!(user.len(), 1);
    }

    #[test]
    fn test_equality_ignores_order() {
        let a: Metadata = [("a", "1"), ("b", "2")].into_iter().collect();
        let b: Metadata = [("B", "2"), ("A", "1")].into_iter().collect();
        assert_eq!(a, b);
        assert_ne!(a, Metadata::new().with("a", "1"));
    }

    #[test]
    fn test_tombstone_flags() {
        let metadata = Metadata::new()
            .with(keys::SYNC_DELETED, "True")
            .with(keys::SYNC_RENAME, "new.bin");
        assert!(metadata.is_tombstone());
        assert_eq!(metadata.renamed_to(), Some("new.bin"));
        assert!(!Metadata::new().with(keys::SYNC_RENAME, "x").is_tombstone());
    }
}

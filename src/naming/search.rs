//! Bounded cache of formatted search results.
//!
//! Keys combine the caller and the pattern so a cached result can never
//! leak names across users with different visibility. Any mutation that
//! can change a result set (file creation or deletion, and every ACL
//! change, including approved access requests) clears the whole cache;
//! with 50 entries there is nothing to be gained from finer invalidation.

use moka::sync::Cache;

/// Maximum number of cached query results.
const CAPACITY: u64 = 50;

pub struct SearchCache {
    cache: Cache<String, String>,
}

impl SearchCache {
    pub fn new() -> Self {
        Self { cache: Cache::builder().max_capacity(CAPACITY).build() }
    }

    fn key(username: &str, pattern: &str) -> String {
        format!("{username}\u{1f}{pattern}")
    }

    /// Cached result for this user and pattern, refreshing its recency.
    pub fn get(&self, username: &str, pattern: &str) -> Option<String> {
        self.cache.get(&Self::key(username, pattern))
    }

    pub fn put(&self, username: &str, pattern: &str, result: String) {
        self.cache.insert(Self::key(username, pattern), result);
    }

    /// Drops every cached result.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

impl Default for SearchCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Pattern matching for SEARCH: exact matches win, then substring
/// matches, then case-insensitive substring matches.
pub fn match_names(names: &[String], pattern: &str) -> Vec<String> {
    let exact: Vec<String> = names.iter().filter(|n| *n == pattern).cloned().collect();
    if !exact.is_empty() {
        return exact;
    }
    let substring: Vec<String> =
        names.iter().filter(|n| n.contains(pattern)).cloned().collect();
    if !substring.is_empty() {
        return substring;
    }
    let lowered = pattern.to_lowercase();
    names.iter().filter(|n| n.to_lowercase().contains(&lowered)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_match_beats_substring() {
        let names = names(&["notes.txt", "notes.txt.old", "old-notes.txt"]);
        assert_eq!(match_names(&names, "notes.txt"), vec!["notes.txt"]);
    }

    #[test]
    fn substring_then_case_insensitive() {
        let names = names(&["Poem.txt", "draft.md"]);
        assert_eq!(match_names(&names, "poem"), vec!["Poem.txt"]);
        assert_eq!(match_names(&names, "draft"), vec!["draft.md"]);
        assert!(match_names(&names, "missing").is_empty());
    }

    #[test]
    fn cache_is_scoped_per_user() {
        let cache = SearchCache::new();
        cache.put("alice", "poem", "poem.txt".to_string());
        assert_eq!(cache.get("alice", "poem").as_deref(), Some("poem.txt"));
        assert_eq!(cache.get("bob", "poem"), None);
        cache.invalidate_all();
        assert_eq!(cache.get("alice", "poem"), None);
    }
}

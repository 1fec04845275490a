//! Package source mapping: which sources may answer for which packages.
//!
//! Patterns come from `<packageSourceMapping>` sections. Routing never
//! turns into a hard failure: when the mapping does not lead to any
//! available source, every source is eligible again.

use std::sync::Arc;

use serde::Serialize;

use crate::registries::Registry;

/// Patterns declared for one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingEntry {
    pub source: String,
    /// Lowercased patterns in declaration order
    pub patterns: Vec<String>,
}

/// Source name → patterns. An empty table means routing is disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingTable {
    entries: Vec<RoutingEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append patterns for a source, merging with patterns already known for
    /// it (source names compare case-insensitively).
    pub fn add_patterns<I, S>(&mut self, source: &str, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let index = match self
            .entries
            .iter()
            .position(|e| e.source.eq_ignore_ascii_case(source))
        {
            Some(index) => index,
            None => {
                self.entries.push(RoutingEntry {
                    source: source.to_string(),
                    patterns: Vec::new(),
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];
        for pattern in patterns {
            let pattern = pattern.as_ref().trim().to_lowercase();
            if !pattern.is_empty() && !entry.patterns.contains(&pattern) {
                entry.patterns.push(pattern);
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RoutingEntry] {
        &self.entries
    }

    pub fn patterns_for(&self, source: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|e| e.source.eq_ignore_ascii_case(source))
            .map(|e| e.patterns.as_slice())
    }

    /// Names of the sources with at least one pattern matching `package_id`.
    pub fn matching_sources(&self, package_id: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.patterns.iter().any(|p| matches_pattern(package_id, p)))
            .map(|e| e.source.as_str())
            .collect()
    }

    /// Narrow `clients` to the ones allowed to answer for `package_id`,
    /// preserving their priority order.
    ///
    /// Falls back to every client when routing is disabled, when no pattern
    /// matches, or when none of the matching sources is available.
    pub fn sources_for<R>(&self, package_id: &str, clients: &[Arc<R>]) -> Vec<Arc<R>>
    where
        R: Registry + ?Sized,
    {
        if !self.is_enabled() {
            return clients.to_vec();
        }

        let matched = self.matching_sources(package_id);
        if matched.is_empty() {
            tracing::debug!(
                "No source mapping matches {}, using all sources",
                package_id
            );
            return clients.to_vec();
        }

        let routed: Vec<Arc<R>> = clients
            .iter()
            .filter(|client| {
                let name = &client.source().name;
                matched.iter().any(|m| m.eq_ignore_ascii_case(name))
            })
            .cloned()
            .collect();

        if routed.is_empty() {
            tracing::warn!(
                "Sources mapped for {} ({}) are not available, using all sources",
                package_id,
                matched.join(", ")
            );
            return clients.to_vec();
        }

        routed
    }
}

/// Case-insensitive match of a package id against a mapping pattern.
///
/// `*` matches everything, a trailing `*` matches by prefix (`Foo.*` matches
/// `Foo.Bar` but not `FooExtra`), anything else must match exactly.
pub fn matches_pattern(package_id: &str, pattern: &str) -> bool {
    let id = package_id.to_lowercase();
    let pattern = pattern.trim().to_lowercase();

    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => id.starts_with(prefix),
        None => id == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registries::{PackageInfo, RegistryError};
    use crate::sources::Source;
    use async_trait::async_trait;

    struct Named(Source);

    #[async_trait]
    impl Registry for Named {
        fn source(&self) -> &Source {
            &self.0
        }

        async fn search_exact(&self, package_id: &str) -> Result<PackageInfo, RegistryError> {
            Err(RegistryError::NotFound(package_id.to_string()))
        }
    }

    fn client(name: &str) -> Arc<Named> {
        Arc::new(Named(Source::new(
            name,
            format!("https://{name}.example.com/v3/index.json"),
        )))
    }

    fn names(clients: &[Arc<Named>]) -> Vec<String> {
        clients.iter().map(|c| c.0.name.clone()).collect()
    }

    #[test]
    fn test_star_matches_everything() {
        assert!(matches_pattern("Any.Package", "*"));
        assert!(matches_pattern("", "*"));
    }

    #[test]
    fn test_prefix_pattern() {
        assert!(matches_pattern("Foo.Bar", "Foo.*"));
        assert!(matches_pattern("foo.bar", "FOO.*"));
        assert!(matches_pattern("FOO.BAR", "foo.*"));
        assert!(!matches_pattern("FooExtra", "Foo.*"));
        assert!(!matches_pattern("Foo", "Foo.*"));
    }

    #[test]
    fn test_exact_pattern() {
        assert!(matches_pattern("Newtonsoft.Json", "newtonsoft.json"));
        assert!(!matches_pattern("Newtonsoft.Json.Bson", "newtonsoft.json"));
    }

    #[test]
    fn test_disabled_routing_returns_all() {
        let table = RoutingTable::new();
        let clients = vec![client("nuget.org")];
        let routed = table.sources_for("Any.Package", &clients);
        assert_eq!(routed.len(), 1);
        assert!(Arc::ptr_eq(&routed[0], &clients[0]));
    }

    #[test]
    fn test_routes_to_matching_sources_in_priority_order() {
        let mut table = RoutingTable::new();
        table.add_patterns("nuget.org", ["*"]);
        table.add_patterns("contoso", ["Contoso.*"]);

        let clients = vec![client("contoso"), client("nuget.org"), client("other")];

        assert_eq!(
            names(&table.sources_for("Contoso.Core", &clients)),
            vec!["contoso", "nuget.org"]
        );
        assert_eq!(
            names(&table.sources_for("Serilog", &clients)),
            vec!["nuget.org"]
        );
    }

    #[test]
    fn test_no_match_falls_back_to_all() {
        let mut table = RoutingTable::new();
        table.add_patterns("contoso", ["Contoso.*"]);
        let clients = vec![client("contoso"), client("nuget.org")];
        assert_eq!(table.sources_for("Serilog", &clients).len(), 2);
    }

    #[test]
    fn test_unavailable_match_falls_back_to_all() {
        let mut table = RoutingTable::new();
        table.add_patterns("offline-feed", ["Contoso.*"]);
        let clients = vec![client("nuget.org")];
        assert_eq!(
            names(&table.sources_for("Contoso.Core", &clients)),
            vec!["nuget.org"]
        );
    }

    #[test]
    fn test_add_patterns_merges_case_insensitively() {
        let mut table = RoutingTable::new();
        table.add_patterns("Feed", ["A.*"]);
        table.add_patterns("feed", ["a.*", "B"]);
        assert_eq!(table.entries().len(), 1);
        assert_eq!(
            table.patterns_for("FEED").unwrap(),
            &["a.*".to_string(), "b".to_string()]
        );
        assert_eq!(table.matching_sources("b"), vec!["Feed"]);
    }
}

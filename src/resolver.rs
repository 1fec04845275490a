//! Resolving package ids across sources.
//!
//! Every package id is looked up independently: routed sources are tried in
//! priority order until one answers, then the answer is optionally enriched
//! with download counts and advisories from the public registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::registries::{PackageInfo, Registry, RegistryError};
use crate::routing::RoutingTable;

/// Default number of packages resolved at the same time
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Why a package could not be resolved
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Every source that was asked answered "not found"
    #[error("{0} was not found on any source")]
    NotFound(String),
    /// At least one source failed for another reason; this is the last such
    /// failure
    #[error("failed to resolve {package}: {source}")]
    Registry {
        package: String,
        #[source]
        source: RegistryError,
    },
    #[error("no source is available for {0}")]
    NoRoutedSources(String),
    /// The lookup task itself died before producing an answer
    #[error("resolution of {package} was aborted: {message}")]
    Task { package: String, message: String },
}

impl ResolveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResolveError::NotFound(_))
    }
}

pub type ResolveResults = HashMap<String, Result<PackageInfo, ResolveError>>;

pub struct Resolver {
    /// Highest priority first
    clients: Vec<Arc<dyn Registry>>,
    routing: RoutingTable,
    /// Public registry used to fill gaps in private answers
    supplemental: Option<Arc<dyn Registry>>,
    max_concurrent: usize,
}

impl Resolver {
    pub fn new(clients: Vec<Arc<dyn Registry>>, routing: RoutingTable) -> Self {
        Self {
            clients,
            routing,
            supplemental: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    pub fn with_supplemental(mut self, client: Arc<dyn Registry>) -> Self {
        self.supplemental = Some(client);
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn clients(&self) -> &[Arc<dyn Registry>] {
        &self.clients
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Resolve a single package id
    pub async fn resolve(&self, package_id: &str) -> Result<PackageInfo, ResolveError> {
        let routed = self.routing.sources_for(package_id, &self.clients);
        if routed.is_empty() {
            return Err(ResolveError::NoRoutedSources(package_id.to_string()));
        }

        let mut last_error: Option<RegistryError> = None;

        for client in &routed {
            match client.search_exact(package_id).await {
                Ok(mut info) => {
                    tracing::debug!("Resolved {} from {}", package_id, client.source().name);
                    self.enrich(&mut info, client.as_ref()).await;
                    return Ok(info);
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!("{} not found on {}", package_id, client.source().name);
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to fetch {} from {}: {}",
                        package_id,
                        client.source().name,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(source) => ResolveError::Registry {
                package: package_id.to_string(),
                source,
            },
            None => ResolveError::NotFound(package_id.to_string()),
        })
    }

    /// Fill download counts and advisories from the public registry when
    /// another source answered. Failures are ignored.
    async fn enrich(&self, info: &mut PackageInfo, winner: &dyn Registry) {
        let Some(public) = &self.supplemental else {
            return;
        };
        let public_url = &public.source().url;
        if winner.source().is_same_registry(public_url) {
            return;
        }

        match public.search_exact(&info.id).await {
            Ok(public_info) => info.merge_supplemental(&public_info, public_url),
            Err(e) => tracing::debug!(
                "No supplemental data for {} from {}: {}",
                info.id,
                public_url,
                e
            ),
        }
    }

    /// Resolve many package ids concurrently.
    ///
    /// Ids are de-duplicated case-insensitively (the first spelling is kept
    /// as the key). A failure for one id never affects the others.
    pub async fn resolve_all(self: &Arc<Self>, package_ids: &[String]) -> ResolveResults {
        let mut seen = HashSet::new();
        let distinct: Vec<String> = package_ids
            .iter()
            .filter(|id| seen.insert(id.to_lowercase()))
            .cloned()
            .collect();

        tracing::info!(
            "Resolving {} package(s) across {} source(s)",
            distinct.len(),
            self.clients.len()
        );

        let results: Arc<DashMap<String, Result<PackageInfo, ResolveError>>> =
            Arc::new(DashMap::new());
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        let handles: Vec<_> = distinct
            .into_iter()
            .map(|package_id| {
                let resolver = Arc::clone(self);
                let results = Arc::clone(&results);
                let permit = Arc::clone(&semaphore);
                let key = package_id.clone();
                let handle = tokio::spawn(async move {
                    let _permit = permit.acquire().await;
                    let result = resolver.resolve(&package_id).await;
                    results.insert(package_id, result);
                });
                (key, handle)
            })
            .collect();

        // Wait for all tasks to complete
        for (package_id, handle) in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Resolution task for {} failed: {}", package_id, e);
                results.insert(
                    package_id.clone(),
                    Err(ResolveError::Task {
                        package: package_id,
                        message: e.to_string(),
                    }),
                );
            }
        }

        match Arc::try_unwrap(results) {
            Ok(map) => map.into_iter().collect(),
            Err(shared) => {
                let keys: Vec<String> = shared.iter().map(|e| e.key().clone()).collect();
                keys.into_iter()
                    .filter_map(|key| shared.remove(&key))
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registries::{PackageVersionRecord, Vulnerability, VulnerabilitySeverity};
    use crate::sources::{NUGET_ORG_URL, Source};
    use crate::version::Version;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Answer(Vec<&'static str>),
        NotFound,
        Fail,
        Panic,
    }

    struct Fake {
        source: Source,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl Fake {
        fn new(name: &str, url: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                source: Source::new(name, url),
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Registry for Fake {
        fn source(&self) -> &Source {
            &self.source
        }

        async fn search_exact(&self, package_id: &str) -> Result<PackageInfo, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Answer(versions) => Ok(PackageInfo {
                    id: package_id.to_string(),
                    source: self.source.name.clone(),
                    versions: versions
                        .iter()
                        .map(|v| {
                            let mut record = PackageVersionRecord::new(Version::parse(v));
                            if self.source.url == NUGET_ORG_URL {
                                record.download_count = Some(42);
                                record.vulnerabilities = vec![Vulnerability {
                                    advisory_url: "https://github.com/advisories/GHSA-1".to_string(),
                                    severity: VulnerabilitySeverity::Critical,
                                }];
                            }
                            record
                        })
                        .collect(),
                    total_downloads: (self.source.url == NUGET_ORG_URL).then_some(1000),
                    ..Default::default()
                }),
                Behavior::NotFound => Err(RegistryError::NotFound(package_id.to_string())),
                Behavior::Fail => Err(RegistryError::Status {
                    url: self.source.url.clone(),
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                }),
                Behavior::Panic => panic!("registry client crashed"),
            }
        }
    }

    fn as_dyn(clients: &[&Arc<Fake>]) -> Vec<Arc<dyn Registry>> {
        clients
            .iter()
            .map(|c| Arc::clone(*c) as Arc<dyn Registry>)
            .collect()
    }

    #[tokio::test]
    async fn test_falls_through_to_next_source() {
        let first = Fake::new("first", "https://first/v3/index.json", Behavior::NotFound);
        let second = Fake::new("second", "https://second/v3/index.json", Behavior::Answer(vec!["1.0.0"]));
        let resolver = Resolver::new(as_dyn(&[&first, &second]), RoutingTable::new());

        let info = resolver.resolve("Pkg").await.unwrap();
        assert_eq!(info.source, "second");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_success_stops_lookup() {
        let first = Fake::new("first", "https://first/v3/index.json", Behavior::Answer(vec!["1.0.0"]));
        let second = Fake::new("second", "https://second/v3/index.json", Behavior::Answer(vec!["2.0.0"]));
        let resolver = Resolver::new(as_dyn(&[&first, &second]), RoutingTable::new());

        let info = resolver.resolve("Pkg").await.unwrap();
        assert_eq!(info.source, "first");
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_not_found() {
        let first = Fake::new("first", "https://first/v3/index.json", Behavior::NotFound);
        let resolver = Resolver::new(as_dyn(&[&first]), RoutingTable::new());
        let err = resolver.resolve("Missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_transport_error_wins_over_not_found() {
        let failing = Fake::new("failing", "https://failing/v3/index.json", Behavior::Fail);
        let missing = Fake::new("missing", "https://missing/v3/index.json", Behavior::NotFound);
        let resolver = Resolver::new(as_dyn(&[&failing, &missing]), RoutingTable::new());
        let err = resolver.resolve("Pkg").await.unwrap_err();
        assert!(matches!(err, ResolveError::Registry { .. }));
    }

    #[tokio::test]
    async fn test_routing_restricts_sources() {
        let private = Fake::new("private", "https://private/v3/index.json", Behavior::Answer(vec!["1.0.0"]));
        let public = Fake::new("nuget.org", NUGET_ORG_URL, Behavior::Answer(vec!["9.0.0"]));
        let mut routing = RoutingTable::new();
        routing.add_patterns("nuget.org", ["*"]);
        routing.add_patterns("private", ["Contoso.*"]);

        let resolver = Resolver::new(as_dyn(&[&private, &public]), routing);
        let info = resolver.resolve("Serilog").await.unwrap();
        assert_eq!(info.source, "nuget.org");
        assert_eq!(private.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_supplemental_enrichment() {
        let private = Fake::new("private", "https://private/v3/index.json", Behavior::Answer(vec!["1.0.0"]));
        let public = Fake::new("nuget.org", NUGET_ORG_URL, Behavior::Answer(vec!["1.0.0"]));

        let resolver = Resolver::new(as_dyn(&[&private]), RoutingTable::new())
            .with_supplemental(Arc::clone(&public) as Arc<dyn Registry>);
        let info = resolver.resolve("Pkg").await.unwrap();

        assert_eq!(info.source, "private");
        assert_eq!(info.total_downloads, Some(1000));
        assert_eq!(info.versions[0].download_count, Some(42));
        assert!(info.versions[0].is_vulnerable());
        assert_eq!(info.supplemental_registry_url.as_deref(), Some(NUGET_ORG_URL));
    }

    #[tokio::test]
    async fn test_no_enrichment_when_public_answered() {
        let public = Fake::new("nuget.org", NUGET_ORG_URL, Behavior::Answer(vec!["1.0.0"]));
        let resolver = Resolver::new(as_dyn(&[&public]), RoutingTable::new())
            .with_supplemental(Arc::clone(&public) as Arc<dyn Registry>);

        let info = resolver.resolve("Pkg").await.unwrap();
        assert!(info.supplemental_registry_url.is_none());
        assert_eq!(public.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_all_is_keyed_and_independent() {
        let feed = Fake::new("feed", "https://feed/v3/index.json", Behavior::Answer(vec!["1.0.0"]));
        let resolver = Arc::new(
            Resolver::new(as_dyn(&[&feed]), RoutingTable::new()).with_max_concurrent(2),
        );

        let ids = vec![
            "A".to_string(),
            "B".to_string(),
            "a".to_string(),
            "C".to_string(),
        ];
        let results = resolver.resolve_all(&ids).await;

        assert_eq!(results.len(), 3);
        assert!(results["A"].is_ok());
        assert!(results["B"].is_ok());
        assert!(results["C"].is_ok());
        assert_eq!(feed.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_resolve_all_reports_crashed_task() {
        let crashing = Fake::new("crashing", "https://crashing/v3/index.json", Behavior::Panic);
        let healthy = Fake::new("healthy", "https://healthy/v3/index.json", Behavior::Answer(vec!["1.0.0"]));
        let mut routing = RoutingTable::new();
        routing.add_patterns("crashing", ["Broken.*"]);
        routing.add_patterns("healthy", ["Good.*"]);
        let resolver = Arc::new(Resolver::new(as_dyn(&[&crashing, &healthy]), routing));

        let ids = vec!["Broken.Pkg".to_string(), "Good.Pkg".to_string()];
        let results = resolver.resolve_all(&ids).await;

        assert_eq!(results.len(), 2);
        assert!(results["Good.Pkg"].is_ok());
        assert!(matches!(
            &results["Broken.Pkg"],
            Err(ResolveError::Task { package, .. }) if package == "Broken.Pkg"
        ));
    }

    #[tokio::test]
    async fn test_resolve_all_empty() {
        let resolver = Arc::new(Resolver::new(Vec::new(), RoutingTable::new()));
        assert!(resolver.resolve_all(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn test_no_clients() {
        let resolver = Resolver::new(Vec::new(), RoutingTable::new());
        let err = resolver.resolve("Pkg").await.unwrap_err();
        assert!(matches!(err, ResolveError::NoRoutedSources(_)));
    }
}

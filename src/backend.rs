//! Wiring: configuration, sources, credential providers and registry
//! clients assembled into a ready-to-use [`Resolver`].

use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;

use crate::auth::providers::{CredentialBroker, DiscoveryEnv};
use crate::config::Config;
use crate::framework::Framework;
use crate::registries::http_client::create_shared_client;
use crate::registries::nuget::{NuGetRegistry, SearchResponse};
use crate::registries::transport::AuthenticatedTransport;
use crate::registries::{PackageInfo, Registry, RegistryError, VulnerabilitySeverity};
use crate::resolver::{ResolveResults, Resolver};
use crate::sources::{NUGET_ORG_NAME, Source, SourceConfigResolver, SourceSet};

pub struct Backend {
    config: Config,
    sources: SourceSet,
    broker: Arc<CredentialBroker>,
    registries: Vec<Arc<NuGetRegistry>>,
    resolver: Arc<Resolver>,
}

impl Backend {
    /// Discover sources from `start_dir` and plugins from the process
    /// environment, then connect to every source.
    pub async fn initialize(config: Config, start_dir: &Path) -> anyhow::Result<Self> {
        let sources = SourceConfigResolver::from_process().resolve(start_dir)?;
        let broker = CredentialBroker::discover(&DiscoveryEnv::from_process(), &config.credentials);
        Self::initialize_with(config, sources, broker).await
    }

    /// Connect to already discovered sources.
    ///
    /// Sources whose service index cannot be read are skipped with a warning;
    /// having no usable source at all is an error.
    pub async fn initialize_with(
        config: Config,
        sources: SourceSet,
        broker: CredentialBroker,
    ) -> anyhow::Result<Self> {
        let client = create_shared_client(&config.http)?;
        let broker = Arc::new(broker);
        let transport_broker = (!broker.is_empty()).then(|| Arc::clone(&broker));

        let connects = sources.sources.iter().cloned().map(|source| {
            let transport =
                AuthenticatedTransport::new(Arc::clone(&client), &source, transport_broker.clone());
            NuGetRegistry::connect(source, transport)
        });
        let results = join_all(connects).await;

        let mut registries = Vec::new();
        for (source, result) in sources.sources.iter().zip(results) {
            match result {
                Ok(registry) => registries.push(Arc::new(registry)),
                Err(e) => tracing::warn!("Skipping source {} ({}): {}", source.name, source.url, e),
            }
        }

        if registries.is_empty() {
            anyhow::bail!(
                "No usable package sources ({} configured)",
                sources.sources.len()
            );
        }
        tracing::info!(
            "Connected to {} of {} package source(s)",
            registries.len(),
            sources.sources.len()
        );

        let clients: Vec<Arc<dyn Registry>> = registries
            .iter()
            .map(|r| Arc::clone(r) as Arc<dyn Registry>)
            .collect();
        let mut resolver = Resolver::new(clients, sources.routing.clone())
            .with_max_concurrent(config.resolver.max_concurrent);

        if config.resolver.enrich_from_public
            && let Some(public) = connect_public(&config, &registries, &client).await
        {
            resolver = resolver.with_supplemental(public);
        }

        Ok(Self {
            config,
            sources,
            broker,
            registries,
            resolver: Arc::new(resolver),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sources(&self) -> &SourceSet {
        &self.sources
    }

    pub fn broker(&self) -> &CredentialBroker {
        &self.broker
    }

    /// Connected clients, highest priority first
    pub fn registries(&self) -> &[Arc<NuGetRegistry>] {
        &self.registries
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub async fn resolve(&self, package_ids: &[String]) -> ResolveResults {
        self.resolver.resolve_all(package_ids).await
    }

    /// Run a free-text search on every source that supports it
    pub async fn search(
        &self,
        query: &str,
        take: usize,
    ) -> Vec<(String, Result<SearchResponse, RegistryError>)> {
        let searches = self
            .registries
            .iter()
            .filter(|r| r.endpoints().search.is_some())
            .map(|registry| async move {
                (
                    registry.source().name.clone(),
                    registry.search(query, take).await,
                )
            });
        join_all(searches).await
    }
}

/// Client for the public registry used for enrichment. Reuses the connected
/// client when the public registry is one of the configured sources.
async fn connect_public(
    config: &Config,
    registries: &[Arc<NuGetRegistry>],
    client: &Arc<reqwest::Client>,
) -> Option<Arc<dyn Registry>> {
    let public_url = &config.resolver.public_registry_url;

    if let Some(existing) = registries
        .iter()
        .find(|r| r.source().is_same_registry(public_url))
    {
        return Some(Arc::clone(existing) as Arc<dyn Registry>);
    }

    let source = Source::new(NUGET_ORG_NAME, public_url.as_str());
    let transport = AuthenticatedTransport::new(Arc::clone(client), &source, None);
    match NuGetRegistry::connect(source, transport).await {
        Ok(registry) => Some(Arc::new(registry) as Arc<dyn Registry>),
        Err(e) => {
            tracing::warn!("Public registry {} unavailable for enrichment: {}", public_url, e);
            None
        }
    }
}

/// What a caller usually wants to know about a resolved package
#[derive(Debug, Clone, Serialize)]
pub struct PackageSummary {
    pub id: String,
    pub source: String,
    pub latest: Option<String>,
    pub latest_stable: Option<String>,
    /// Newest stable version every requested framework can consume
    pub latest_compatible: Option<String>,
    pub deprecated: bool,
    pub alternate_package_id: Option<String>,
    pub total_downloads: Option<u64>,
    /// Advisories on the newest compatible (or newest stable) version at or
    /// above the configured severity
    pub vulnerabilities: Vec<String>,
}

pub fn summarize(
    info: &PackageInfo,
    frameworks: &[Framework],
    min_severity: VulnerabilitySeverity,
) -> PackageSummary {
    let compatible = info.latest_stable_for(frameworks);
    let reference = compatible.or_else(|| info.latest_stable());

    PackageSummary {
        id: info.id.clone(),
        source: info.source.clone(),
        latest: info.latest().map(|r| r.version.to_string()),
        latest_stable: info.latest_stable().map(|r| r.version.to_string()),
        latest_compatible: compatible.map(|r| r.version.to_string()),
        deprecated: info.deprecated,
        alternate_package_id: info.alternate_package_id.clone(),
        total_downloads: info.total_downloads,
        vulnerabilities: reference
            .map(|r| {
                r.vulnerabilities
                    .iter()
                    .filter(|v| v.severity.meets_threshold(&min_severity))
                    .map(|v| format!("{} ({})", v.advisory_url, v.severity.as_str()))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

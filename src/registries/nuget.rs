//! Client for NuGet v3 package sources
//!
//! A source is described by its service index, which lists the resources it
//! offers. Package metadata comes from the registration resource (paged
//! `index.json` per package id); download counts and the verified flag only
//! exist in search results and are fetched best-effort.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use super::transport::AuthenticatedTransport;
use super::{
    DependencyGroup, PackageDependency, PackageInfo, PackageVersionRecord, Registry,
    RegistryError, Vulnerability, VulnerabilitySeverity,
};
use crate::framework::{Framework, normalize_target_framework};
use crate::sources::Source;
use crate::version::Version;

const SEARCH_TYPE: &str = "SearchQueryService";
const REGISTRATION_TYPE: &str = "RegistrationsBaseUrl";

/// Resources used from a source's service index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoints {
    /// Always ends with `/`
    pub registration_base: String,
    pub search: Option<String>,
}

/// Client for one NuGet v3 source
pub struct NuGetRegistry {
    source: Source,
    transport: AuthenticatedTransport,
    endpoints: Endpoints,
}

// Service index
#[derive(Debug, Deserialize)]
pub struct ServiceIndex {
    #[serde(default)]
    pub resources: Vec<ServiceResource>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceResource {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type", deserialize_with = "one_or_many")]
    pub types: Vec<String>,
}

// Registration index and pages
#[derive(Debug, Deserialize)]
struct RegistrationIndex {
    #[serde(default)]
    items: Vec<RegistrationPage>,
}

#[derive(Debug, Deserialize)]
struct RegistrationPage {
    #[serde(rename = "@id")]
    id: String,
    items: Option<Vec<RegistrationLeaf>>,
}

#[derive(Debug, Deserialize)]
struct RegistrationLeaf {
    #[serde(rename = "catalogEntry")]
    catalog_entry: CatalogRef,
}

/// Some servers link the catalog entry instead of inlining it
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogRef {
    Entry(Box<CatalogEntry>),
    Link(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
    #[serde(default)]
    id: Option<String>,
    version: String,
    description: Option<String>,
    #[serde(default, deserialize_with = "list_or_csv")]
    authors: Vec<String>,
    #[serde(default, deserialize_with = "list_or_csv")]
    tags: Vec<String>,
    project_url: Option<String>,
    listed: Option<bool>,
    published: Option<String>,
    #[serde(default)]
    dependency_groups: Vec<CatalogDependencyGroup>,
    #[serde(default)]
    vulnerabilities: Vec<CatalogVulnerability>,
    deprecation: Option<CatalogDeprecation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogDependencyGroup {
    target_framework: Option<String>,
    #[serde(default)]
    dependencies: Vec<CatalogDependency>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogDependency {
    id: String,
    range: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogVulnerability {
    advisory_url: String,
    #[serde(deserialize_with = "string_or_number")]
    severity: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogDeprecation {
    message: Option<String>,
    alternate_package: Option<AlternatePackage>,
}

#[derive(Debug, Clone, Deserialize)]
struct AlternatePackage {
    id: String,
}

/// Search response
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_hits: u64,
    #[serde(default)]
    pub data: Vec<SearchResult>,
}

/// One package in a search response
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "list_or_csv")]
    pub authors: Vec<String>,
    #[serde(default, deserialize_with = "list_or_csv")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub total_downloads: Option<u64>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub project_url: Option<String>,
    #[serde(default)]
    pub versions: Vec<SearchVersion>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchVersion {
    pub version: String,
    #[serde(default)]
    pub downloads: Option<u64>,
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

/// `"a, b"` or `["a", "b"]`
fn list_or_csv<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrCsv {
        Csv(String),
        List(Vec<String>),
        Null(()),
    }
    let values = match ListOrCsv::deserialize(deserializer)? {
        ListOrCsv::Csv(value) => value.split(',').map(str::to_string).collect(),
        ListOrCsv::List(values) => values,
        ListOrCsv::Null(()) => Vec::new(),
    };
    Ok(values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect())
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

/// `totalHits` arrives as a number from most servers and as a string from some
fn lenient_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

/// Pick the registration and search resources from a service index.
///
/// When a type is offered in several versions (`RegistrationsBaseUrl/3.6.0`,
/// `RegistrationsBaseUrl/3.0.0-rc`, ...) the highest version suffix wins.
pub fn select_endpoints(index: &ServiceIndex, source_url: &str) -> Result<Endpoints, RegistryError> {
    let registration = best_resource(index, REGISTRATION_TYPE).ok_or_else(|| {
        RegistryError::MissingCapability {
            source_url: source_url.to_string(),
            capability: REGISTRATION_TYPE,
        }
    })?;

    let search = best_resource(index, SEARCH_TYPE);
    if search.is_none() {
        tracing::warn!(
            "{} has no {} resource, search is unavailable",
            source_url,
            SEARCH_TYPE
        );
    }

    let registration_base = if registration.ends_with('/') {
        registration
    } else {
        format!("{registration}/")
    };

    Ok(Endpoints {
        registration_base,
        search,
    })
}

fn best_resource(index: &ServiceIndex, kind: &str) -> Option<String> {
    index
        .resources
        .iter()
        .flat_map(|resource| {
            resource
                .types
                .iter()
                .filter_map(move |t| type_version(t, kind))
                .map(move |version| (version, resource.id.as_str()))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, id)| id.to_string())
}

/// Version suffix of `resource_type` when it is `kind` or `kind/<version>`
fn type_version(resource_type: &str, kind: &str) -> Option<Version> {
    let rest = resource_type.strip_prefix(kind)?;
    if rest.is_empty() {
        return Some(Version::default());
    }
    rest.strip_prefix('/').map(Version::parse)
}

fn parse_published(value: Option<&str>) -> Option<DateTime<Utc>> {
    let published = DateTime::parse_from_rfc3339(value?)
        .ok()?
        .with_timezone(&Utc);
    // Unlisted packages are published "1900-01-01"
    (published.year() > 1900).then_some(published)
}

impl CatalogEntry {
    fn to_record(&self) -> PackageVersionRecord {
        let mut record = PackageVersionRecord::new(Version::parse(&self.version));
        record.published = parse_published(self.published.as_deref());

        for group in &self.dependency_groups {
            let target = normalize_target_framework(group.target_framework.as_deref().unwrap_or(""));
            let framework = Framework::parse(&target);
            if !record.supported_frameworks.contains(&framework) {
                record.supported_frameworks.push(framework);
            }
            record.dependency_groups.push(DependencyGroup {
                target_framework: target,
                dependencies: group
                    .dependencies
                    .iter()
                    .map(|d| PackageDependency {
                        id: d.id.clone(),
                        range: d.range.clone(),
                    })
                    .collect(),
            });
        }

        record.vulnerabilities = self
            .vulnerabilities
            .iter()
            .map(|v| Vulnerability {
                advisory_url: v.advisory_url.clone(),
                severity: VulnerabilitySeverity::from_str_loose(&v.severity),
            })
            .collect();

        record
    }
}

impl NuGetRegistry {
    /// Resolve the endpoints of `source` and build a client for it.
    pub async fn connect(
        source: Source,
        transport: AuthenticatedTransport,
    ) -> Result<Self, RegistryError> {
        let endpoints = resolve_endpoints(&transport, &source.url).await?;
        tracing::debug!(
            "{}: registrations at {}, search {}",
            source.name,
            endpoints.registration_base,
            endpoints.search.as_deref().unwrap_or("unavailable")
        );
        Ok(Self {
            source,
            transport,
            endpoints,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn transport(&self) -> &AuthenticatedTransport {
        &self.transport
    }

    /// Free-text search
    pub async fn search(&self, query: &str, take: usize) -> Result<SearchResponse, RegistryError> {
        let Some(search) = &self.endpoints.search else {
            return Err(RegistryError::SearchUnavailable(self.source.name.clone()));
        };

        let mut url = url::Url::parse(search)?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("take", &take.to_string())
            .append_pair("prerelease", "true")
            .append_pair("semVerLevel", "2.0.0");

        get_json(&self.transport, url.as_str()).await
    }

    /// Download counts and the verified flag for one package id
    async fn search_package(&self, package_id: &str) -> Result<Option<SearchResult>, RegistryError> {
        let response = self.search(&format!("packageid:{package_id}"), 1).await?;
        Ok(response
            .data
            .into_iter()
            .find(|r| r.id.eq_ignore_ascii_case(package_id)))
    }

    async fn fetch_entries(&self, package_id: &str) -> Result<Vec<CatalogEntry>, RegistryError> {
        let url = format!(
            "{}{}/index.json",
            self.endpoints.registration_base,
            package_id.to_lowercase()
        );

        let response = self.transport.get(&url).await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(package_id.to_string()));
        }
        if !status.is_success() {
            return Err(RegistryError::Status { url, status });
        }
        let bytes = response.bytes().await?;
        let index: RegistrationIndex =
            serde_json::from_slice(&bytes).map_err(|source| RegistryError::Decode {
                url: url.clone(),
                source,
            })?;

        let mut entries = Vec::new();
        for page in index.items {
            let leaves = match page.items {
                Some(items) => items,
                None => {
                    let page: RegistrationPage = get_json(&self.transport, &page.id).await?;
                    page.items.unwrap_or_default()
                }
            };
            for leaf in leaves {
                match leaf.catalog_entry {
                    CatalogRef::Entry(entry) => entries.push(*entry),
                    CatalogRef::Link(link) => {
                        tracing::debug!("Skipping non-inlined catalog entry {}", link)
                    }
                }
            }
        }

        Ok(entries)
    }
}

/// Fetch the service index at `source_url` and pick the endpoints to use
pub async fn resolve_endpoints(
    transport: &AuthenticatedTransport,
    source_url: &str,
) -> Result<Endpoints, RegistryError> {
    let index: ServiceIndex = get_json(transport, source_url).await?;
    select_endpoints(&index, source_url)
}

async fn get_json<T: DeserializeOwned>(
    transport: &AuthenticatedTransport,
    url: &str,
) -> Result<T, RegistryError> {
    let response = transport.get(url).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(RegistryError::Status {
            url: url.to_string(),
            status,
        });
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|source| RegistryError::Decode {
        url: url.to_string(),
        source,
    })
}

/// Assemble package metadata from the listed catalog entries of one package
fn build_package_info(package_id: &str, source: &str, entries: Vec<CatalogEntry>) -> Option<PackageInfo> {
    let mut listed: Vec<CatalogEntry> = entries
        .into_iter()
        .filter(|e| e.listed.unwrap_or(true))
        .collect();
    if listed.is_empty() {
        return None;
    }

    let mut records: Vec<PackageVersionRecord> = listed.iter().map(CatalogEntry::to_record).collect();
    records.sort_by(|a, b| b.version.cmp(&a.version));
    records.dedup_by(|a, b| a.version == b.version);

    listed.sort_by_cached_key(|e| std::cmp::Reverse(Version::parse(&e.version)));
    let newest = &listed[0];
    let metadata = listed
        .iter()
        .find(|e| !Version::parse(&e.version).is_prerelease())
        .unwrap_or(newest);

    Some(PackageInfo {
        id: metadata.id.clone().unwrap_or_else(|| package_id.to_string()),
        source: source.to_string(),
        description: metadata.description.clone(),
        authors: metadata.authors.iter().cloned().collect::<BTreeSet<_>>(),
        tags: metadata.tags.iter().cloned().collect::<BTreeSet<_>>(),
        total_downloads: None,
        verified: false,
        project_url: metadata.project_url.clone().filter(|u| !u.is_empty()),
        deprecated: metadata.deprecation.is_some(),
        deprecation_message: metadata.deprecation.as_ref().and_then(|d| d.message.clone()),
        alternate_package_id: metadata
            .deprecation
            .as_ref()
            .and_then(|d| d.alternate_package.as_ref())
            .map(|a| a.id.clone()),
        versions: records,
        supplemental_registry_url: None,
    })
}

fn apply_search_result(info: &mut PackageInfo, result: &SearchResult) {
    info.total_downloads = result.total_downloads;
    info.verified = result.verified;
    if info.project_url.is_none() {
        info.project_url = result.project_url.clone().filter(|u| !u.is_empty());
    }
    for record in &mut info.versions {
        record.download_count = result
            .versions
            .iter()
            .find(|v| Version::parse(&v.version) == record.version)
            .and_then(|v| v.downloads);
    }
}

#[async_trait]
impl Registry for NuGetRegistry {
    fn source(&self) -> &Source {
        &self.source
    }

    async fn search_exact(&self, package_id: &str) -> Result<PackageInfo, RegistryError> {
        let entries = self.fetch_entries(package_id).await?;
        let mut info = build_package_info(package_id, &self.source.name, entries)
            .ok_or_else(|| RegistryError::NotFound(package_id.to_string()))?;

        if self.endpoints.search.is_some() {
            match self.search_package(package_id).await {
                Ok(Some(result)) => apply_search_result(&mut info, &result),
                Ok(None) => tracing::debug!("{} not in {} search results", package_id, self.source.name),
                Err(e) => tracing::debug!(
                    "Download counts for {} from {} unavailable: {}",
                    package_id,
                    self.source.name,
                    e
                ),
            }
        }

        Ok(info)
    }
}

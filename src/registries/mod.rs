//! Registry clients and the package metadata they produce

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::framework::{Framework, satisfies_all};
use crate::sources::Source;
use crate::version::Version;

pub mod http_client;
pub mod nuget;
pub mod transport;

/// Errors from talking to one registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry answered 404 for this package
    #[error("package {0} was not found")]
    NotFound(String),
    /// Any other non-success status
    #[error("{url} returned {status}")]
    Status { url: String, status: StatusCode },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The service index lacks a resource the operation needs
    #[error("{source_url} does not advertise a {capability} resource")]
    MissingCapability {
        source_url: String,
        capability: &'static str,
    },
    #[error("{0} has no search endpoint")]
    SearchUnavailable(String),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

/// Trait for registry clients
#[async_trait]
pub trait Registry: Send + Sync {
    /// The source this client talks to
    fn source(&self) -> &Source;

    /// Fetch complete metadata for one package id
    async fn search_exact(&self, package_id: &str) -> Result<PackageInfo, RegistryError>;
}

/// Vulnerability severity levels, as published in registration metadata
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VulnerabilitySeverity {
    Low,
    Moderate,
    High,
    Critical,
}

impl VulnerabilitySeverity {
    /// Get numeric rank for severity comparison (higher = more severe)
    pub fn rank(&self) -> u8 {
        match self {
            VulnerabilitySeverity::Low => 1,
            VulnerabilitySeverity::Moderate => 2,
            VulnerabilitySeverity::High => 3,
            VulnerabilitySeverity::Critical => 4,
        }
    }

    /// Check if this severity meets or exceeds a minimum threshold
    pub fn meets_threshold(&self, min: &Self) -> bool {
        self.rank() >= min.rank()
    }

    /// Parse severity from a registry value.
    ///
    /// Registration metadata encodes severity as `"0"`..`"3"`; names are
    /// accepted too (case-insensitive). Unknown values default to `Low`.
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "3" | "critical" => VulnerabilitySeverity::Critical,
            "2" | "high" => VulnerabilitySeverity::High,
            "1" | "moderate" | "medium" => VulnerabilitySeverity::Moderate,
            _ => VulnerabilitySeverity::Low,
        }
    }

    /// Get lowercase string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            VulnerabilitySeverity::Low => "low",
            VulnerabilitySeverity::Moderate => "moderate",
            VulnerabilitySeverity::High => "high",
            VulnerabilitySeverity::Critical => "critical",
        }
    }
}

/// A security advisory attached to a package version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vulnerability {
    pub advisory_url: String,
    pub severity: VulnerabilitySeverity,
}

/// A dependency declared by a package version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageDependency {
    pub id: String,
    /// Version range as published (e.g. `[1.0.0, )`)
    pub range: Option<String>,
}

/// Dependencies of a package version for one target framework
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyGroup {
    /// Short moniker, `any` when the group is framework-agnostic
    pub target_framework: String,
    pub dependencies: Vec<PackageDependency>,
}

/// One listed version of a package on one source
#[derive(Debug, Clone, Serialize)]
pub struct PackageVersionRecord {
    pub version: Version,
    pub download_count: Option<u64>,
    pub supported_frameworks: Vec<Framework>,
    pub vulnerabilities: Vec<Vulnerability>,
    pub dependency_groups: Vec<DependencyGroup>,
    pub published: Option<DateTime<Utc>>,
}

impl PackageVersionRecord {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            download_count: None,
            supported_frameworks: Vec::new(),
            vulnerabilities: Vec::new(),
            dependency_groups: Vec::new(),
            published: None,
        }
    }

    pub fn is_vulnerable(&self) -> bool {
        !self.vulnerabilities.is_empty()
    }

    /// Whether every project framework can consume this version
    pub fn supports(&self, project: &[Framework]) -> bool {
        satisfies_all(project, &self.supported_frameworks)
    }
}

/// Everything known about a package, as answered by one source
#[derive(Debug, Clone, Default, Serialize)]
pub struct PackageInfo {
    pub id: String,
    /// Name of the source that answered
    pub source: String,
    pub description: Option<String>,
    pub authors: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub total_downloads: Option<u64>,
    pub verified: bool,
    pub project_url: Option<String>,
    pub deprecated: bool,
    pub deprecation_message: Option<String>,
    pub alternate_package_id: Option<String>,
    /// Newest first, no duplicates
    pub versions: Vec<PackageVersionRecord>,
    /// Public registry the download/advisory data was supplemented from
    pub supplemental_registry_url: Option<String>,
}

impl PackageInfo {
    /// Newest version overall
    pub fn latest(&self) -> Option<&PackageVersionRecord> {
        self.versions.first()
    }

    /// Newest version without a pre-release label
    pub fn latest_stable(&self) -> Option<&PackageVersionRecord> {
        self.versions.iter().find(|r| !r.version.is_prerelease())
    }

    /// Newest stable version every project framework can consume
    pub fn latest_stable_for(&self, project: &[Framework]) -> Option<&PackageVersionRecord> {
        self.versions
            .iter()
            .find(|r| !r.version.is_prerelease() && r.supports(project))
    }

    /// Newest pre-release that is newer than the newest stable version
    pub fn latest_prerelease(&self) -> Option<&PackageVersionRecord> {
        self.versions
            .iter()
            .take_while(|r| r.version.is_prerelease())
            .next()
    }

    pub fn find_version(&self, version: &Version) -> Option<&PackageVersionRecord> {
        self.versions.iter().find(|r| &r.version == version)
    }

    /// Fill gaps in this record with data from the public registry.
    ///
    /// Values already present are never overwritten.
    pub fn merge_supplemental(&mut self, public: &PackageInfo, registry_url: &str) {
        for record in &mut self.versions {
            let Some(other) = public.find_version(&record.version) else {
                continue;
            };
            if record.vulnerabilities.is_empty() {
                record.vulnerabilities = other.vulnerabilities.clone();
            }
            if record.download_count.is_none() {
                record.download_count = other.download_count;
            }
        }

        if self.total_downloads.is_none() {
            self.total_downloads = public.total_downloads;
        }
        if !self.verified {
            self.verified = public.verified;
        }
        if self.project_url.is_none() {
            self.project_url = public.project_url.clone();
        }
        self.supplemental_registry_url = Some(registry_url.to_string());
    }
}

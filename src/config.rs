//! Configuration management for feedscout

use std::path::Path;

use serde::Deserialize;

use crate::sources::NUGET_ORG_URL;

/// Default request timeout (30 seconds)
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default number of packages resolved at the same time
const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Default time a credential provider gets to answer (10 seconds)
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;

/// Resolver configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP client configuration
    pub http: HttpConfig,
    /// Package resolution configuration
    pub resolver: ResolverConfig,
    /// Credential provider configuration
    pub credentials: CredentialsConfig,
    /// Output configuration
    pub report: ReportConfig,
}

/// HTTP client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Total request timeout in seconds
    pub timeout_secs: u64,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Overrides the default `feedscout/<version>` user agent
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            user_agent: None,
        }
    }
}

/// Package resolution configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Maximum number of packages resolved concurrently
    pub max_concurrent: usize,
    /// Fill download counts and advisories from the public registry when a
    /// private source answered
    pub enrich_from_public: bool,
    /// Service index of the public registry
    pub public_registry_url: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            enrich_from_public: true,
            public_registry_url: NUGET_ORG_URL.to_string(),
        }
    }
}

/// Credential provider configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Discover and run credential provider plugins on 401
    pub providers_enabled: bool,
    /// Seconds a single provider may take before it is abandoned
    pub provider_timeout_secs: u64,
    /// Forbid providers from prompting the user
    pub non_interactive: bool,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            providers_enabled: true,
            provider_timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
            non_interactive: true,
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Minimum severity level to report ("low", "moderate", "high", "critical")
    pub min_severity: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            min_severity: "low".to_string(),
        }
    }
}

impl ReportConfig {
    /// Parse minimum severity level to VulnerabilitySeverity
    pub fn min_severity_level(&self) -> crate::registries::VulnerabilitySeverity {
        crate::registries::VulnerabilitySeverity::from_str_loose(&self.min_severity)
    }
}

impl Config {
    /// Parse configuration from a JSON value
    pub fn from_json(options: Option<serde_json::Value>) -> Self {
        match options {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("Invalid configuration, using defaults: {}", e);
                Self::default()
            }),
            None => Self::default(),
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Self {
        toml::from_str(content).unwrap_or_else(|e| {
            tracing::warn!("Invalid configuration, using defaults: {}", e);
            Self::default()
        })
    }

    /// Load a TOML configuration file.
    ///
    /// A missing file is not an error; a file that cannot be read is.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content))
    }

    /// Default location: `<config dir>/feedscout/config.toml`
    pub fn default_path() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|dir| dir.join("feedscout").join("config.toml"))
    }
}

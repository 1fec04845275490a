//! Package source discovery.
//!
//! Sources come from the layered `NuGet.Config` hierarchy: every directory
//! from the start directory up to the filesystem root, then the user-profile
//! config, then the machine-wide config. Nearer files win. A `<clear/>` inside
//! `<packageSources>` ends the walk after the directory that declared it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::auth::Credential;
use crate::auth::credential_store::CredentialStore;
use crate::routing::RoutingTable;

pub mod nuget_config;
pub mod props;

/// Name of the public registry
pub const NUGET_ORG_NAME: &str = "nuget.org";

/// Service index of the public registry
pub const NUGET_ORG_URL: &str = "https://api.nuget.org/v3/index.json";

/// Config file names read in every directory, in this order
const CONFIG_FILE_NAMES: [&str; 3] = ["nuget.config", "NuGet.Config", ".nuget/NuGet.Config"];

const PROPS_FILE_NAME: &str = "Directory.Build.props";

/// A package source
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub name: String,
    /// Service index URL
    pub url: String,
    #[serde(skip)]
    pub credential: Option<Credential>,
}

impl Source {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            credential: None,
        }
    }

    pub fn nuget_org() -> Self {
        Self::new(NUGET_ORG_NAME, NUGET_ORG_URL)
    }

    /// Identity used for de-duplication
    pub fn identity(&self) -> String {
        normalize_url(&self.url)
    }

    /// Whether this source is the given registry (compared by URL)
    pub fn is_same_registry(&self, url: &str) -> bool {
        self.identity() == normalize_url(url)
    }
}

/// Strip trailing slashes and lowercase, so `HTTPS://Feed/` and
/// `https://feed` are the same source.
pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_lowercase()
}

fn is_http_url(value: &str) -> bool {
    url::Url::parse(value)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Outcome of source discovery
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceSet {
    /// Highest priority first
    pub sources: Vec<Source>,
    pub routing: RoutingTable,
    /// Files that contributed, in the order they were read
    pub config_files: Vec<PathBuf>,
}

/// Where the user-profile and machine-wide configs live
#[derive(Debug, Clone, Default)]
pub struct ConfigLocations {
    pub user: Option<PathBuf>,
    pub machine: Option<PathBuf>,
}

impl ConfigLocations {
    /// No user or machine config; only the directory walk contributes.
    pub fn none() -> Self {
        Self::default()
    }

    /// Platform default locations for the current user.
    pub fn from_environment() -> Self {
        Self {
            user: default_user_config(),
            machine: default_machine_config(),
        }
    }
}

#[cfg(windows)]
fn default_user_config() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("NuGet").join("NuGet.Config"))
}

#[cfg(not(windows))]
fn default_user_config() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".nuget").join("NuGet").join("NuGet.Config"))
}

#[cfg(windows)]
fn default_machine_config() -> Option<PathBuf> {
    std::env::var_os("ProgramFiles(x86)")
        .or_else(|| std::env::var_os("ProgramFiles"))
        .map(|dir| {
            PathBuf::from(dir)
                .join("NuGet")
                .join("Config")
                .join("NuGet.Config")
        })
}

#[cfg(target_os = "macos")]
fn default_machine_config() -> Option<PathBuf> {
    Some(PathBuf::from(
        "/Library/Application Support/NuGet/Config/NuGet.Config",
    ))
}

#[cfg(all(unix, not(target_os = "macos")))]
fn default_machine_config() -> Option<PathBuf> {
    Some(PathBuf::from("/etc/opt/NuGet/Config/NuGet.Config"))
}

/// Resolves the ordered source list for a directory
#[derive(Debug, Clone, Default)]
pub struct SourceConfigResolver {
    locations: ConfigLocations,
    environment: HashMap<String, String>,
}

impl SourceConfigResolver {
    pub fn new(locations: ConfigLocations) -> Self {
        Self {
            locations,
            environment: HashMap::new(),
        }
    }

    /// Platform locations plus the credentials in the process environment.
    pub fn from_process() -> Self {
        Self::new(ConfigLocations::from_environment()).with_environment(std::env::vars().collect())
    }

    /// Environment used for `NuGetPackageSourceCredentials_*` lookups
    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn resolve(&self, start_dir: &Path) -> anyhow::Result<SourceSet> {
        if !start_dir.is_dir() {
            anyhow::bail!("{} is not a directory", start_dir.display());
        }
        let start_dir = std::path::absolute(start_dir)?;

        let mut walk = Walk::new(CredentialStore::from_environment(&self.environment));

        for dir in start_dir.ancestors() {
            for name in CONFIG_FILE_NAMES {
                if walk.cleared {
                    break;
                }
                walk.read_config(&dir.join(name));
            }
            walk.read_props(&dir.join(PROPS_FILE_NAME));
            if walk.cleared {
                tracing::debug!(
                    "Package sources cleared in {}, ignoring parent and user configs",
                    dir.display()
                );
                break;
            }
        }

        for path in [&self.locations.user, &self.locations.machine]
            .into_iter()
            .flatten()
        {
            if walk.cleared {
                break;
            }
            walk.read_config(path);
        }

        Ok(walk.finish())
    }
}

/// State accumulated while reading config files nearest first
struct Walk {
    sources: Vec<Source>,
    seen_files: HashSet<FileIdentity>,
    disabled: Vec<String>,
    store: CredentialStore,
    routing: RoutingTable,
    /// A mapping `<clear/>` was seen; farther mappings no longer contribute
    mapping_closed: bool,
    has_mapping: bool,
    cleared: bool,
    config_files: Vec<PathBuf>,
}

impl Walk {
    fn new(store: CredentialStore) -> Self {
        Self {
            sources: Vec::new(),
            seen_files: HashSet::new(),
            disabled: Vec::new(),
            store,
            routing: RoutingTable::new(),
            mapping_closed: false,
            has_mapping: false,
            cleared: false,
            config_files: Vec::new(),
        }
    }

    /// Read a file once; returns its content when it has not been seen yet.
    fn read_once(&mut self, path: &Path) -> Option<String> {
        if !path.is_file() {
            return None;
        }
        let identity = file_identity(path)?;
        if !self.seen_files.insert(identity) {
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => {
                self.config_files.push(path.to_path_buf());
                Some(content)
            }
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    fn read_config(&mut self, path: &Path) {
        let Some(content) = self.read_once(path) else {
            return;
        };
        let file = match nuget_config::parse_config(&content) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Ignoring malformed config {}: {}", path.display(), e);
                return;
            }
        };
        tracing::debug!(
            "Read {} ({} sources, cleared: {})",
            path.display(),
            file.sources.len(),
            file.sources_cleared
        );

        for entry in &file.sources {
            self.push_source(&entry.key, &entry.value);
        }
        self.disabled.extend(file.disabled.iter().cloned());
        self.store.add_file_credentials(&file.credentials);

        if file.has_mapping {
            self.has_mapping = true;
            if !self.mapping_closed {
                for entry in &file.mapping {
                    self.routing.add_patterns(&entry.source, &entry.patterns);
                }
                self.mapping_closed = file.mapping_cleared;
            }
        }

        if file.sources_cleared {
            self.cleared = true;
        }
    }

    fn read_props(&mut self, path: &Path) {
        let Some(content) = self.read_once(path) else {
            return;
        };
        match props::parse_restore_sources(&content) {
            Ok(urls) => {
                for url in urls {
                    self.push_source(&url, &url);
                }
            }
            Err(e) => tracing::warn!("Ignoring malformed {}: {}", path.display(), e),
        }
    }

    fn push_source(&mut self, name: &str, url: &str) {
        if !is_http_url(url) {
            tracing::debug!("Skipping non-HTTP source {} ({})", name, url);
            return;
        }
        self.sources.push(Source::new(name, url));
    }

    fn finish(self) -> SourceSet {
        let Walk {
            mut sources,
            disabled,
            store,
            routing,
            has_mapping,
            config_files,
            ..
        } = self;

        sources.retain(|source| {
            let is_disabled = disabled.iter().any(|d| d.eq_ignore_ascii_case(&source.name));
            if is_disabled {
                tracing::debug!("Source {} is disabled", source.name);
            }
            !is_disabled
        });

        // Disabled entries never claim a URL
        let mut seen_urls = HashSet::new();
        sources.retain(|source| seen_urls.insert(normalize_url(&source.url)));

        if sources.is_empty() {
            tracing::info!("No package sources configured, using {}", NUGET_ORG_URL);
            sources.push(Source::nuget_org());
        }

        for source in &mut sources {
            source.credential = store.get(&source.name).cloned();
        }

        SourceSet {
            sources,
            routing: if has_mapping { routing } else { RoutingTable::new() },
            config_files,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FileIdentity {
    #[cfg(unix)]
    Inode(u64, u64),
    #[cfg_attr(unix, allow(dead_code))]
    Path(PathBuf),
}

/// Physical identity of a file, so `nuget.config` and `NuGet.Config` on a
/// case-insensitive filesystem are read once.
#[cfg(unix)]
fn file_identity(path: &Path) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;

    let metadata = std::fs::metadata(path).ok()?;
    Some(FileIdentity::Inode(metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn file_identity(path: &Path) -> Option<FileIdentity> {
    let canonical = std::fs::canonicalize(path).ok()?;
    Some(FileIdentity::Path(PathBuf::from(
        canonical.to_string_lossy().to_lowercase(),
    )))
}

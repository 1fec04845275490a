//! Locating credential provider plugins on disk.
//!
//! Search order, all locations accumulated and de-duplicated by absolute
//! path:
//!
//! 1. `NUGET_NETCORE_PLUGIN_PATHS` (full paths to plugins)
//! 2. `NUGET_PLUGIN_PATHS` (full paths to plugins)
//! 3. `NUGET_CREDENTIALPROVIDERS_PATH` (directories to scan)
//! 4. `~/.nuget/plugins/netcore`, and `~/.nuget/plugins/netfx` on Windows
//! 5. `%LOCALAPPDATA%/NuGet/CredentialProviders`
//! 6. `PATH`, for executables named `CredentialProvider*`

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use super::Plugin;

const NETCORE_PLUGIN_PATHS: &str = "NUGET_NETCORE_PLUGIN_PATHS";
const PLUGIN_PATHS: &str = "NUGET_PLUGIN_PATHS";
const CREDENTIAL_PROVIDERS_PATH: &str = "NUGET_CREDENTIALPROVIDERS_PATH";

const PLUGIN_PREFIX: &str = "CredentialProvider";

/// The parts of the process environment discovery looks at
#[derive(Debug, Clone, Default)]
pub struct DiscoveryEnv {
    pub vars: HashMap<String, String>,
    pub home: Option<PathBuf>,
    pub local_app_data: Option<PathBuf>,
}

impl DiscoveryEnv {
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
            home: dirs::home_dir(),
            local_app_data: dirs::data_local_dir(),
        }
    }

    /// Nothing set; discovers no plugins
    pub fn empty() -> Self {
        Self::default()
    }

    /// Variable lookup, case-insensitive for Windows-style names like `Path`
    fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .or_else(|| {
                self.vars
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Find every plugin reachable from `env`, in priority order.
pub fn discover_plugins(env: &DiscoveryEnv) -> Vec<Plugin> {
    let mut found = Found::default();

    for var in [NETCORE_PLUGIN_PATHS, PLUGIN_PATHS] {
        if let Some(value) = env.var(var) {
            for path in split_path_list(value) {
                if path.is_file() {
                    found.push(path);
                } else {
                    tracing::debug!("{} entry {} does not exist", var, path.display());
                }
            }
        }
    }

    if let Some(value) = env.var(CREDENTIAL_PROVIDERS_PATH) {
        for dir in split_path_list(value) {
            scan_plugin_dir(&dir, &mut found);
            scan_prefixed_executables(&dir, &mut found);
        }
    }

    if let Some(home) = &env.home {
        let plugins = home.join(".nuget").join("plugins");
        scan_plugin_dir(&plugins.join("netcore"), &mut found);
        if cfg!(windows) {
            scan_plugin_dir(&plugins.join("netfx"), &mut found);
        }
    }

    if let Some(local) = &env.local_app_data {
        let legacy = local.join("NuGet").join("CredentialProviders");
        scan_prefixed_executables(&legacy, &mut found);
        for dir in subdirectories(&legacy) {
            scan_prefixed_executables(&dir, &mut found);
        }
    }

    if let Some(path) = env.var("PATH") {
        for dir in std::env::split_paths(path) {
            scan_prefixed_executables(&dir, &mut found);
        }
    }

    for plugin in &found.plugins {
        tracing::debug!("Found credential provider {}", plugin.path().display());
    }
    found.plugins
}

#[derive(Default)]
struct Found {
    seen: HashSet<PathBuf>,
    plugins: Vec<Plugin>,
}

impl Found {
    fn push(&mut self, path: PathBuf) {
        let absolute = std::path::absolute(&path).unwrap_or(path);
        if self.seen.insert(absolute.clone()) {
            self.plugins.push(Plugin::new(absolute));
        }
    }
}

/// Split a plugin path list on `;`, and on `:` where that is the platform
/// separator.
fn split_path_list(value: &str) -> Vec<PathBuf> {
    value
        .split(';')
        .flat_map(|part| {
            if cfg!(windows) {
                vec![part]
            } else {
                part.split(':').collect::<Vec<_>>()
            }
        })
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Scan `<dir>/CredentialProvider.<name>/CredentialProvider.<name>[.exe|.dll]`
fn scan_plugin_dir(dir: &Path, found: &mut Found) {
    for sub in subdirectories(dir) {
        let Some(name) = sub.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if !starts_with_ignore_case(&name, PLUGIN_PREFIX) {
            continue;
        }

        let candidates = [format!("{name}.exe"), format!("{name}.dll"), name.clone()];
        if let Some(path) = candidates
            .iter()
            .map(|file| sub.join(file))
            .find(|path| path.is_file())
        {
            found.push(path);
        }
    }
}

/// Scan `dir` for executables whose file name starts with `CredentialProvider`
fn scan_prefixed_executables(dir: &Path, found: &mut Found) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| starts_with_ignore_case(&n.to_string_lossy(), PLUGIN_PREFIX))
        })
        .filter(|p| is_executable(p))
        .collect();
    paths.sort();
    for path in paths {
        found.push(path);
    }
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}

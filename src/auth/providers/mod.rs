//! Credential provider plugins.
//!
//! When a source answers `401 Unauthorized` and no static credential works,
//! the [`CredentialBroker`] asks every discovered plugin for a credential at
//! the same time and takes the first usable answer. Each plugin is tried
//! with the V2 protocol (JSON messages over stdin/stdout) first and the V1
//! protocol (command-line arguments) second.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::select_ok;
use tokio::process::Command;

use super::Credential;
use crate::config::CredentialsConfig;

pub mod discovery;
pub mod v1;
pub mod v2;

pub use discovery::{DiscoveryEnv, discover_plugins};

/// Why a provider did not produce a credential
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// The provider does not handle this source
    #[error("provider does not handle {0}")]
    NotApplicable(String),
    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("failed to start provider: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("provider protocol error: {0}")]
    Protocol(String),
    #[error("provider returned an empty credential")]
    NoCredential,
}

/// Something that can produce a credential for a source URL
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn negotiate(&self, uri: &str) -> Result<Credential, NegotiationError>;
}

/// How providers are run
#[derive(Debug, Clone, Copy)]
pub struct NegotiationOptions {
    /// Per protocol attempt
    pub timeout: Duration,
    pub non_interactive: bool,
}

impl Default for NegotiationOptions {
    fn default() -> Self {
        Self::from(&CredentialsConfig::default())
    }
}

impl From<&CredentialsConfig> for NegotiationOptions {
    fn from(config: &CredentialsConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.provider_timeout_secs),
            non_interactive: config.non_interactive,
        }
    }
}

/// An executable credential provider on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plugin {
    path: PathBuf,
}

impl Plugin {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `.dll` plugins are managed assemblies started through `dotnet`
    pub fn is_managed_assembly(&self) -> bool {
        self.path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
    }

    /// Command that starts the plugin. The process is killed when the
    /// returned child is dropped.
    pub(crate) fn command(&self) -> Command {
        let mut command = if self.is_managed_assembly() {
            let mut command = Command::new("dotnet");
            command.arg(&self.path);
            command
        } else {
            Command::new(&self.path)
        };
        command.stderr(Stdio::null()).kill_on_drop(true);
        command
    }
}

/// A plugin negotiated with over V2, falling back to V1
#[derive(Debug, Clone)]
pub struct PluginProvider {
    plugin: Plugin,
    name: String,
    options: NegotiationOptions,
}

impl PluginProvider {
    pub fn new(plugin: Plugin, options: NegotiationOptions) -> Self {
        let name = plugin
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| plugin.path().display().to_string());
        Self {
            plugin,
            name,
            options,
        }
    }

    pub fn plugin(&self) -> &Plugin {
        &self.plugin
    }
}

#[async_trait]
impl CredentialProvider for PluginProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn negotiate(&self, uri: &str) -> Result<Credential, NegotiationError> {
        let timeout = self.options.timeout;

        match tokio::time::timeout(timeout, v2::negotiate(&self.plugin, uri, &self.options)).await
        {
            Ok(Ok(credential)) if credential.is_usable() => return Ok(credential),
            Ok(Err(NegotiationError::NotApplicable(uri))) => {
                tracing::debug!("{} declined {} over V2", self.name, uri);
                return Err(NegotiationError::NotApplicable(uri));
            }
            Ok(Ok(_)) => tracing::debug!("{} returned an empty V2 credential", self.name),
            Ok(Err(e)) => tracing::debug!("{} V2 negotiation failed: {}", self.name, e),
            Err(_) => tracing::debug!("{} V2 negotiation timed out", self.name),
        }

        match tokio::time::timeout(timeout, v1::negotiate(&self.plugin, uri, &self.options)).await
        {
            Ok(Ok(credential)) if credential.is_usable() => Ok(credential),
            Ok(Ok(_)) => Err(NegotiationError::NoCredential),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NegotiationError::Timeout(timeout)),
        }
    }
}

/// Races credential providers against each other
#[derive(Clone, Default)]
pub struct CredentialBroker {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl std::fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBroker")
            .field("providers", &self.provider_names())
            .finish()
    }
}

impl CredentialBroker {
    /// Broker over every plugin found in the environment
    pub fn discover(env: &DiscoveryEnv, config: &CredentialsConfig) -> Self {
        if !config.providers_enabled {
            tracing::debug!("Credential providers disabled by configuration");
            return Self::default();
        }

        let options = NegotiationOptions::from(config);
        let providers: Vec<Arc<dyn CredentialProvider>> = discover_plugins(env)
            .into_iter()
            .map(|plugin| Arc::new(PluginProvider::new(plugin, options)) as Arc<dyn CredentialProvider>)
            .collect();

        tracing::info!("Discovered {} credential provider(s)", providers.len());
        Self { providers }
    }

    pub fn with_providers(providers: Vec<Arc<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Ask every provider at once; the first usable credential wins and the
    /// remaining negotiations are dropped.
    pub async fn negotiate(&self, uri: &str) -> Option<Credential> {
        if self.providers.is_empty() {
            return None;
        }

        let attempts = self.providers.iter().map(|provider| {
            Box::pin(async move {
                match provider.negotiate(uri).await {
                    Ok(credential) if credential.is_usable() => {
                        Ok((provider.name().to_string(), credential))
                    }
                    Ok(_) => Err(NegotiationError::NoCredential),
                    Err(e) => {
                        tracing::debug!("Provider {} failed for {}: {}", provider.name(), uri, e);
                        Err(e)
                    }
                }
            })
        });

        match select_ok(attempts).await {
            Ok(((name, credential), remaining)) => {
                drop(remaining);
                tracing::info!("Credential provider {} authenticated {}", name, uri);
                Some(credential)
            }
            Err(e) => {
                tracing::warn!("No credential provider could authenticate {}: {}", uri, e);
                None
            }
        }
    }
}

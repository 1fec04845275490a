//! Static credentials for package sources.
//!
//! Reads what [`crate::sources::nuget_config`] extracted from
//! `<packageSourceCredentials>` plus the `NuGetPackageSourceCredentials_*`
//! environment variables, and answers "which credential belongs to this
//! source name".
//!
//! Encrypted passwords (`key="Password"`) are DPAPI blobs. They can only be
//! decrypted on Windows, for the user who encrypted them; everywhere else
//! only `ClearTextPassword` is considered.

use std::collections::HashMap;

use super::{Credential, DEFAULT_USERNAME};

const ENV_PREFIX: &str = "NuGetPackageSourceCredentials_";

/// Credential fields for one source exactly as declared in a config file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCredential {
    /// Decoded element name
    pub source_name: String,
    pub username: Option<String>,
    pub clear_text_password: Option<String>,
    /// Base64 DPAPI blob
    pub encrypted_password: Option<String>,
}

impl RawCredential {
    /// Assign a field from an `<add key=".." value=".."/>` pair. Unknown keys
    /// (e.g. `ValidAuthenticationTypes`) are ignored.
    pub fn set(&mut self, key: &str, value: &str) {
        let value = Some(value.to_string());
        if key.eq_ignore_ascii_case("Username") {
            self.username = value;
        } else if key.eq_ignore_ascii_case("ClearTextPassword") {
            self.clear_text_password = value;
        } else if key.eq_ignore_ascii_case("Password") {
            self.encrypted_password = value;
        }
    }

    /// Turn the declared fields into a usable credential.
    ///
    /// A clear-text password wins over an encrypted one; a password without a
    /// username gets [`DEFAULT_USERNAME`].
    pub fn resolve(&self) -> Option<Credential> {
        let password = self
            .clear_text_password
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| {
                self.encrypted_password
                    .as_deref()
                    .and_then(decrypt_password)
            });

        let username = self.username.clone().filter(|u| !u.is_empty());

        match (username, password) {
            (None, None) => None,
            (Some(username), password) => Some(Credential::new(username, password.unwrap_or_default())),
            (None, Some(password)) => Some(Credential::new(DEFAULT_USERNAME, password)),
        }
    }
}

/// Decode a config element name back into a source name.
///
/// Source names may contain characters that are not valid in XML element
/// names; they are written as `_xHHHH_` (`My Feed` becomes `My_x0020_Feed`).
pub fn decode_element_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;

    while let Some(start) = rest.find("_x") {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let decoded = candidate
            .get(2..6)
            .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .filter(|_| candidate.as_bytes().get(6) == Some(&b'_'))
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .and_then(char::from_u32);

        match decoded {
            Some(c) => {
                out.push(c);
                rest = &candidate[7..];
            }
            None => {
                out.push_str("_x");
                rest = &candidate[2..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Case-insensitive source name → credential lookup.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    /// From `NuGetPackageSourceCredentials_*`; checked first
    environment: Vec<(String, Credential)>,
    /// From config files, nearest file first
    files: Vec<(String, Credential)>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store seeded with credentials from environment variables.
    ///
    /// Each `NuGetPackageSourceCredentials_<source>` variable holds
    /// `Username=<user>;Password=<password>`.
    pub fn from_environment(vars: &HashMap<String, String>) -> Self {
        let mut environment: Vec<(String, Credential)> = vars
            .iter()
            .filter_map(|(key, value)| {
                let source = strip_prefix_ignore_case(key, ENV_PREFIX)?;
                let credential = parse_env_credential(value)?;
                Some((source.to_lowercase(), credential))
            })
            .collect();
        environment.sort_by(|a, b| a.0.cmp(&b.0));

        Self {
            environment,
            files: Vec::new(),
        }
    }

    /// Add the credentials of one config file. Earlier files take
    /// precedence, so a name already present is not replaced.
    pub fn add_file_credentials(&mut self, credentials: &[RawCredential]) {
        for raw in credentials {
            let key = raw.source_name.to_lowercase();
            if self.files.iter().any(|(name, _)| *name == key) {
                continue;
            }
            match raw.resolve() {
                Some(credential) => self.files.push((key, credential)),
                None => tracing::debug!(
                    "Ignoring credentials for {} without a usable username or password",
                    raw.source_name
                ),
            }
        }
    }

    pub fn get(&self, source_name: &str) -> Option<&Credential> {
        let key = source_name.to_lowercase();
        self.environment
            .iter()
            .chain(self.files.iter())
            .find(|(name, _)| *name == key)
            .map(|(_, credential)| credential)
    }

    pub fn len(&self) -> usize {
        self.environment.len() + self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
        .filter(|rest| !rest.is_empty())
}

fn parse_env_credential(value: &str) -> Option<Credential> {
    let mut raw = RawCredential::default();
    for pair in value.split(';') {
        if let Some((key, value)) = pair.split_once('=') {
            match key.trim() {
                k if k.eq_ignore_ascii_case("Username") => raw.username = Some(value.to_string()),
                k if k.eq_ignore_ascii_case("Password") => {
                    raw.clear_text_password = Some(value.to_string())
                }
                _ => {}
            }
        }
    }
    raw.resolve()
}

/// Decrypt a `Password` blob written by `nuget sources add`.
#[cfg(windows)]
pub fn decrypt_password(blob: &str) -> Option<String> {
    use std::process::Command;

    let blob = blob.trim();
    if blob.is_empty()
        || !blob
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
    {
        tracing::warn!("Encrypted password is not valid base64, ignoring it");
        return None;
    }

    // DPAPI, current user scope, with the entropy NuGet uses when encrypting.
    let script = format!(
        "Add-Type -AssemblyName System.Security; \
         $bytes = [Convert]::FromBase64String('{blob}'); \
         $entropy = [Text.Encoding]::UTF8.GetBytes('NuGet'); \
         $plain = [Security.Cryptography.ProtectedData]::Unprotect($bytes, $entropy, 'CurrentUser'); \
         [Console]::Out.Write([Text.Encoding]::UTF8.GetString($plain))"
    );

    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", &script])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let password = String::from_utf8_lossy(&output.stdout).to_string();
            (!password.is_empty()).then_some(password)
        }
        Ok(output) => {
            tracing::warn!("Failed to decrypt password: exit status {}", output.status);
            None
        }
        Err(e) => {
            tracing::warn!("Failed to run powershell to decrypt password: {}", e);
            None
        }
    }
}

/// Decrypt a `Password` blob written by `nuget sources add`.
///
/// DPAPI only exists on Windows, so this always fails here and callers fall
/// back to clear-text passwords.
#[cfg(not(windows))]
pub fn decrypt_password(_blob: &str) -> Option<String> {
    tracing::debug!("Encrypted passwords are only supported on Windows");
    None
}

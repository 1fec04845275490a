//! Authentication support for private package sources.
//!
//! Credentials come from two places:
//!
//! - [`credential_store`]: static credentials declared in `NuGet.Config`
//!   files (`<packageSourceCredentials>`) or in
//!   `NuGetPackageSourceCredentials_<source>` environment variables
//! - [`providers`]: external credential provider plugins, negotiated with
//!   on demand when a source answers `401 Unauthorized`
//!
//! ## Security
//!
//! - Passwords are NEVER logged; [`Credential`]'s `Debug` output redacts them
//! - Use [`redact_token`] whenever a secret has to be identified in a log line

use std::fmt;

pub mod credential_store;
pub mod providers;

/// Username used when a config declares a password without a username.
pub const DEFAULT_USERNAME: &str = "username";

/// A username/password pair sent as HTTP Basic authentication.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// A credential is usable when it carries a username or a password.
    pub fn is_usable(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &redact_token(&self.password))
            .finish()
    }
}

/// Redact a token for safe logging.
///
/// Shows only the first few characters to help identify which token is in use
/// without exposing the full secret.
pub fn redact_token(token: &str) -> String {
    match token.char_indices().nth(4) {
        Some((end, _)) => format!("{}...", &token[..end]),
        None => "****".to_string(),
    }
}

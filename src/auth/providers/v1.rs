//! V1 credential provider protocol.
//!
//! The plugin is started once per request with the target URL on its
//! command line and writes a JSON object (possibly preceded by log output)
//! to stdout. Exit code `0` means success, `1` means the provider does not
//! handle this URL, anything else is a failure.

use std::process::Stdio;

use serde::Deserialize;

use super::{NegotiationError, NegotiationOptions, Plugin};
use crate::auth::Credential;

const EXIT_NOT_APPLICABLE: i32 = 1;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct V1Response {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "AuthTypes")]
    _auth_types: Option<Vec<String>>,
}

pub async fn negotiate(
    plugin: &Plugin,
    uri: &str,
    options: &NegotiationOptions,
) -> Result<Credential, NegotiationError> {
    let mut command = plugin.command();
    command.args(["-Uri", uri]);
    if options.non_interactive {
        command.arg("-NonInteractive");
    }
    command
        .args(["-IsRetry", "false"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped());

    let output = command
        .output()
        .await
        .map_err(NegotiationError::Spawn)?;

    match output.status.code() {
        Some(0) => {}
        Some(EXIT_NOT_APPLICABLE) => return Err(NegotiationError::NotApplicable(uri.to_string())),
        _ => {
            return Err(NegotiationError::Protocol(format!(
                "exited with {}",
                output.status
            )));
        }
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_output(&stdout).ok_or(NegotiationError::NoCredential)
}

/// Extract a credential from V1 provider output.
///
/// The JSON object starting at the first `{` is preferred; providers that
/// only log are read from their `]Username: ` and `]Password: ` lines.
pub fn parse_output(stdout: &str) -> Option<Credential> {
    if let Some(start) = stdout.find('{')
        && let Some(Ok(response)) = serde_json::Deserializer::from_str(&stdout[start..])
            .into_iter::<V1Response>()
            .next()
    {
        let credential = Credential::new(
            response.username.unwrap_or_default(),
            response.password.unwrap_or_default(),
        );
        if credential.is_usable() {
            return Some(credential);
        }
    }

    let mut credential = Credential::default();
    for line in stdout.lines() {
        if let Some((_, value)) = line.split_once("]Username: ") {
            credential.username = value.trim().to_string();
        } else if let Some((_, value)) = line.split_once("]Password: ") {
            credential.password = value.trim().to_string();
        }
    }
    credential.is_usable().then_some(credential)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_output() {
        let output = r#"{"Username":"VssSessionToken","Password":"eyJ0eXAi","AuthTypes":["Basic"]}"#;
        let credential = parse_output(output).unwrap();
        assert_eq!(credential.username, "VssSessionToken");
        assert_eq!(credential.password, "eyJ0eXAi");
    }

    #[test]
    fn test_parse_json_after_log_lines() {
        let output = "[Information] [CredentialProvider]Using cached token\n{\"Username\":\"u\",\"Password\":\"p\"}\ntrailing noise";
        let credential = parse_output(output).unwrap();
        assert_eq!(credential.username, "u");
        assert_eq!(credential.password, "p");
    }

    #[test]
    fn test_parse_log_lines() {
        let output = "[Verbose] [CredentialProvider]Username: build-agent\n[Verbose] [CredentialProvider]Password: abc123\n";
        let credential = parse_output(output).unwrap();
        assert_eq!(credential.username, "build-agent");
        assert_eq!(credential.password, "abc123");
    }

    #[test]
    fn test_parse_invalid_json_falls_back_to_log_lines() {
        let output = "{not json\n[Info] [Provider]Password: only-password\n";
        let credential = parse_output(output).unwrap();
        assert_eq!(credential.username, "");
        assert_eq!(credential.password, "only-password");
    }

    #[test]
    fn test_parse_nothing() {
        assert!(parse_output("").is_none());
        assert!(parse_output(r#"{"Username":"","Password":""}"#).is_none());
        assert!(parse_output("no credentials here").is_none());
    }
}

//! V2 credential provider protocol.
//!
//! The plugin is started with `-Plugin` and exchanges newline-delimited JSON
//! messages over stdin/stdout. The plugin opens with a `Handshake` request;
//! once that is acknowledged the host sends `GetAuthenticationCredentials`
//! and waits for the response carrying the same request id.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::{NegotiationError, NegotiationOptions, Plugin};
use crate::auth::Credential;

pub const PROTOCOL_VERSION: &str = "2.0.0";

const HANDSHAKE: &str = "Handshake";
const GET_CREDENTIALS: &str = "GetAuthenticationCredentials";

/// One protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    pub request_id: String,
    #[serde(rename = "Type")]
    pub kind: MessageType,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    Response,
    Progress,
    Fault,
    Cancel,
}

/// Payload of a `GetAuthenticationCredentials` response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CredentialsResponse {
    pub response_code: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub message: Option<String>,
}

impl Message {
    fn request(request_id: &str, method: &str, payload: Value) -> Self {
        Self {
            request_id: request_id.to_string(),
            kind: MessageType::Request,
            method: method.to_string(),
            payload: Some(payload),
        }
    }

    /// Acknowledge the plugin's handshake
    fn handshake_response(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            kind: MessageType::Response,
            method: HANDSHAKE.to_string(),
            payload: Some(json!({
                "ResponseCode": "Success",
                "ProtocolVersion": PROTOCOL_VERSION,
            })),
        }
    }

    fn to_line(&self) -> Result<String, NegotiationError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| NegotiationError::Protocol(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }
}

fn new_request_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%d%H%M%S%f"),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Interpret a `GetAuthenticationCredentials` response payload
pub fn parse_credentials_response(
    uri: &str,
    payload: Option<Value>,
) -> Result<Credential, NegotiationError> {
    let response: CredentialsResponse = match payload {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| NegotiationError::Protocol(format!("invalid credentials payload: {e}")))?,
        None => return Err(NegotiationError::Protocol("empty credentials payload".to_string())),
    };

    match response.response_code.as_str() {
        "Success" => {
            let credential = Credential::new(
                response.username.unwrap_or_default(),
                response.password.unwrap_or_default(),
            );
            if credential.is_usable() {
                Ok(credential)
            } else {
                Err(NegotiationError::NoCredential)
            }
        }
        "NotFound" => Err(NegotiationError::NotApplicable(uri.to_string())),
        code => Err(NegotiationError::Protocol(format!(
            "{}: {}",
            code,
            response.message.unwrap_or_default()
        ))),
    }
}

pub async fn negotiate(
    plugin: &Plugin,
    uri: &str,
    options: &NegotiationOptions,
) -> Result<Credential, NegotiationError> {
    let mut child = plugin
        .command()
        .arg("-Plugin")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(NegotiationError::Spawn)?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| NegotiationError::Protocol("plugin stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| NegotiationError::Protocol("plugin stdout unavailable".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();

    let request_id = new_request_id();
    let io_error = |e: std::io::Error| NegotiationError::Protocol(e.to_string());

    while let Some(line) = lines.next_line().await.map_err(io_error)? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Message>(line) else {
            tracing::debug!("Ignoring non-protocol output from {}", plugin.path().display());
            continue;
        };

        match (message.kind, message.method.as_str()) {
            (MessageType::Request, HANDSHAKE) => {
                let reply = Message::handshake_response(&message.request_id).to_line()?;
                let request = Message::request(
                    &request_id,
                    GET_CREDENTIALS,
                    json!({
                        "Uri": uri,
                        "IsRetry": false,
                        "IsNonInteractive": options.non_interactive,
                        "CanShowDialog": !options.non_interactive,
                    }),
                )
                .to_line()?;
                stdin.write_all(reply.as_bytes()).await.map_err(io_error)?;
                stdin.write_all(request.as_bytes()).await.map_err(io_error)?;
                stdin.flush().await.map_err(io_error)?;
            }
            (MessageType::Response, GET_CREDENTIALS) if message.request_id == request_id => {
                let result = parse_credentials_response(uri, message.payload);
                let _ = child.start_kill();
                return result;
            }
            (MessageType::Fault, _) if message.request_id == request_id => {
                let _ = child.start_kill();
                return Err(NegotiationError::Protocol(format!(
                    "plugin fault: {}",
                    message.payload.unwrap_or(Value::Null)
                )));
            }
            _ => {}
        }
    }

    Err(NegotiationError::Protocol(
        "plugin exited before answering".to_string(),
    ))
}

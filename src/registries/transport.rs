//! Authenticated HTTP access to one package source.
//!
//! Requests carry Basic authentication when a credential is known. The first
//! `401 Unauthorized` asks the [`CredentialBroker`] for a credential; the
//! answer (or the lack of one) is remembered for the lifetime of the
//! transport, so a source negotiates at most once.

use std::sync::Arc;

use reqwest::{Client, Response, StatusCode};
use tokio::sync::{OnceCell, RwLock};

use super::RegistryError;
use crate::auth::Credential;
use crate::auth::providers::CredentialBroker;
use crate::sources::Source;

pub struct AuthenticatedTransport {
    client: Arc<Client>,
    source_url: String,
    credential: RwLock<Option<Credential>>,
    broker: Option<Arc<CredentialBroker>>,
    negotiated: OnceCell<Option<Credential>>,
}

impl AuthenticatedTransport {
    pub fn new(client: Arc<Client>, source: &Source, broker: Option<Arc<CredentialBroker>>) -> Self {
        Self {
            client,
            source_url: source.url.clone(),
            credential: RwLock::new(source.credential.clone()),
            broker,
            negotiated: OnceCell::new(),
        }
    }

    /// Access the shared HTTP client
    pub fn http_client(&self) -> Arc<Client> {
        Arc::clone(&self.client)
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Whether a provider has already been asked for a credential
    pub fn has_negotiated(&self) -> bool {
        self.negotiated.initialized()
    }

    async fn send(&self, url: &str, credential: Option<&Credential>) -> Result<Response, RegistryError> {
        let mut request = self.client.get(url);
        if let Some(credential) = credential {
            request = request.basic_auth(&credential.username, Some(&credential.password));
        }
        Ok(request.send().await?)
    }

    /// GET `url`, authenticating against this source.
    ///
    /// Returns the response whatever its status; a `401` that no provider
    /// could resolve is handed back unchanged.
    pub async fn get(&self, url: &str) -> Result<Response, RegistryError> {
        let current = self.credential.read().await.clone();
        let response = self.send(url, current.as_ref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let Some(broker) = &self.broker else {
            return Ok(response);
        };

        let negotiated = self
            .negotiated
            .get_or_init(|| async {
                tracing::info!(
                    "{} requires authentication, asking credential providers",
                    self.source_url
                );
                broker.negotiate(&self.source_url).await
            })
            .await;

        match negotiated {
            Some(credential) if current.as_ref() != Some(credential) => {
                tracing::debug!(
                    "Retrying {} as {}",
                    url,
                    credential.username
                );
                *self.credential.write().await = Some(credential.clone());
                self.send(url, Some(credential)).await
            }
            _ => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::providers::{CredentialProvider, NegotiationError};
    use crate::config::HttpConfig;
    use crate::registries::http_client::create_shared_client;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Counting {
        calls: Arc<AtomicUsize>,
        credential: Option<Credential>,
        delay: Duration,
    }

    #[async_trait]
    impl CredentialProvider for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn negotiate(&self, _uri: &str) -> Result<Credential, NegotiationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.credential.clone().ok_or(NegotiationError::NoCredential)
        }
    }

    fn broker(calls: &Arc<AtomicUsize>, credential: Option<Credential>) -> Arc<CredentialBroker> {
        slow_broker(calls, credential, Duration::ZERO)
    }

    fn slow_broker(
        calls: &Arc<AtomicUsize>,
        credential: Option<Credential>,
        delay: Duration,
    ) -> Arc<CredentialBroker> {
        Arc::new(CredentialBroker::with_providers(vec![Arc::new(Counting {
            calls: Arc::clone(calls),
            credential,
            delay,
        })]))
    }

    // "alice:secret" and "bob:token"
    const ALICE: &str = "Basic YWxpY2U6c2VjcmV0";
    const BOB: &str = "Basic Ym9iOnRva2Vu";

    #[tokio::test]
    async fn test_static_credential_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.json"))
            .and(header("authorization", ALICE))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut source = Source::new("feed", format!("{}/index.json", server.uri()));
        source.credential = Some(Credential::new("alice", "secret"));
        let transport =
            AuthenticatedTransport::new(create_shared_client(&HttpConfig::default()).unwrap(), &source, None);

        let response = transport.get(&source.url).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_401_negotiates_once_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", BOB))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let source = Source::new("feed", format!("{}/index.json", server.uri()));
        let transport = AuthenticatedTransport::new(
            create_shared_client(&HttpConfig::default()).unwrap(),
            &source,
            Some(broker(&calls, Some(Credential::new("bob", "token")))),
        );

        let first = transport.get(&source.url).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = transport
            .get(&format!("{}/other.json", server.uri()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(transport.has_negotiated());
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_negotiation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", BOB))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let source = Source::new("feed", format!("{}/index.json", server.uri()));
        let transport = AuthenticatedTransport::new(
            create_shared_client(&HttpConfig::default()).unwrap(),
            &source,
            Some(slow_broker(
                &calls,
                Some(Credential::new("bob", "token")),
                Duration::from_millis(200),
            )),
        );

        let other = format!("{}/other.json", server.uri());
        let (first, second) = tokio::join!(transport.get(&source.url), transport.get(&other));
        assert_eq!(first.unwrap().status(), StatusCode::OK);
        assert_eq!(second.unwrap().status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_negotiation_returns_original_401() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let source = Source::new("feed", format!("{}/index.json", server.uri()));
        let transport = AuthenticatedTransport::new(
            create_shared_client(&HttpConfig::default()).unwrap(),
            &source,
            Some(broker(&calls, None)),
        );

        for _ in 0..3 {
            let response = transport.get(&source.url).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_without_broker_401_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let source = Source::new("feed", format!("{}/index.json", server.uri()));
        let transport =
            AuthenticatedTransport::new(create_shared_client(&HttpConfig::default()).unwrap(), &source, None);
        let response = transport.get(&source.url).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!transport.has_negotiated());
    }
}

//! End-to-end resolution through [`Backend`] against mock sources

use std::sync::Arc;

use async_trait::async_trait;
use feedscout::auth::Credential;
use feedscout::auth::providers::{CredentialBroker, CredentialProvider, NegotiationError};
use feedscout::backend::Backend;
use feedscout::config::Config;
use feedscout::registries::VulnerabilitySeverity;
use feedscout::resolver::ResolveError;
use feedscout::routing::RoutingTable;
use feedscout::sources::{Source, SourceSet};
use feedscout::version::Version;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_feed(server: &MockServer, with_search: bool) {
    let mut resources = vec![json!({
        "@id": format!("{}/registration/", server.uri()),
        "@type": "RegistrationsBaseUrl/3.6.0"
    })];
    if with_search {
        resources.push(json!({
            "@id": format!("{}/query", server.uri()),
            "@type": "SearchQueryService/3.5.0"
        }));
    }
    Mock::given(method("GET"))
        .and(path("/v3/index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": "3.0.0",
            "resources": resources,
        })))
        .mount(server)
        .await;
}

async fn mount_package(server: &MockServer, id: &str, versions: serde_json::Value) {
    let leaves: Vec<serde_json::Value> = versions
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|entry| {
            let mut entry = entry;
            if let Some(object) = entry.as_object_mut() {
                object.insert("id".to_string(), json!(id));
            }
            json!({ "catalogEntry": entry })
        })
        .collect();

    Mock::given(method("GET"))
        .and(path(format!("/registration/{}/index.json", id.to_lowercase())))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{ "@id": "page", "items": leaves }]
        })))
        .mount(server)
        .await;
}

fn source(name: &str, server: &MockServer) -> Source {
    Source::new(name, format!("{}/v3/index.json", server.uri()))
}

fn config_with_public(public: Option<&MockServer>) -> Config {
    let mut config = Config::default();
    match public {
        Some(server) => {
            config.resolver.public_registry_url = format!("{}/v3/index.json", server.uri())
        }
        None => config.resolver.enrich_from_public = false,
    }
    config
}

#[tokio::test]
async fn test_resolve_mixed_outcomes_with_enrichment() {
    let private = MockServer::start().await;
    let public = MockServer::start().await;
    mount_feed(&private, false).await;
    mount_feed(&public, true).await;

    mount_package(
        &private,
        "Contoso.Utils",
        json!([{ "version": "1.0.0" }, { "version": "1.1.0-beta" }]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/registration/missing.pkg/index.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&private)
        .await;
    Mock::given(method("GET"))
        .and(path("/registration/broken.pkg/index.json"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&private)
        .await;

    mount_package(
        &public,
        "Contoso.Utils",
        json!([{
            "version": "1.0.0",
            "vulnerabilities": [{ "advisoryUrl": "https://github.com/advisories/GHSA-x", "severity": 3 }]
        }]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalHits": 1,
            "data": [{
                "id": "Contoso.Utils",
                "version": "1.0.0",
                "totalDownloads": 999,
                "versions": [{ "version": "1.0.0", "downloads": 999 }]
            }]
        })))
        .mount(&public)
        .await;

    let sources = SourceSet {
        sources: vec![source("private", &private)],
        ..Default::default()
    };
    let backend = Backend::initialize_with(
        config_with_public(Some(&public)),
        sources,
        CredentialBroker::default(),
    )
    .await
    .unwrap();

    let ids: Vec<String> = ["Contoso.Utils", "contoso.utils", "Missing.Pkg", "Broken.Pkg"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let results = backend.resolve(&ids).await;
    assert_eq!(results.len(), 3);

    let info = results["Contoso.Utils"].as_ref().unwrap();
    assert_eq!(info.source, "private");
    assert_eq!(info.total_downloads, Some(999));
    assert_eq!(
        info.supplemental_registry_url.as_deref(),
        Some(format!("{}/v3/index.json", public.uri()).as_str())
    );
    let stable = info.find_version(&Version::parse("1.0.0")).unwrap();
    assert_eq!(stable.download_count, Some(999));
    assert_eq!(stable.vulnerabilities[0].severity, VulnerabilitySeverity::Critical);
    // Versions only the private feed has are kept as they are
    assert!(info.latest().unwrap().version.is_prerelease());

    assert!(matches!(
        results["Missing.Pkg"],
        Err(ResolveError::NotFound(_))
    ));
    assert!(matches!(
        results["Broken.Pkg"],
        Err(ResolveError::Registry { .. })
    ));
}

#[tokio::test]
async fn test_priority_order_and_routing() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    mount_feed(&first, false).await;
    mount_feed(&second, false).await;

    mount_package(&first, "Shared.Lib", json!([{ "version": "1.0.0" }])).await;
    mount_package(&second, "Shared.Lib", json!([{ "version": "2.0.0" }])).await;
    mount_package(&second, "Team.Core", json!([{ "version": "3.0.0" }])).await;

    // Routed away from the first source; it must never be asked
    Mock::given(method("GET"))
        .and(path("/registration/team.core/index.json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&first)
        .await;

    let mut routing = RoutingTable::new();
    routing.add_patterns("second", ["Team.*"]);
    let sources = SourceSet {
        sources: vec![source("first", &first), source("second", &second)],
        routing,
        ..Default::default()
    };
    let backend = Backend::initialize_with(config_with_public(None), sources, CredentialBroker::default())
        .await
        .unwrap();

    let ids = vec!["Shared.Lib".to_string(), "Team.Core".to_string()];
    let results = backend.resolve(&ids).await;

    // Unmapped id: first source in priority order wins
    let shared = results["Shared.Lib"].as_ref().unwrap();
    assert_eq!(shared.source, "first");
    assert_eq!(shared.latest().unwrap().version.to_string(), "1.0.0");

    let team = results["Team.Core"].as_ref().unwrap();
    assert_eq!(team.source, "second");
}

#[tokio::test]
async fn test_unreachable_source_is_skipped() {
    let live = MockServer::start().await;
    mount_feed(&live, false).await;
    mount_package(&live, "Contoso.Utils", json!([{ "version": "1.0.0" }])).await;

    let sources = SourceSet {
        sources: vec![
            Source::new("dead", "http://127.0.0.1:9/v3/index.json"),
            source("live", &live),
        ],
        ..Default::default()
    };
    let mut config = config_with_public(None);
    config.http.connect_timeout_secs = 1;
    config.http.timeout_secs = 2;

    let backend = Backend::initialize_with(config, sources, CredentialBroker::default())
        .await
        .unwrap();
    assert_eq!(backend.registries().len(), 1);

    let results = backend.resolve(&["Contoso.Utils".to_string()]).await;
    assert_eq!(results["Contoso.Utils"].as_ref().unwrap().source, "live");
}

struct Fixed(Credential);

#[async_trait]
impl CredentialProvider for Fixed {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn negotiate(&self, _uri: &str) -> Result<Credential, NegotiationError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_authenticated_source_uses_provider_credential() {
    // "alice:secret"
    const ALICE: &str = "Basic YWxpY2U6c2VjcmV0";

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/index.json"))
        .and(header("authorization", ALICE))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resources": [{
                "@id": format!("{}/registration/", server.uri()),
                "@type": "RegistrationsBaseUrl"
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/registration/contoso.utils/index.json"))
        .and(header("authorization", ALICE))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{
                "@id": "page",
                "items": [{ "catalogEntry": { "id": "Contoso.Utils", "version": "4.0.0" } }]
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let broker = CredentialBroker::with_providers(vec![Arc::new(Fixed(Credential::new(
        "alice", "secret",
    )))]);
    let sources = SourceSet {
        sources: vec![source("secure", &server)],
        ..Default::default()
    };
    let backend = Backend::initialize_with(config_with_public(None), sources, broker)
        .await
        .unwrap();
    assert!(backend.registries()[0].transport().has_negotiated());

    let results = backend.resolve(&["Contoso.Utils".to_string()]).await;
    let info = results["Contoso.Utils"].as_ref().unwrap();
    assert_eq!(info.latest().unwrap().version.to_string(), "4.0.0");
}

#[tokio::test]
async fn test_search_only_on_capable_sources() {
    let searchable = MockServer::start().await;
    let plain = MockServer::start().await;
    mount_feed(&searchable, true).await;
    mount_feed(&plain, false).await;

    Mock::given(method("GET"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalHits": 1,
            "data": [{ "id": "Contoso.Utils", "version": "1.0.0" }]
        })))
        .mount(&searchable)
        .await;

    let sources = SourceSet {
        sources: vec![source("searchable", &searchable), source("plain", &plain)],
        ..Default::default()
    };
    let backend = Backend::initialize_with(config_with_public(None), sources, CredentialBroker::default())
        .await
        .unwrap();

    let results = backend.search("contoso", 10).await;
    assert_eq!(results.len(), 1);
    let (name, response) = &results[0];
    assert_eq!(name, "searchable");
    assert_eq!(response.as_ref().unwrap().data[0].id, "Contoso.Utils");
}

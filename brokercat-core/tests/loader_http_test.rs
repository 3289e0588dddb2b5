//! End-to-end tests: CatalogLoader with the HTTP fetcher against a local server

#![cfg(feature = "http")]

use base64::{engine::general_purpose, Engine as _};
use brokercat_core::catalog::{CatalogLoader, CatalogStore, RefreshError, RefreshOutcome, Tier};
use brokercat_core::trust::{KeyId, TrustedKey, TrustedKeySet};
use brokercat_core::CatalogConfig;
use ed25519_dalek::{Signer, SigningKey};
use httpmock::prelude::*;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tempfile::TempDir;

const CATALOG: &str = r#"{
  "version": 7,
  "brokers": [
    {"name": "Alpha", "server": "Alpha-Live", "platform": "MT5", "webTerminalUrl": "https://alpha.example/web"},
    {"name": "Beta", "server": "Beta-Real", "platform": "MT4", "webTerminalUrl": "https://beta.example/mt4"},
    {"name": "Beta", "server": "Beta-Demo", "platform": "MT4", "webTerminalUrl": "https://beta.example/mt4", "demo": true}
  ]
}"#;

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

fn signature_file(payload: &[u8]) -> String {
    format!(
        "untrusted comment: signature from brokercat test key\n{}\n",
        general_purpose::STANDARD.encode(signing_key().sign(payload).to_bytes())
    )
}

fn sends_no_etag(req: &HttpMockRequest) -> bool {
    req.headers.as_ref().map_or(true, |headers| {
        !headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("if-none-match"))
    })
}

fn loader(server: &MockServer, cache: &TempDir) -> CatalogLoader {
    let config = CatalogConfig {
        base_url: server.url("/v1"),
        connect_timeout_secs: 2,
        read_timeout_secs: 2,
        request_timeout_secs: 5,
        ..CatalogConfig::default()
    };
    let keys = TrustedKeySet::new(vec![TrustedKey::new(
        "e2e",
        signing_key().verifying_key(),
    )])
    .unwrap();

    CatalogLoader::builder()
        .config(config)
        .keys(keys)
        .store(CatalogStore::new(cache.path()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_fetch_verify_persist_then_revalidate() {
    let server = MockServer::start_async().await;
    let cache = TempDir::new().unwrap();

    let first_fetch = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/brokers.json")
                .matches(sends_no_etag);
            then.status(200).header("ETag", "\"rev-7\"").body(CATALOG);
        })
        .await;
    let signature = server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/brokers.json.sig");
            then.status(200).body(signature_file(CATALOG.as_bytes()));
        })
        .await;
    let revalidate = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/brokers.json")
                .header("If-None-Match", "\"rev-7\"");
            then.status(304);
        })
        .await;

    let loader = loader(&server, &cache);
    assert_eq!(loader.load_catalog_with_tier().0, Tier::Embedded);

    let outcome = loader.fetch_and_verify_detailed().await.unwrap();
    match &outcome {
        RefreshOutcome::Updated { key_id, etag, .. } => {
            assert_eq!(key_id, &KeyId::new("e2e"));
            assert_eq!(etag.as_deref(), Some("\"rev-7\""));
        }
        other => panic!("expected an update, got {other:?}"),
    }
    assert_eq!(outcome.records().len(), 3);

    // Cached bytes are exactly what was signed
    assert_eq!(
        std::fs::read(cache.path().join("brokers.json")).unwrap(),
        CATALOG.as_bytes()
    );
    let (tier, records) = loader.load_catalog_with_tier();
    assert_eq!(tier, Tier::Cache);
    assert_eq!(records.len(), 3);

    let second = loader.fetch_and_verify_detailed().await.unwrap();
    assert!(matches!(second, RefreshOutcome::Unmodified { .. }));

    first_fetch.assert_hits_async(1).await;
    signature.assert_hits_async(1).await;
    revalidate.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_bad_signature_from_server_is_rejected() {
    let server = MockServer::start_async().await;
    let cache = TempDir::new().unwrap();

    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/brokers.json");
            then.status(200).header("ETag", "\"rev-8\"").body(CATALOG);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/brokers.json.sig");
            then.status(200).body(signature_file(b"some other payload"));
        })
        .await;

    let loader = loader(&server, &cache);
    let err = loader.fetch_and_verify_detailed().await.unwrap_err();

    assert!(err.is_rejection());
    assert!(!cache.path().join("brokers.json").exists());
    assert_eq!(loader.refresh_catalog().await.len(), 8);
}

#[tokio::test]
async fn test_server_error_skips_signature_and_falls_back() {
    let server = MockServer::start_async().await;
    let cache = TempDir::new().unwrap();

    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/brokers.json");
            then.status(502);
        })
        .await;
    let signature = server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/brokers.json.sig");
            then.status(200).body("unused");
        })
        .await;

    let loader = loader(&server, &cache);
    assert!(matches!(
        loader.fetch_and_verify_detailed().await,
        Err(RefreshError::Transport(_))
    ));
    assert_eq!(loader.fetch_and_verify().await, None);
    signature.assert_hits_async(0).await;

    // Transport failures leave the throttle open for the scheduler's backoff
    assert!(loader.should_update());
}

#[tokio::test]
async fn test_slow_server_hits_deadline() {
    let server = MockServer::start_async().await;
    let cache = TempDir::new().unwrap();

    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/brokers.json");
            then.status(200)
                .delay(Duration::from_millis(1500))
                .body(CATALOG);
        })
        .await;

    let loader = loader(&server, &cache);
    let result = loader
        .fetch_and_verify_with_deadline(Duration::from_millis(100))
        .await;

    assert_eq!(result, Err(RefreshError::Cancelled));
    assert!(!cache.path().join("brokers.json").exists());
}

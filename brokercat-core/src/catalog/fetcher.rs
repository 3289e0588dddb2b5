//! Remote fetcher - conditional GET of the catalog and its signature
//!
//! The trait is the seam between the loader and the network:
//! - `HttpFetcher` (reqwest, behind the `http` feature)
//! - Mock fetchers in tests

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Largest signature file accepted
pub const MAX_SIGNATURE_BYTES: usize = 4 * 1024;

/// Largest catalog payload accepted
pub const MAX_CATALOG_BYTES: usize = 1024 * 1024;

/// Network failures; always recovered by falling back to local tiers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request to {url} timed out")]
    Timeout { url: String },

    /// Any status other than 200, or 304 for a conditional request
    #[error("Unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Invalid response body from {url}: {message}")]
    Body { url: String, message: String },
}

/// Result of a conditional catalog request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The server confirmed the supplied ETag is current (HTTP 304)
    Unmodified,
    /// A new payload (HTTP 200)
    Fetched { body: Vec<u8>, etag: Option<String> },
}

/// Trait for catalog transports
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// GET `url`, sending `If-None-Match` when `etag` is supplied
    async fn fetch_conditional(
        &self,
        url: &str,
        etag: Option<&str>,
        timeout: Duration,
    ) -> Result<FetchOutcome, TransportError>;

    /// GET the detached signature file at `url`
    async fn fetch_signature(&self, url: &str, timeout: Duration)
        -> Result<Vec<u8>, TransportError>;

    /// Fetcher identifier for logging
    fn name(&self) -> &'static str;
}

/// Scripted fetcher for testing
#[cfg(test)]
pub struct MockFetcher {
    pub catalog: std::sync::Mutex<Result<FetchOutcome, TransportError>>,
    pub signature: std::sync::Mutex<Result<Vec<u8>, TransportError>>,
    /// Applied before the catalog response
    pub delay: Duration,
    pub catalog_calls: std::sync::atomic::AtomicUsize,
    pub signature_calls: std::sync::atomic::AtomicUsize,
    pub etags_seen: std::sync::Mutex<Vec<Option<String>>>,
}

#[cfg(test)]
impl MockFetcher {
    fn with(
        catalog: Result<FetchOutcome, TransportError>,
        signature: Result<Vec<u8>, TransportError>,
    ) -> Self {
        Self {
            catalog: std::sync::Mutex::new(catalog),
            signature: std::sync::Mutex::new(signature),
            delay: Duration::ZERO,
            catalog_calls: Default::default(),
            signature_calls: Default::default(),
            etags_seen: Default::default(),
        }
    }

    /// Every request fails as if the network were down
    pub fn unreachable() -> Self {
        let down = |url: &str| TransportError::Request {
            url: url.to_string(),
            message: "network unreachable".to_string(),
        };
        Self::with(
            Err(down("mock://brokers.json")),
            Err(down("mock://brokers.json.sig")),
        )
    }

    /// Serve `body` with `etag`, and `signature` for the signature file
    pub fn serving(body: &[u8], etag: Option<&str>, signature: &[u8]) -> Self {
        Self::with(
            Ok(FetchOutcome::Fetched {
                body: body.to_vec(),
                etag: etag.map(str::to_string),
            }),
            Ok(signature.to_vec()),
        )
    }

    /// Answer every catalog request with 304
    pub fn unmodified() -> Self {
        Self::with(
            Ok(FetchOutcome::Unmodified),
            Err(TransportError::Status {
                url: "mock://brokers.json.sig".to_string(),
                status: 500,
            }),
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn catalog_calls(&self) -> usize {
        self.catalog_calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn signature_calls(&self) -> usize {
        self.signature_calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn etags_seen(&self) -> Vec<Option<String>> {
        self.etags_seen.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl RemoteFetcher for MockFetcher {
    async fn fetch_conditional(
        &self,
        _url: &str,
        etag: Option<&str>,
        _timeout: Duration,
    ) -> Result<FetchOutcome, TransportError> {
        self.catalog_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.etags_seen.lock().unwrap().push(etag.map(str::to_string));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.catalog.lock().unwrap().clone()
    }

    async fn fetch_signature(
        &self,
        _url: &str,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.signature_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.signature.lock().unwrap().clone()
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(feature = "http")]
pub use http::HttpFetcher;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use reqwest::header::{ETAG, IF_NONE_MATCH};
    use reqwest::StatusCode;
    use tracing::{debug, trace};

    /// reqwest-backed fetcher sharing one connection pool
    pub struct HttpFetcher {
        client: reqwest::Client,
    }

    impl HttpFetcher {
        /// Build a client with independent connect and read timeouts
        pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, TransportError> {
            let client = reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .read_timeout(read_timeout)
                .user_agent(concat!("brokercat/", env!("CARGO_PKG_VERSION")))
                .use_rustls_tls()
                .build()
                .map_err(|e| TransportError::Request {
                    url: String::new(),
                    message: format!("failed to create HTTP client: {e}"),
                })?;
            Ok(Self { client })
        }

        async fn get(
            &self,
            url: &str,
            etag: Option<&str>,
            timeout: Duration,
        ) -> Result<reqwest::Response, TransportError> {
            let mut request = self.client.get(url).timeout(timeout);
            if let Some(etag) = etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            request.send().await.map_err(|e| request_error(url, e))
        }
    }

    #[async_trait]
    impl RemoteFetcher for HttpFetcher {
        async fn fetch_conditional(
            &self,
            url: &str,
            etag: Option<&str>,
            timeout: Duration,
        ) -> Result<FetchOutcome, TransportError> {
            debug!("Fetching {} (If-None-Match: {:?})", url, etag);
            let response = self.get(url, etag, timeout).await?;

            match response.status() {
                StatusCode::NOT_MODIFIED if etag.is_some() => {
                    debug!("{} not modified", url);
                    Ok(FetchOutcome::Unmodified)
                }
                StatusCode::OK => {
                    let new_etag = response
                        .headers()
                        .get(ETAG)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let body = read_capped(url, response, MAX_CATALOG_BYTES).await?;
                    debug!("Fetched {} bytes from {} (ETag: {:?})", body.len(), url, new_etag);
                    Ok(FetchOutcome::Fetched {
                        body,
                        etag: new_etag,
                    })
                }
                status => Err(TransportError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                }),
            }
        }

        async fn fetch_signature(
            &self,
            url: &str,
            timeout: Duration,
        ) -> Result<Vec<u8>, TransportError> {
            let response = self.get(url, None, timeout).await?;
            if response.status() != StatusCode::OK {
                return Err(TransportError::Status {
                    url: url.to_string(),
                    status: response.status().as_u16(),
                });
            }
            read_capped(url, response, MAX_SIGNATURE_BYTES).await
        }

        fn name(&self) -> &'static str {
            "http"
        }
    }

    fn request_error(url: &str, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                url: url.to_string(),
            }
        } else {
            TransportError::Request {
                url: url.to_string(),
                message: e.to_string(),
            }
        }
    }

    /// Read the body, failing as soon as it grows past `limit`
    async fn read_capped(
        url: &str,
        mut response: reqwest::Response,
        limit: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let too_large = || TransportError::Body {
            url: url.to_string(),
            message: format!("body exceeds {limit} bytes"),
        };

        if response
            .content_length()
            .is_some_and(|len| len > limit as u64)
        {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    url: url.to_string(),
                }
            } else {
                TransportError::Body {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        })? {
            if body.len() + chunk.len() > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        trace!("Read {} bytes from {}", body.len(), url);
        Ok(body)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use httpmock::prelude::*;
        use pretty_assertions::assert_eq;

        const TIMEOUT: Duration = Duration::from_secs(5);

        fn sends_no_etag(req: &HttpMockRequest) -> bool {
            req.headers.as_ref().map_or(true, |headers| {
                !headers
                    .iter()
                    .any(|(name, _)| name.eq_ignore_ascii_case("if-none-match"))
            })
        }

        fn fetcher() -> HttpFetcher {
            HttpFetcher::new(Duration::from_secs(2), Duration::from_secs(2)).unwrap()
        }

        #[tokio::test]
        async fn test_fetch_returns_body_and_etag() {
            let server = MockServer::start_async().await;
            let mock = server
                .mock_async(|when, then| {
                    when.method(GET).path("/brokers.json").matches(sends_no_etag);
                    then.status(200).header("ETag", "\"v2\"").body("[]");
                })
                .await;

            let outcome = fetcher()
                .fetch_conditional(&server.url("/brokers.json"), None, TIMEOUT)
                .await
                .unwrap();

            mock.assert_async().await;
            assert_eq!(
                outcome,
                FetchOutcome::Fetched {
                    body: b"[]".to_vec(),
                    etag: Some("\"v2\"".to_string())
                }
            );
        }

        #[tokio::test]
        async fn test_conditional_request_sends_etag_and_maps_304() {
            let server = MockServer::start_async().await;
            let mock = server
                .mock_async(|when, then| {
                    when.method(GET)
                        .path("/brokers.json")
                        .header("If-None-Match", "\"v1\"");
                    then.status(304);
                })
                .await;

            let outcome = fetcher()
                .fetch_conditional(&server.url("/brokers.json"), Some("\"v1\""), TIMEOUT)
                .await
                .unwrap();

            mock.assert_async().await;
            assert_eq!(outcome, FetchOutcome::Unmodified);
        }

        #[tokio::test]
        async fn test_unconditional_304_is_an_error() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(GET).path("/brokers.json");
                    then.status(304);
                })
                .await;

            let err = fetcher()
                .fetch_conditional(&server.url("/brokers.json"), None, TIMEOUT)
                .await
                .unwrap_err();
            assert!(matches!(err, TransportError::Status { status: 304, .. }));
        }

        #[tokio::test]
        async fn test_server_error_maps_to_status() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(GET).path("/brokers.json");
                    then.status(503);
                })
                .await;

            let err = fetcher()
                .fetch_conditional(&server.url("/brokers.json"), Some("\"v1\""), TIMEOUT)
                .await
                .unwrap_err();
            assert_eq!(
                err,
                TransportError::Status {
                    url: server.url("/brokers.json"),
                    status: 503
                }
            );
        }

        #[tokio::test]
        async fn test_signature_fetch() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(GET).path("/brokers.json.sig");
                    then.status(200).body("untrusted comment: x\nAAAA\n");
                })
                .await;

            let body = fetcher()
                .fetch_signature(&server.url("/brokers.json.sig"), TIMEOUT)
                .await
                .unwrap();
            assert_eq!(body, b"untrusted comment: x\nAAAA\n".to_vec());
        }

        #[tokio::test]
        async fn test_missing_signature_is_status_error() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(GET).path("/brokers.json.sig");
                    then.status(404);
                })
                .await;

            let err = fetcher()
                .fetch_signature(&server.url("/brokers.json.sig"), TIMEOUT)
                .await
                .unwrap_err();
            assert!(matches!(err, TransportError::Status { status: 404, .. }));
        }

        #[tokio::test]
        async fn test_oversized_signature_rejected() {
            let server = MockServer::start_async().await;
            let oversized = "A".repeat(MAX_SIGNATURE_BYTES + 1);
            server
                .mock_async(|when, then| {
                    when.method(GET).path("/brokers.json.sig");
                    then.status(200).body(&oversized);
                })
                .await;

            let err = fetcher()
                .fetch_signature(&server.url("/brokers.json.sig"), TIMEOUT)
                .await
                .unwrap_err();
            assert!(matches!(err, TransportError::Body { .. }));
        }

        #[tokio::test]
        async fn test_unreachable_host_is_request_error() {
            // Port 9 on loopback has no listener in the test environment
            let err = fetcher()
                .fetch_conditional("http://127.0.0.1:9/brokers.json", None, TIMEOUT)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                TransportError::Request { .. } | TransportError::Timeout { .. }
            ));
        }
    }
}

//! Synchronous-style REST interface keyed by an API key.
//!
//! Requests are `GET <base>/<path>?apiKey=<key>` with the key form-encoded;
//! JSON bodies come back as [`serde_json::Value`]. A non-2xx answer is a
//! Protocol fault carrying the status, reason phrase and body. A transport
//! failure on a bound interface is a Port fault; only `connect` raises
//! Connection faults.

use crate::endpoint::{Binding, ConnectionState, Endpoint};
use crate::error::{FaultKind, FaultOrigin, FaultResult, ResponseDetail};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Span};

/// Default bound on a single HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Join `base` and `path` with exactly one slash and drop any trailing slash.
pub fn join_url(base: &str, path: &str) -> String {
    let joined = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    joined.trim_end_matches('/').to_string()
}

/// `scheme://host[:port]` of `url`.
pub(crate) fn url_root(url: &str, origin: &FaultOrigin) -> FaultResult<String> {
    let parsed = Url::parse(url).map_err(|e| origin.wrap(FaultKind::Parameter, format!("invalid URL: {}", url), e))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| origin.parameter(format!("URL has no host: {}", url)))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

/// Send `request` and decode the JSON answer, mapping failures onto faults.
///
/// Callers hold a bound client, so a transport failure here is a Port fault.
pub(crate) async fn send_json(request: RequestBuilder, url: &str, origin: &FaultOrigin, span: &Span) -> FaultResult<Value> {
    let response = request
        .send()
        .await
        .map_err(|e| origin.wrap(FaultKind::Port, format!("GET {} failed", url), e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| origin.wrap(FaultKind::Protocol, format!("failed to read response body from {}", url), e))?;

    if !status.is_success() {
        warn!(parent: span, status = status.as_u16(), url, "request rejected");
        return Err(origin
            .protocol(format!("Error in GET command: {}", url))
            .with_response(ResponseDetail {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
                body,
            }));
    }

    let value: Value = serde_json::from_str(&body)
        .map_err(|e| origin.wrap(FaultKind::Protocol, format!("response from {} is not JSON", url), e))?;
    debug!(parent: span, url, response = %value, "response");
    Ok(value)
}

/// REST endpoint authenticated by an `apiKey` query parameter.
pub struct RestInterface {
    base_url: String,
    api_key: String,
    request_timeout: Duration,
    origin: FaultOrigin,
    binding: Binding<Client>,
    span: Span,
}

impl RestInterface {
    /// Interface on `base_url` using `api_key`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let span = info_span!("rest", base_url = %base_url);
        Self {
            base_url,
            api_key: api_key.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            origin: FaultOrigin::new("RESTAPIInterface"),
            binding: Binding::new(),
            span,
        }
    }

    /// Bound on every request.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Replace the tracing span this interface logs under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Base URL as configured.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full request URL for `path`, including the encoded key.
    pub fn request_url(&self, path: &str) -> FaultResult<Url> {
        let url = join_url(&self.base_url, path);
        Url::parse_with_params(&url, &[("apiKey", self.api_key.as_str())])
            .map_err(|e| self.origin.wrap(FaultKind::Parameter, format!("invalid URL: {}", url), e))
    }

    /// GET `path` and return the decoded JSON body.
    pub async fn get(&self, path: &str) -> FaultResult<Value> {
        self.get_with(path, &[]).await
    }

    /// GET `path` with extra query parameters.
    pub async fn get_with(&self, path: &str, params: &[(&str, &str)]) -> FaultResult<Value> {
        let client = self.binding.get(&self.origin)?;
        let url = self.request_url(path)?;
        debug!(parent: &self.span, path, "GET");
        let mut request = client.get(url.clone());
        if !params.is_empty() {
            request = request.query(params);
        }
        send_json(request, url.as_str(), &self.origin, &self.span).await
    }
}

#[async_trait]
impl Endpoint for RestInterface {
    fn identity(&self) -> &str {
        self.origin.identity()
    }

    fn state(&self) -> ConnectionState {
        self.binding.state()
    }

    async fn bind(&mut self) -> FaultResult<()> {
        let root = url_root(&self.base_url, &self.origin)?;
        info!(parent: &self.span, url = %root, "connecting");
        let client = Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| self.origin.wrap(FaultKind::Connection, "failed to build HTTP client", e))?;

        // Any HTTP answer proves the host is reachable
        client.head(&root).send().await.map_err(|e| {
            self.origin
                .wrap(FaultKind::Connection, format!("Error connecting to the interface via URL: {}", root), e)
        })?;

        self.binding.bind(client);
        Ok(())
    }

    async fn release(&mut self) {
        info!(parent: &self.span, "disconnecting");
        self.binding.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url_normalises_slashes() {
        assert_eq!(join_url("https://api.example.com/v2", "devices/M9RDJA"), "https://api.example.com/v2/devices/M9RDJA");
        assert_eq!(join_url("https://api.example.com/v2/", "/devices/"), "https://api.example.com/v2/devices");
    }

    #[test]
    fn test_request_url_appends_key() {
        let rest = RestInterface::new("https://api.example.com/rest/api/v2/", "abc123");
        assert_eq!(
            rest.request_url("devices/X1/").unwrap().as_str(),
            "https://api.example.com/rest/api/v2/devices/X1?apiKey=abc123"
        );
    }

    #[test]
    fn test_request_url_encodes_key() {
        let rest = RestInterface::new("https://api.example.com/v2", "a&b=c d#e");
        let url = rest.request_url("devices").unwrap();
        assert_eq!(url.query(), Some("apiKey=a%26b%3Dc+d%23e"));
        assert_eq!(url.query_pairs().next().unwrap().1, "a&b=c d#e");

        let bad = RestInterface::new("not a url", "k");
        assert_eq!(bad.request_url("x").unwrap_err().kind, FaultKind::Parameter);
    }

    #[test]
    fn test_url_root_keeps_port() {
        let origin = FaultOrigin::new("t");
        assert_eq!(url_root("http://127.0.0.1:8080/api/v1", &origin).unwrap(), "http://127.0.0.1:8080");
        assert_eq!(url_root("https://example.com/a", &origin).unwrap(), "https://example.com");
        assert_eq!(url_root("not a url", &origin).unwrap_err().kind, FaultKind::Parameter);
    }

    #[tokio::test]
    async fn test_get_before_connect_is_connection_fault() {
        let rest = RestInterface::new("http://127.0.0.1:9", "k");
        let err = rest.get("devices").await.unwrap_err();
        assert_eq!(err.kind, FaultKind::Connection);
        assert_eq!(err.origin, "RESTAPIInterface");
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut rest = RestInterface::new(format!("http://{}/api", addr), "k")
            .with_request_timeout(Duration::from_secs(2));
        let err = rest.connect().await.unwrap_err();
        assert_eq!(err.kind, FaultKind::Connection);
        assert!(!rest.is_connected());
    }
}

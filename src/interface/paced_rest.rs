//! Rate-limited REST interface for cloud APIs that throttle clients
//! (e.g. "1 request / 1 s", answered with HTTP 429 when exceeded).
//!
//! Credentials are resolved once at construction through a [`CredentialSource`]
//! and attached to every request, either as basic auth or as a query parameter.

use crate::endpoint::{Binding, ConnectionState, Endpoint};
use crate::error::{FaultKind, FaultOrigin, FaultResult};
use crate::interface::rest::{join_url, send_json, DEFAULT_REQUEST_TIMEOUT};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Span};

/// Default minimum spacing between two requests.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// How requests authenticate.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Key passed as a query parameter.
    ApiKey {
        /// Query parameter name, e.g. `apiKey`
        param: String,
        /// Key value
        value: String,
    },
    /// HTTP basic authentication.
    Basic {
        /// Login id
        user: String,
        /// Password
        password: String,
    },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::ApiKey { param, .. } => f.debug_struct("ApiKey").field("param", param).finish_non_exhaustive(),
            Credential::Basic { user, .. } => f.debug_struct("Basic").field("user", user).finish_non_exhaustive(),
        }
    }
}

/// Supplies credentials by service name.
pub trait CredentialSource: Send + Sync {
    /// Credential for `service`, or `None` if not configured.
    fn credential(&self, service: &str) -> Option<Credential>;
}

/// Enforces a minimum interval between consecutive requests.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    /// Pacer allowing one request per `min_interval`.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Configured spacing.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until a request may be issued and claim the slot.
    pub async fn pace(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

impl Default for RequestPacer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

/// REST endpoint with request pacing and credential injection.
pub struct PacedRestInterface {
    base_url: String,
    credential: Credential,
    probe_path: String,
    probe_params: Vec<(String, String)>,
    request_timeout: Duration,
    pacer: RequestPacer,
    origin: FaultOrigin,
    binding: Binding<Client>,
    span: Span,
}

impl PacedRestInterface {
    /// Interface named `service` on `base_url`, with credentials looked up in `credentials`.
    ///
    /// Missing credentials are a Parameter fault.
    pub fn new(
        service: impl Into<String>,
        base_url: impl Into<String>,
        credentials: &dyn CredentialSource,
    ) -> FaultResult<Self> {
        let service = service.into();
        let origin = FaultOrigin::new(service.clone());
        let credential = credentials
            .credential(&service)
            .ok_or_else(|| origin.parameter(format!("no credentials configured for '{}'", service)))?;
        let base_url = base_url.into();
        let span = info_span!("paced_rest", service = %service, base_url = %base_url);
        Ok(Self {
            base_url,
            credential,
            probe_path: String::new(),
            probe_params: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            pacer: RequestPacer::default(),
            origin,
            binding: Binding::new(),
            span,
        })
    }

    /// Path (and parameters) fetched by `connect` to prove the credentials work.
    pub fn with_probe(mut self, path: impl Into<String>, params: &[(&str, &str)]) -> Self {
        self.probe_path = path.into();
        self.probe_params = params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self
    }

    /// Minimum spacing between requests.
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.pacer = RequestPacer::new(min_interval);
        self
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

    /// The pacer shared by every request of this interface.
    pub fn pacer(&self) -> &RequestPacer {
        &self.pacer
    }

    async fn request(&self, client: &Client, path: &str, params: &[(&str, &str)]) -> FaultResult<Value> {
        let url = join_url(&self.base_url, path);
        self.pacer.pace().await;
        debug!(parent: &self.span, url = %url, ?params, "GET");

        let mut request = client.get(&url);
        request = match &self.credential {
            Credential::Basic { user, password } => request.basic_auth(user, Some(password)),
            Credential::ApiKey { param, value } => request.query(&[(param.as_str(), value.as_str())]),
        };
        if !params.is_empty() {
            request = request.query(params);
        }
        send_json(request, &url, &self.origin, &self.span).await
    }

    /// Paced, authenticated GET.
    pub async fn get(&self, path: &str, params: &[(&str, &str)]) -> FaultResult<Value> {
        let client = self.binding.get(&self.origin)?;
        self.request(client, path, params).await
    }
}

#[async_trait]
impl Endpoint for PacedRestInterface {
    fn identity(&self) -> &str {
        self.origin.identity()
    }

    fn state(&self) -> ConnectionState {
        self.binding.state()
    }

    async fn bind(&mut self) -> FaultResult<()> {
        info!(parent: &self.span, probe = %self.probe_path, "connecting");
        let client = Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| self.origin.wrap(FaultKind::Connection, "failed to build HTTP client", e))?;

        let params: Vec<(&str, &str)> = self.probe_params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        if let Err(fault) = self.request(&client, &self.probe_path, &params).await {
            return Err(self.origin.could_not_connect("authenticated probe request failed", &fault));
        }

        self.binding.bind(client);
        Ok(())
    }

    async fn release(&mut self) {
        info!(parent: &self.span, "disconnecting");
        self.binding.take();
    }
}

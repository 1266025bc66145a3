// Client construction and the caller-facing request contract.
//
// Backend choice is a tagged variant resolved once at construction: a
// `direct` client builds raw connections itself, a `session` client wraps a
// pre-authenticated `reqwest::Client`. Each constructor accepts only the
// options its backend understands, so there is no "ignored option" case to
// warn about at runtime.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::error;
use url::Url;

use crate::direct::{DirectClient, DirectOptions};
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::negotiate::VERSION_HEADER;
use crate::portgroup::PortgroupManager;
use crate::response::{Body, Response};
use crate::retry::RetryPolicy;
use crate::session::SessionClient;
use crate::version::{ApiVersion, ApiVersionSelectState, DEFAULT_API_VERSION, VersionCache, VersionState};

/// `User-Agent` sent on every request.
pub(crate) const USER_AGENT_STRING: &str = concat!("foundry-client/", env!("CARGO_PKG_VERSION"));

/// Auth token header, filled in when a token was supplied at construction.
pub(crate) const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// Redirect hop limit default: generously high, so behavior matches
/// servers that chain a few hops, while still bounding a redirect loop.
pub(crate) const DEFAULT_MAX_REDIRECTS: usize = 30;

/// State and policy shared by both backends: the resolved endpoint, header
/// defaults, retry policy, and the per-instance version-negotiation state.
pub(crate) struct Common {
    pub(crate) endpoint: Endpoint,
    /// Pre-validated `X-Auth-Token` value, marked sensitive.
    token: Option<HeaderValue>,
    pub(crate) retry: RetryPolicy,
    pub(crate) max_redirects: usize,
    pub(crate) cache: Option<Arc<dyn VersionCache>>,
    pub(crate) state: RwLock<VersionState>,
}

impl Common {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        endpoint: Endpoint,
        token: Option<HeaderValue>,
        retry: RetryPolicy,
        max_redirects: usize,
        cache: Option<Arc<dyn VersionCache>>,
        select: ApiVersionSelectState,
        version: Option<ApiVersion>,
    ) -> Self {
        Self {
            endpoint,
            token,
            retry,
            max_redirects,
            cache,
            state: RwLock::new(VersionState { select, version }),
        }
    }

    pub(crate) fn current_version(&self) -> Option<ApiVersion> {
        self.state.read().expect("version state lock poisoned").version
    }

    pub(crate) fn select_state(&self) -> ApiVersionSelectState {
        self.state.read().expect("version state lock poisoned").select
    }

    /// Fill in default headers without overriding anything the caller set
    /// explicitly.
    pub(crate) fn apply_default_headers(&self, headers: &mut HeaderMap) {
        headers
            .entry(USER_AGENT)
            .or_insert(HeaderValue::from_static(USER_AGENT_STRING));
        if !headers.contains_key(VERSION_HEADER) {
            if let Some(version) = self.current_version() {
                headers.insert(HeaderName::from_static(VERSION_HEADER), version_value(version));
            }
        }
        if let Some(token) = &self.token {
            if !headers.contains_key(AUTH_TOKEN_HEADER) {
                headers.insert(HeaderName::from_static(AUTH_TOKEN_HEADER), token.clone());
            }
        }
    }
}

/// Header value for a version string.
pub(crate) fn version_value(version: ApiVersion) -> HeaderValue {
    HeaderValue::from_str(&version.to_string())
        .expect("a major.minor version is a valid header value")
}

/// Reduce a `Location` value to a request path: absolute URLs are stripped
/// to path + query, since the connection parameters (host, port) are fixed
/// at construction.
pub(crate) fn location_path(location: &str) -> String {
    if let Ok(url) = Url::parse(location) {
        if matches!(url.scheme(), "http" | "https") {
            let mut path = url.path().to_owned();
            if let Some(query) = url.query() {
                path.push('?');
                path.push_str(query);
            }
            return path;
        }
    }
    location.to_owned()
}

enum Backend {
    Direct(DirectClient),
    Session(SessionClient),
}

/// Client for the Foundry REST API.
///
/// Construct with [`Client::direct`] (the raw-socket backend, which manages
/// its own connections and TLS) or [`Client::with_session`] (a pre-built
/// `reqwest::Client` carrying its own auth/pooling). Both expose the same
/// request contract and behave identically from the caller's perspective.
///
/// A client is cheap to share behind an `Arc`, but version negotiation
/// mutates per-instance state: issue requests from one logical caller at a
/// time, or negotiation racing concurrent requests may interleave version
/// headers.
pub struct Client {
    backend: Backend,
}

impl Client {
    /// Build a client on the raw-socket backend.
    pub fn direct(endpoint: impl Into<String>, options: DirectOptions) -> ClientBuilder {
        ClientBuilder::new(endpoint.into(), BackendKind::Direct(options))
    }

    /// Build a client on a pre-built session.
    ///
    /// The session must have automatic redirect following disabled
    /// (`reqwest::redirect::Policy::none()`); the client follows redirects
    /// itself, preserving method and body. TLS, timeouts, and pooling are
    /// whatever the session was built with.
    pub fn with_session(endpoint: impl Into<String>, session: reqwest::Client) -> ClientBuilder {
        ClientBuilder::new(endpoint.into(), BackendKind::Session(session))
    }

    fn common(&self) -> &Common {
        match &self.backend {
            Backend::Direct(client) => client.common(),
            Backend::Session(client) => client.common(),
        }
    }

    /// The resolved endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.common().endpoint
    }

    /// The currently active API version (pinned, cached, or negotiated).
    pub fn api_version(&self) -> Option<ApiVersion> {
        self.common().current_version()
    }

    /// How the active API version was selected.
    pub fn version_select_state(&self) -> ApiVersionSelectState {
        self.common().select_state()
    }

    async fn http_request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<(Response, Body), Error> {
        match &self.backend {
            Backend::Direct(client) => client.http_request(method, url, headers, body).await,
            Backend::Session(client) => client.http_request(method, url, headers, body).await,
        }
    }

    /// Issue a JSON request and decode the JSON response.
    ///
    /// Returns an empty list value for 204/205 responses and responses with
    /// no content type, `null` for non-JSON content, and -- when a body
    /// claims to be JSON but does not parse -- the raw body as a string
    /// (logged at error level, never a hard failure).
    pub async fn json_request(
        &self,
        method: Method,
        url: &str,
        headers: Option<HeaderMap>,
        body: Option<&Value>,
    ) -> Result<(Response, Value), Error> {
        let mut headers = headers.unwrap_or_default();
        headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));
        headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("application/json"));

        let body = match body {
            Some(value) => Some(Bytes::from(serde_json::to_vec(value).map_err(|e| {
                Error::InvalidAttribute(format!("request body is not serializable: {e}"))
            })?)),
            None => None,
        };

        let (response, mut body) = self.http_request(method, url, headers, body).await?;

        let status = response.status().as_u16();
        let content_type = response.content_type().map(str::to_owned);
        let Some(content_type) = content_type else {
            return Ok((response, Value::Array(Vec::new())));
        };
        if status == 204 || status == 205 {
            return Ok((response, Value::Array(Vec::new())));
        }

        let decoded = if content_type.contains("application/json") {
            let text = body.drain_string().await?;
            match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => {
                    error!("could not decode response body as JSON: {e}");
                    Value::String(text)
                }
            }
        } else {
            Value::Null
        };
        Ok((response, decoded))
    }

    /// Issue a request and hand back the raw body chunk stream.
    pub async fn raw_request(
        &self,
        method: Method,
        url: &str,
        headers: Option<HeaderMap>,
        body: Option<Bytes>,
    ) -> Result<(Response, Body), Error> {
        let mut headers = headers.unwrap_or_default();
        headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/octet-stream"));
        self.http_request(method, url, headers, body).await
    }

    /// Port-group resource manager.
    pub fn portgroups(&self) -> PortgroupManager<'_> {
        PortgroupManager::new(self)
    }
}

enum BackendKind {
    Direct(DirectOptions),
    Session(reqwest::Client),
}

/// Options shared by both backends. Created via [`Client::direct`] or
/// [`Client::with_session`].
pub struct ClientBuilder {
    endpoint: String,
    kind: BackendKind,
    select: ApiVersionSelectState,
    version: ApiVersion,
    token: Option<SecretString>,
    retry: RetryPolicy,
    max_redirects: usize,
    cache: Option<Arc<dyn VersionCache>>,
}

impl ClientBuilder {
    fn new(endpoint: String, kind: BackendKind) -> Self {
        Self {
            endpoint,
            kind,
            select: ApiVersionSelectState::Default,
            version: DEFAULT_API_VERSION,
            token: None,
            retry: RetryPolicy::default(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            cache: None,
        }
    }

    /// Pin an explicit API version. A server that rejects it fails with
    /// `UnsupportedVersion` instead of negotiating downward.
    pub fn api_version(mut self, version: ApiVersion) -> Self {
        self.version = version;
        self.select = ApiVersionSelectState::User;
        self
    }

    /// Start from a previously cached negotiated version. The client may
    /// still renegotiate once if the server rejects it.
    pub fn cached_version(mut self, version: ApiVersion) -> Self {
        self.version = version;
        self.select = ApiVersionSelectState::Cached;
        self
    }

    /// Auth token sent as `X-Auth-Token` on every request.
    pub fn auth_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn max_redirects(mut self, limit: usize) -> Self {
        self.max_redirects = limit;
        self
    }

    /// Store where negotiated versions are persisted, keyed by host:port.
    pub fn version_cache(mut self, cache: Arc<dyn VersionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<Client, Error> {
        let endpoint = Endpoint::parse(&self.endpoint)?;

        let token = match &self.token {
            Some(token) => {
                let mut value = HeaderValue::from_str(token.expose_secret()).map_err(|_| {
                    Error::Endpoint("auth token is not a valid header value".to_owned())
                })?;
                value.set_sensitive(true);
                Some(value)
            }
            None => None,
        };

        let common = Common::new(
            endpoint,
            token,
            self.retry,
            self.max_redirects,
            self.cache,
            self.select,
            Some(self.version),
        );

        let backend = match self.kind {
            BackendKind::Direct(options) => Backend::Direct(DirectClient::new(common, options)?),
            BackendKind::Session(session) => Backend::Session(SessionClient::new(common, session)),
        };
        Ok(Client { backend })
    }
}

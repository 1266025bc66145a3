use thiserror::Error;

/// Top-level error type for the `foundry-client` crate.
///
/// Covers endpoint resolution, transport-level failures, API version
/// negotiation, and HTTP error translation. The transient variants
/// ([`Conflict`](Self::Conflict), [`ServiceUnavailable`](Self::ServiceUnavailable),
/// [`ConnectionRefused`](Self::ConnectionRefused)) are the only ones the retry
/// wrapper will re-attempt.
#[derive(Debug, Error)]
pub enum Error {
    // ── Construction ────────────────────────────────────────────────
    /// Endpoint URL could not be used (unsupported scheme, missing host).
    #[error("unsupported endpoint: {0}")]
    Endpoint(String),

    /// An API version string did not parse as `major.minor`.
    #[error("invalid API version {0:?} (expected \"major.minor\")")]
    InvalidVersion(String),

    /// TLS material could not be loaded or the client policy could not be built.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Transport ───────────────────────────────────────────────────
    /// Name resolution failed for the endpoint host.
    #[error("error finding address for {host}: {message}")]
    EndpointNotFound { host: String, message: String },

    /// Socket-level failure or timeout while talking to the server.
    #[error("error communicating with {endpoint}: {message}")]
    ConnectionRefused { endpoint: String, message: String },

    // ── HTTP status translation ─────────────────────────────────────
    /// HTTP 409 -- the server reported a conflicting operation in progress.
    #[error("conflict (HTTP 409): {message}")]
    Conflict { message: String },

    /// HTTP 503 -- the service is temporarily unable to handle the request.
    #[error("service unavailable (HTTP 503): {message}")]
    ServiceUnavailable { message: String },

    /// HTTP 300 -- the server returned multiple choices for the request and
    /// the client cannot pick one automatically.
    #[error("{method} {url} returned HTTP 300: ambiguous endpoint")]
    AmbiguousEndpoint { method: String, url: String },

    /// Any other 4xx/5xx, carrying the server's structured fault detail
    /// when the body provided one.
    #[error("{method} {url} returned HTTP {status}: {}", .faultstring.as_deref().unwrap_or("(no fault detail)"))]
    Status {
        status: u16,
        faultstring: Option<String>,
        debuginfo: Option<String>,
        method: String,
        url: String,
    },

    // ── Version negotiation ─────────────────────────────────────────
    /// The server does not support the requested API version and
    /// negotiation is not possible (version pinned by the caller, already
    /// negotiated once, or no version range advertised).
    #[error(
        "requested API version {requested} is not supported by the server or \
         the requested operation is not supported by that version; supported \
         version range is {min} to {max}"
    )]
    UnsupportedVersion {
        requested: String,
        min: String,
        max: String,
    },

    // ── Redirects ───────────────────────────────────────────────────
    /// The redirect chain exceeded the configured hop limit.
    #[error("stopped following redirects after {limit} hops (last location: {url})")]
    TooManyRedirects { limit: usize, url: String },

    // ── Resource glue ───────────────────────────────────────────────
    /// A resource manager was handed an attribute the API does not accept.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// A success payload did not have the shape a resource manager
    /// expected, with the raw body for debugging.
    #[error("deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient failure the retry wrapper
    /// may re-attempt (bounded by the client's [`RetryPolicy`]).
    ///
    /// [`RetryPolicy`]: crate::retry::RetryPolicy
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::ServiceUnavailable { .. } | Self::ConnectionRefused { .. }
        )
    }

    /// Translate an HTTP error status into the matching variant.
    ///
    /// `faultstring`/`debuginfo` come from the structured error envelope when
    /// the body carried one (see [`extract_error_json`]); both degrade to
    /// `None` for malformed or binary bodies.
    pub(crate) fn from_response(
        status: u16,
        faultstring: Option<String>,
        debuginfo: Option<String>,
        method: &str,
        url: &str,
    ) -> Self {
        match status {
            300 => Self::AmbiguousEndpoint {
                method: method.to_owned(),
                url: url.to_owned(),
            },
            409 => Self::Conflict {
                message: faultstring.unwrap_or_else(|| format!("{method} {url}")),
            },
            503 => Self::ServiceUnavailable {
                message: faultstring.unwrap_or_else(|| format!("{method} {url}")),
            },
            _ => Self::Status {
                status,
                faultstring,
                debuginfo,
                method: method.to_owned(),
                url: url.to_owned(),
            },
        }
    }
}

// ── Structured error bodies ──────────────────────────────────────────

#[derive(serde::Deserialize)]
struct ErrorEnvelope {
    error_message: Option<String>,
}

#[derive(serde::Deserialize)]
struct FaultDetail {
    #[serde(default)]
    faultstring: Option<String>,
    #[serde(default)]
    debuginfo: Option<String>,
}

/// Pull `faultstring`/`debuginfo` out of a structured error body.
///
/// The server nests JSON inside JSON: the outer envelope's `error_message`
/// field is itself a JSON document. A body that is malformed at either level
/// yields `(None, None)` -- the caller then reports a status-only error.
pub(crate) fn extract_error_json(body: &str) -> (Option<String>, Option<String>) {
    let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) else {
        return (None, None);
    };
    let Some(raw) = envelope.error_message else {
        return (None, None);
    };
    match serde_json::from_str::<FaultDetail>(&raw) {
        Ok(detail) => (detail.faultstring, detail.debuginfo),
        Err(_) => (None, None),
    }
}

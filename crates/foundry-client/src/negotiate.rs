// API version negotiation.
//
// Triggered by an HTTP 406 on any request. Both executor variants compose
// against the `ProbeTransport` capability below instead of sharing a base
// type: each backend contributes only its "bare GET against the version
// root" adapter, while the state transitions, clamping math, and cache
// write live here in one place.

use reqwest::header::HeaderMap;
use tracing::debug;

use crate::client::Common;
use crate::error::Error;
use crate::version::{API_ROOT, ApiVersion, ApiVersionSelectState, clamp_negotiated};

/// Header carrying the version each request asks for.
pub(crate) const VERSION_HEADER: &str = "x-foundry-api-version";
/// Headers the server uses to advertise its supported range.
pub(crate) const MIN_VERSION_HEADER: &str = "x-foundry-api-minimum-version";
pub(crate) const MAX_VERSION_HEADER: &str = "x-foundry-api-maximum-version";

/// Extract the advertised `[min, max]` version range from response headers.
pub(crate) fn parse_version_headers(
    headers: &HeaderMap,
) -> (Option<ApiVersion>, Option<ApiVersion>) {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    };
    (get(MIN_VERSION_HEADER), get(MAX_VERSION_HEADER))
}

/// The one backend-specific piece of negotiation: issuing a supplementary
/// bare GET (no default headers) against a version-root path and returning
/// the response headers. Older servers only report their version range on
/// such a probe, not necessarily on the failing response itself.
pub(crate) trait ProbeTransport {
    async fn probe(&self, path: &str) -> Result<HeaderMap, Error>;
}

/// Negotiate a mutually supported API version after a 406.
///
/// On success the instance state moves to `Negotiated`, the active version
/// is replaced, and the result is persisted to the external version cache.
/// A pinned (`User`) version never negotiates, and a second 406 after a
/// successful negotiation fails terminally -- this is what bounds the
/// negotiate-and-replay loop in the executors.
pub(crate) async fn negotiate_version<P: ProbeTransport>(
    transport: &P,
    common: &Common,
    response_headers: &HeaderMap,
) -> Result<ApiVersion, Error> {
    let (select, pinned) = {
        let state = common.state.read().expect("version state lock poisoned");
        (state.select, state.version)
    };
    let requested = pinned.unwrap_or(crate::version::DEFAULT_API_VERSION);

    let (mut min, mut max) = parse_version_headers(response_headers);
    if max.is_none() {
        debug!("no version header in response, requesting from server");
        let root = match pinned {
            Some(version) => format!("/v{}", version.major),
            None => API_ROOT.to_owned(),
        };
        let probed = transport.probe(&root).await?;
        (min, max) = parse_version_headers(&probed);
    }

    let display = |v: Option<ApiVersion>| match v {
        Some(v) => v.to_string(),
        None => "unknown".to_owned(),
    };

    let (Some(min), Some(max)) = (min, max) else {
        // Even the probe did not advertise a range: the server predates
        // version negotiation entirely.
        return Err(Error::UnsupportedVersion {
            requested: requested.to_string(),
            min: display(min),
            max: display(max),
        });
    };

    match select {
        ApiVersionSelectState::User | ApiVersionSelectState::Negotiated => {
            Err(Error::UnsupportedVersion {
                requested: requested.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            })
        }
        ApiVersionSelectState::Default | ApiVersionSelectState::Cached => {
            let negotiated = clamp_negotiated(requested, min, max);
            {
                let mut state = common.state.write().expect("version state lock poisoned");
                state.select = ApiVersionSelectState::Negotiated;
                state.version = Some(negotiated);
            }
            debug!("negotiated API version is {negotiated}");
            if let Some(cache) = &common.cache {
                cache.save(common.endpoint.host(), common.endpoint.port(), negotiated);
            }
            Ok(negotiated)
        }
    }
}

// Endpoint resolution.
//
// An endpoint URL is parsed once at client construction into scheme, host,
// port, and a stable base path. A trailing `/v1` segment and trailing slash
// are stripped so that request paths (which carry their own `/v1` prefix)
// can be joined without doubling the version segment.

use url::Url;

use crate::error::Error;
use crate::version::API_ROOT;

/// URL scheme of an endpoint. Anything other than these two is rejected
/// at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// A resolved service endpoint. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
    base_path: String,
}

impl Endpoint {
    /// Parse an endpoint URL.
    ///
    /// Fails with [`Error::Endpoint`] if the scheme is neither `http` nor
    /// `https` or the URL has no host.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let url = Url::parse(raw).map_err(|e| Error::Endpoint(format!("{raw}: {e}")))?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(Error::Endpoint(format!("unsupported scheme: {other}")));
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| Error::Endpoint(format!("{raw}: missing host")))?
            .to_owned();
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self {
            scheme,
            host,
            port,
            base_path: trim_api_version(url.path()),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path prefix with any trailing `/v1` and slash removed. May be empty.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// `host:port`, as used for `Host` headers and log context.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Join a request path onto the base path, producing an origin-form
    /// request target such as `/baremetal/v1/portgroups`.
    pub(crate) fn request_path(&self, path: &str) -> String {
        format!("{}/{}", self.base_path, path.trim_start_matches('/'))
    }

    /// Absolute URL for a request path, for backends that address the
    /// server by URL rather than by connection.
    pub(crate) fn url_for(&self, path: &str) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme.as_str(),
            self.host,
            self.port,
            self.request_path(path)
        )
    }
}

/// Strip a trailing slash and a trailing API-version segment from an
/// endpoint path, producing the stable request-path prefix.
fn trim_api_version(path: &str) -> String {
    let path = path.trim_end_matches('/');
    path.strip_suffix(API_ROOT).unwrap_or(path).to_owned()
}

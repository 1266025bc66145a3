// Direct (raw socket) backend.
//
// Opens a fresh TCP (optionally tunneled, optionally TLS) connection per
// request attempt and speaks HTTP/1.1 over it through `wire`. This is the
// backend used when no pre-built session is supplied; it is the only place
// where TLS verification is assembled by hand (`tls::TlsPolicy`).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, LOCATION};
use reqwest::{Method, StatusCode};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::client::{Common, location_path, version_value};
use crate::endpoint::Scheme;
use crate::error::{Error, extract_error_json};
use crate::negotiate::{self, ProbeTransport};
use crate::response::{Body, Response};
use crate::retry::with_retries;
use crate::tls::{self, TlsPolicy};
use crate::wire::{self, IoStream};

/// Default per-operation socket timeout.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Construction parameters for the direct backend. Immutable per client;
/// read on every request to open a fresh connection.
#[derive(Debug, Clone)]
pub struct DirectOptions {
    /// Applied separately to connect, tunnel, TLS handshake, head read,
    /// and each body read. There is no overall request deadline.
    pub timeout: Duration,
    /// TLS policy, consulted only for `https` endpoints.
    pub tls: TlsPolicy,
    /// Optional HTTP CONNECT proxy to tunnel through, as `(host, port)`.
    pub tunnel: Option<(String, u16)>,
}

impl Default for DirectOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            tls: TlsPolicy::default(),
            tunnel: None,
        }
    }
}

pub(crate) struct DirectClient {
    common: Common,
    options: DirectOptions,
    /// Built once at construction; `None` for plain-http endpoints.
    tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl DirectClient {
    pub(crate) fn new(common: Common, options: DirectOptions) -> Result<Self, Error> {
        let tls_config = match common.endpoint.scheme() {
            Scheme::Https => Some(Arc::new(options.tls.client_config()?)),
            Scheme::Http => None,
        };
        Ok(Self {
            common,
            options,
            tls_config,
        })
    }

    pub(crate) fn common(&self) -> &Common {
        &self.common
    }

    fn refused(&self, message: impl Into<String>) -> Error {
        Error::ConnectionRefused {
            endpoint: self.common.endpoint.authority(),
            message: message.into(),
        }
    }

    /// Open a fresh connection to the endpoint (resolve, connect, tunnel,
    /// TLS). Name-resolution failures classify as `EndpointNotFound`;
    /// everything else as retryable `ConnectionRefused`.
    async fn open(&self) -> Result<Box<dyn IoStream>, Error> {
        let endpoint = &self.common.endpoint;
        let timeout = self.options.timeout;

        let (connect_host, connect_port) = match &self.options.tunnel {
            Some((host, port)) => (host.as_str(), *port),
            None => (endpoint.host(), endpoint.port()),
        };

        let addr = tokio::net::lookup_host((connect_host, connect_port))
            .await
            .map_err(|e| Error::EndpointNotFound {
                host: connect_host.to_owned(),
                message: e.to_string(),
            })?
            .next()
            .ok_or_else(|| Error::EndpointNotFound {
                host: connect_host.to_owned(),
                message: "no addresses resolved".to_owned(),
            })?;

        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| self.refused("connect timed out"))?
            .map_err(|e| self.refused(e.to_string()))?;

        if self.options.tunnel.is_some() {
            tokio::time::timeout(
                timeout,
                wire::establish_tunnel(&mut stream, &endpoint.authority()),
            )
            .await
            .map_err(|_| self.refused("tunnel setup timed out"))?
            .map_err(|e| self.refused(e.to_string()))?;
        }

        match &self.tls_config {
            Some(config) => {
                let stream =
                    tokio::time::timeout(timeout, tls::wrap(stream, endpoint.host(), config.clone()))
                        .await
                        .map_err(|_| self.refused("TLS handshake timed out"))?
                        .map_err(|e| self.refused(e.to_string()))?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(stream)),
        }
    }

    /// One connection, one request, one parsed response head.
    async fn exchange(
        &self,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<(wire::ResponseHead, BufReader<Box<dyn IoStream>>), Error> {
        let stream = self.open().await?;
        let mut reader = BufReader::new(stream);

        let io = async {
            wire::send_request(
                reader.get_mut(),
                method,
                target,
                &self.common.endpoint.authority(),
                headers,
                body,
            )
            .await?;
            wire::read_head(&mut reader).await
        };
        let head = tokio::time::timeout(self.options.timeout, io)
            .await
            .map_err(|_| self.refused("request timed out"))?
            .map_err(|e| self.refused(e.to_string()))?;

        Ok((head, reader))
    }

    /// A single logical request: follows redirects and drives version
    /// negotiation, but performs no retries (that is `with_retries`' job).
    async fn request_once(
        &self,
        method: Method,
        url: &str,
        mut headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<(Response, Body), Error> {
        self.common.apply_default_headers(&mut headers);
        let mut url = url.to_owned();
        let mut hops = 0usize;

        loop {
            let target = self.common.endpoint.request_path(&url);
            self.log_curl_request(&method, &target, &headers, body.as_deref());

            let (head, reader) = self
                .exchange(&method, &target, &headers, body.as_deref())
                .await?;

            if head.status == StatusCode::NOT_ACCEPTABLE {
                let negotiated =
                    negotiate::negotiate_version(self, &self.common, &head.headers).await?;
                headers.insert(
                    reqwest::header::HeaderName::from_static(negotiate::VERSION_HEADER),
                    version_value(negotiated),
                );
                continue;
            }

            let kind = wire::transfer_kind(&method, &head);
            let mut live = Body::from_wire(
                wire::BodyReader::new(reader, kind, self.options.timeout),
                self.common.endpoint.authority(),
            );

            // Binary payloads stay on the wire; everything else is drained
            // up front so it can be logged, error-decoded, and JSON-parsed.
            let is_octet = head
                .headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct == "application/octet-stream");
            let (body_text, response_body) = if is_octet {
                self.log_http_response(&head, None);
                (None, live)
            } else {
                let text = live.drain_string().await?;
                self.log_http_response(&head, Some(&text));
                let buffered = Body::from_bytes(Bytes::from(text.clone().into_bytes()));
                (Some(text), buffered)
            };

            let status = head.status.as_u16();
            if (400..600).contains(&status) {
                warn!("request returned failure status {status}");
                let (faultstring, debuginfo) = body_text
                    .as_deref()
                    .map(extract_error_json)
                    .unwrap_or((None, None));
                return Err(Error::from_response(
                    status,
                    faultstring,
                    debuginfo,
                    method.as_str(),
                    &url,
                ));
            }
            if matches!(status, 301 | 302 | 305) {
                let Some(location) = head
                    .headers
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
                else {
                    return Err(Error::Status {
                        status,
                        faultstring: Some("redirect response without a Location header".into()),
                        debuginfo: None,
                        method: method.to_string(),
                        url,
                    });
                };
                hops += 1;
                if hops > self.common.max_redirects {
                    return Err(Error::TooManyRedirects {
                        limit: self.common.max_redirects,
                        url: location,
                    });
                }
                debug!("redirected to {location}");
                url = location_path(&location);
                continue;
            }
            if status == 300 {
                return Err(Error::from_response(300, None, None, method.as_str(), &url));
            }

            return Ok((Response::new(head.status, head.headers), response_body));
        }
    }

    pub(crate) async fn http_request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<(Response, Body), Error> {
        with_retries(self.common.retry, || {
            self.request_once(method.clone(), url, headers.clone(), body.clone())
        })
        .await
    }

    /// Reconstruct the request as a curl command line for debugging.
    fn log_curl_request(
        &self,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }

        let mut curl = format!("curl -i -X {method}");
        for (name, value) in headers {
            curl.push_str(&format!(" -H '{name}: {value:?}'"));
        }

        let tls = &self.options.tls;
        if let Some(client_cert) = &tls.client_cert {
            if let Some(key) = &client_cert.key {
                curl.push_str(&format!(" --key {}", key.display()));
            }
            curl.push_str(&format!(" --cert {}", client_cert.cert.display()));
        }
        if let Some(ca_bundle) = &tls.ca_bundle {
            curl.push_str(&format!(" --cacert {}", ca_bundle.display()));
        }
        if !tls.verify_peer {
            curl.push_str(" -k");
        }

        if let Some(body) = body {
            curl.push_str(&format!(" -d '{}'", String::from_utf8_lossy(body)));
        }

        let endpoint = &self.common.endpoint;
        curl.push_str(&format!(
            " {}://{}{}",
            endpoint.scheme().as_str(),
            endpoint.authority(),
            target
        ));
        debug!("{curl}");
    }

    /// Dump status line, headers, and (already drained) body.
    fn log_http_response(&self, head: &wire::ResponseHead, body: Option<&str>) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }

        let mut dump = format!("\nHTTP/1.1 {}", head.status);
        for (name, value) in &head.headers {
            dump.push_str(&format!("\n{name}: {value:?}"));
        }
        if let Some(body) = body {
            dump.push('\n');
            dump.push_str(body);
        }
        debug!("{dump}");
    }
}

impl ProbeTransport for DirectClient {
    async fn probe(&self, path: &str) -> Result<HeaderMap, Error> {
        let target = self.common.endpoint.request_path(path);
        let (head, _reader) = self
            .exchange(&Method::GET, &target, &HeaderMap::new(), None)
            .await?;
        Ok(head.headers)
    }
}

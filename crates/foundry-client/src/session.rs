// Session backend.
//
// Thin executor over a caller-supplied `reqwest::Client` ("the session"):
// pooling, timeouts, proxies, and TLS are the session's concern. What lives
// here is the part that must match the direct backend exactly -- header
// defaults, status classification, method-preserving redirects, version
// negotiation, and error translation.
//
// The supplied session must have automatic redirect following disabled
// (`redirect::Policy::none()`); reqwest's built-in policy rewrites POST to
// GET on 301/302, which would break the method/body-preserving contract.

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, LOCATION};
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

use crate::client::{Common, location_path, version_value};
use crate::error::{Error, extract_error_json};
use crate::negotiate::{self, ProbeTransport};
use crate::response::{Body, Response};
use crate::retry::with_retries;

pub(crate) struct SessionClient {
    common: Common,
    session: reqwest::Client,
}

impl SessionClient {
    pub(crate) fn new(common: Common, session: reqwest::Client) -> Self {
        Self { common, session }
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

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<&Bytes>,
    ) -> Result<reqwest::Response, Error> {
        let mut request = self.session.request(method.clone(), url).headers(headers.clone());
        if let Some(body) = body {
            request = request.body(body.clone());
        }
        request.send().await.map_err(|e| self.refused(e.to_string()))
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
            let absolute = self.common.endpoint.url_for(&url);
            debug!("{method} {absolute}");

            let resp = self
                .send_once(&method, &absolute, &headers, body.as_ref())
                .await?;
            let status_code = resp.status();
            let status = status_code.as_u16();
            let response_headers = resp.headers().clone();

            if status_code == StatusCode::NOT_ACCEPTABLE {
                let negotiated =
                    negotiate::negotiate_version(self, &self.common, &response_headers).await?;
                headers.insert(
                    HeaderName::from_static(negotiate::VERSION_HEADER),
                    version_value(negotiated),
                );
                continue;
            }

            if (400..600).contains(&status) {
                warn!("request returned failure status {status}");
                let text = resp.text().await.unwrap_or_default();
                let (faultstring, debuginfo) = extract_error_json(&text);
                return Err(Error::from_response(
                    status,
                    faultstring,
                    debuginfo,
                    method.as_str(),
                    &url,
                ));
            }
            if matches!(status, 301 | 302 | 305) {
                let Some(location) = response_headers
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

            // Same buffering split as the direct backend: binary payloads
            // stream, everything else is drained eagerly.
            let is_octet = response_headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct == "application/octet-stream");
            let response_body = if is_octet {
                Body::from_session(resp, self.common.endpoint.authority())
            } else {
                let text = resp.text().await.map_err(|e| self.refused(e.to_string()))?;
                Body::from_bytes(Bytes::from(text.into_bytes()))
            };

            return Ok((Response::new(status_code, response_headers), response_body));
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
}

impl ProbeTransport for SessionClient {
    async fn probe(&self, path: &str) -> Result<HeaderMap, Error> {
        let url = self.common.endpoint.url_for(path);
        let resp = self
            .session
            .get(url)
            .send()
            .await
            .map_err(|e| self.refused(e.to_string()))?;
        Ok(resp.headers().clone())
    }
}

// Response envelope and body streaming.
//
// `Response` is the cheap metadata half (status + headers); `Body` is the
// single-pass chunk stream over the payload. Both backends surface the same
// `Body` type: the direct backend reads 64 KiB chunks straight off its
// framed connection, while the session backend's network-sized chunks are
// re-accumulated to the same fixed size so callers see identical behavior.

use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;

use crate::error::Error;
use crate::wire::{self, CHUNK_SIZE};

/// Status and headers of a completed exchange. Header lookup is
/// case-insensitive.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
}

impl Response {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self { status, headers }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The `content-type` header, if present and readable.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

enum BodyKind {
    Empty,
    Full(Option<Bytes>),
    Wire {
        reader: wire::BodyReader,
        endpoint: String,
    },
    Session {
        stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
        pending: BytesMut,
        done: bool,
        endpoint: String,
    },
}

/// Lazy, finite, single-pass stream of response body chunks.
///
/// Chunks are 64 KiB (the final one may be shorter); once consumed the
/// content is gone. Non-binary responses are drained by the executor before
/// the caller sees them, so a `Body` handed out by `json_request` is always
/// a single already-buffered chunk; `raw_request` bodies read from the live
/// connection.
pub struct Body {
    inner: BodyKind,
}

impl Body {
    pub(crate) fn empty() -> Self {
        Self {
            inner: BodyKind::Empty,
        }
    }

    pub(crate) fn from_bytes(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            return Self::empty();
        }
        Self {
            inner: BodyKind::Full(Some(bytes)),
        }
    }

    pub(crate) fn from_wire(reader: wire::BodyReader, endpoint: String) -> Self {
        Self {
            inner: BodyKind::Wire { reader, endpoint },
        }
    }

    pub(crate) fn from_session(response: reqwest::Response, endpoint: String) -> Self {
        Self {
            inner: BodyKind::Session {
                stream: Box::pin(response.bytes_stream()),
                pending: BytesMut::new(),
                done: false,
                endpoint,
            },
        }
    }

    /// Next chunk of the body, or `None` once it is fully consumed.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        match &mut self.inner {
            BodyKind::Empty => Ok(None),
            BodyKind::Full(bytes) => Ok(bytes.take()),
            BodyKind::Wire { reader, endpoint } => {
                reader
                    .next_chunk()
                    .await
                    .map_err(|e| Error::ConnectionRefused {
                        endpoint: endpoint.clone(),
                        message: e.to_string(),
                    })
            }
            BodyKind::Session {
                stream,
                pending,
                done,
                endpoint,
            } => {
                loop {
                    if pending.len() >= CHUNK_SIZE {
                        return Ok(Some(pending.split_to(CHUNK_SIZE).freeze()));
                    }
                    if *done {
                        if pending.is_empty() {
                            return Ok(None);
                        }
                        return Ok(Some(pending.split().freeze()));
                    }
                    match stream.next().await {
                        Some(Ok(bytes)) => pending.extend_from_slice(&bytes),
                        Some(Err(e)) => {
                            return Err(Error::ConnectionRefused {
                                endpoint: endpoint.clone(),
                                message: e.to_string(),
                            });
                        }
                        None => *done = true,
                    }
                }
            }
        }
    }

    /// Read the rest of the body into one buffer.
    pub async fn drain(&mut self) -> Result<Bytes, Error> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Drain and decode as (lossy) UTF-8, for logging and JSON handling.
    pub(crate) async fn drain_string(&mut self) -> Result<String, Error> {
        let bytes = self.drain().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Adapt into a `futures` stream of chunks.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Bytes, Error>> + Send {
        async_stream::stream! {
            loop {
                match self.chunk().await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            BodyKind::Empty => "Empty",
            BodyKind::Full(_) => "Full",
            BodyKind::Wire { .. } => "Wire",
            BodyKind::Session { .. } => "Session",
        };
        f.debug_struct("Body").field("kind", &kind).finish()
    }
}

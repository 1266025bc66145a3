// HTTP/1.1 wire codec for the direct backend.
//
// The direct backend opens a fresh connection per request and speaks
// `Connection: close` HTTP/1.1 over it: serialize the request head and body,
// parse the status line and header block, then hand body framing to
// `BodyReader`. Framing is one of Content-Length, chunked transfer coding,
// or read-to-EOF; `BodyReader` yields fixed-size 64 KiB chunks regardless
// of how the bytes arrive on the socket.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Fixed response body chunk size.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Cap on a single head/chunk-size line; a peer sending more is broken.
const MAX_LINE: usize = 16 * 1024;

/// Either a plain TCP stream or a TLS-wrapped one.
pub(crate) trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

// ── Request serialization ────────────────────────────────────────────

/// Write a complete request (head and body) to the stream.
///
/// `target` is the origin-form request target (path and query). `Host` and
/// `Content-Length` are filled in unless the caller already set them;
/// `Connection: close` is always sent because the connection is never
/// reused.
pub(crate) async fn send_request(
    stream: &mut (impl AsyncWrite + Unpin),
    method: &Method,
    target: &str,
    authority: &str,
    headers: &HeaderMap,
    body: Option<&[u8]>,
) -> io::Result<()> {
    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(method.as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");

    if !headers.contains_key(HOST) {
        head.extend_from_slice(b"host: ");
        head.extend_from_slice(authority.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"connection: close\r\n");

    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    if let Some(body) = body {
        if !headers.contains_key(CONTENT_LENGTH) {
            head.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
        }
    }
    head.extend_from_slice(b"\r\n");

    stream.write_all(&head).await?;
    if let Some(body) = body {
        stream.write_all(body).await?;
    }
    stream.flush().await
}

// ── Response head ────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Read one CRLF-terminated line, without the terminator.
async fn read_line(reader: &mut (impl AsyncBufRead + Unpin)) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = reader.take(MAX_LINE as u64 + 1).read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-response",
        ));
    }
    if line.len() > MAX_LINE {
        return Err(invalid_data("response line too long"));
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
    Ok(line)
}

/// Parse the status line and header block.
pub(crate) async fn read_head(
    reader: &mut (impl AsyncBufRead + Unpin),
) -> io::Result<ResponseHead> {
    let status_line = read_line(reader).await?;
    let status_line = String::from_utf8_lossy(&status_line);

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(invalid_data(format!("unexpected protocol version {version:?}")));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| invalid_data(format!("malformed status line {status_line:?}")))?;

    let mut headers = HeaderMap::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            break;
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| invalid_data("malformed header line"))?;
        let name = HeaderName::from_bytes(line[..colon].trim_ascii())
            .map_err(|e| invalid_data(format!("bad header name: {e}")))?;
        let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
            .map_err(|e| invalid_data(format!("bad header value: {e}")))?;
        headers.append(name, value);
    }

    Ok(ResponseHead { status, headers })
}

// ── Body framing ─────────────────────────────────────────────────────

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferKind {
    /// No body at all (HEAD, 1xx, 204, 304).
    None,
    /// `Content-Length` bytes.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Everything until the peer closes the connection.
    Eof,
}

pub(crate) fn transfer_kind(method: &Method, head: &ResponseHead) -> TransferKind {
    let status = head.status;
    if method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || status.is_informational()
    {
        return TransferKind::None;
    }
    if let Some(te) = head.headers.get(TRANSFER_ENCODING) {
        let chunked = te
            .to_str()
            .map(|s| s.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        if chunked {
            return TransferKind::Chunked;
        }
    }
    if let Some(n) = head
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return TransferKind::Length(n);
    }
    TransferKind::Eof
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    Length { remaining: u64 },
    Chunked(ChunkedState),
    Eof,
    Done,
}

#[derive(Debug, Clone, Copy)]
enum ChunkedState {
    /// Expecting a chunk-size line.
    Size,
    /// Inside chunk data with this much left.
    Data { remaining: u64 },
    /// Expecting the CRLF that terminates a chunk's data.
    DataEnd,
    /// Expecting (and discarding) trailers up to the final blank line.
    Trailers,
}

/// Lazy, finite, single-pass reader over a live response body.
///
/// Yields chunks of exactly [`CHUNK_SIZE`] bytes (the last one may be
/// shorter), accumulating short socket reads until a chunk fills.
pub(crate) struct BodyReader {
    reader: BufReader<Box<dyn IoStream>>,
    state: ReadState,
    timeout: Duration,
}

impl BodyReader {
    pub(crate) fn new(
        reader: BufReader<Box<dyn IoStream>>,
        kind: TransferKind,
        timeout: Duration,
    ) -> Self {
        let state = match kind {
            TransferKind::None | TransferKind::Length(0) => ReadState::Done,
            TransferKind::Length(n) => ReadState::Length { remaining: n },
            TransferKind::Chunked => ReadState::Chunked(ChunkedState::Size),
            TransferKind::Eof => ReadState::Eof,
        };
        Self { reader, state, timeout }
    }

    /// Next chunk of the body, or `None` once the body is complete.
    pub(crate) async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;

        while filled < CHUNK_SIZE {
            match self.state {
                ReadState::Done => break,
                ReadState::Eof => {
                    let n = self.read_some(&mut buf, filled, CHUNK_SIZE).await?;
                    if n == 0 {
                        self.state = ReadState::Done;
                        break;
                    }
                    filled += n;
                }
                ReadState::Length { remaining } => {
                    let want = (CHUNK_SIZE - filled)
                        .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let n = self.read_some(&mut buf, filled, filled + want).await?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed before the advertised content length",
                        ));
                    }
                    filled += n;
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        ReadState::Done
                    } else {
                        ReadState::Length { remaining }
                    };
                }
                ReadState::Chunked(ChunkedState::Size) => {
                    let line = self.read_line_timeout().await?;
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        ReadState::Chunked(ChunkedState::Trailers)
                    } else {
                        ReadState::Chunked(ChunkedState::Data { remaining: size })
                    };
                }
                ReadState::Chunked(ChunkedState::Data { remaining }) => {
                    let want = (CHUNK_SIZE - filled)
                        .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let n = self.read_some(&mut buf, filled, filled + want).await?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed mid-chunk",
                        ));
                    }
                    filled += n;
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        ReadState::Chunked(ChunkedState::DataEnd)
                    } else {
                        ReadState::Chunked(ChunkedState::Data { remaining })
                    };
                }
                ReadState::Chunked(ChunkedState::DataEnd) => {
                    let line = self.read_line_timeout().await?;
                    if !line.is_empty() {
                        return Err(invalid_data("missing CRLF after chunk data"));
                    }
                    self.state = ReadState::Chunked(ChunkedState::Size);
                }
                ReadState::Chunked(ChunkedState::Trailers) => {
                    loop {
                        let line = self.read_line_timeout().await?;
                        if line.is_empty() {
                            break;
                        }
                    }
                    self.state = ReadState::Done;
                }
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(Bytes::from(buf)))
    }

    async fn read_some(&mut self, buf: &mut [u8], from: usize, to: usize) -> io::Result<usize> {
        tokio::time::timeout(self.timeout, self.reader.read(&mut buf[from..to]))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "body read timed out"))?
    }

    async fn read_line_timeout(&mut self) -> io::Result<Vec<u8>> {
        tokio::time::timeout(self.timeout, read_line(&mut self.reader))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "body read timed out"))?
    }
}

/// Parse a chunk-size line (hex, optionally followed by `;extensions`).
fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let line = String::from_utf8_lossy(line);
    let size = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| invalid_data(format!("malformed chunk size {size:?}")))
}

// ── CONNECT tunnel ───────────────────────────────────────────────────

/// Establish an HTTP CONNECT tunnel to `authority` through an already-open
/// proxy connection.
///
/// The proxy's response head is read one byte at a time so that no bytes
/// past the blank line are consumed (the TLS handshake follows directly on
/// the same stream).
pub(crate) async fn establish_tunnel(stream: &mut TcpStream, authority: &str) -> io::Result<()> {
    let request = format!("CONNECT {authority} HTTP/1.1\r\nhost: {authority}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > MAX_LINE {
            return Err(invalid_data("oversized tunnel response"));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the connection during CONNECT",
            ));
        }
        head.push(byte[0]);
    }

    let status_line = head.split(|&b| b == b'\r').next().unwrap_or_default();
    let status_line = String::from_utf8_lossy(status_line);
    let ok = status_line
        .split(' ')
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .is_some_and(|code| (200..300).contains(&code));
    if !ok {
        return Err(io::Error::other(format!("tunnel rejected: {status_line}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Feed canned server bytes through a duplex pipe and return the
    /// client-side reader.
    async fn canned(server_bytes: &[u8]) -> BufReader<Box<dyn IoStream>> {
        let (client, mut server) = tokio::io::duplex(512 * 1024);
        server.write_all(server_bytes).await.unwrap();
        drop(server);
        let boxed: Box<dyn IoStream> = Box::new(client);
        BufReader::new(boxed)
    }

    async fn read_full_body(mut body: BodyReader) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn parses_head_and_content_length_body() {
        let mut reader = canned(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}",
        )
        .await;
        let head = read_head(&mut reader).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(
            head.headers.get("content-type").unwrap(),
            "application/json"
        );

        let kind = transfer_kind(&Method::GET, &head);
        assert_eq!(kind, TransferKind::Length(2));
        let body = BodyReader::new(reader, kind, TIMEOUT);
        assert_eq!(read_full_body(body).await, b"{}");
    }

    #[tokio::test]
    async fn parses_status_line_without_reason_phrase() {
        let mut reader = canned(b"HTTP/1.1 204\r\n\r\n").await;
        let head = read_head(&mut reader).await.unwrap();
        assert_eq!(head.status, StatusCode::NO_CONTENT);
        assert_eq!(transfer_kind(&Method::GET, &head), TransferKind::None);
    }

    #[tokio::test]
    async fn decodes_chunked_bodies() {
        let mut reader = canned(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await;
        let head = read_head(&mut reader).await.unwrap();
        let kind = transfer_kind(&Method::GET, &head);
        assert_eq!(kind, TransferKind::Chunked);
        let body = BodyReader::new(reader, kind, TIMEOUT);
        assert_eq!(read_full_body(body).await, b"Wikipedia");
    }

    #[tokio::test]
    async fn reads_to_eof_without_length_information() {
        let mut reader = canned(b"HTTP/1.1 200 OK\r\n\r\nstreamed until close").await;
        let head = read_head(&mut reader).await.unwrap();
        let kind = transfer_kind(&Method::GET, &head);
        assert_eq!(kind, TransferKind::Eof);
        let body = BodyReader::new(reader, kind, TIMEOUT);
        assert_eq!(read_full_body(body).await, b"streamed until close");
    }

    #[tokio::test]
    async fn fills_chunks_to_the_fixed_size() {
        // 150 KB payload -> exactly 64 KiB + 64 KiB + 22 KiB.
        let payload = vec![0xA5u8; 150 * 1024];
        let mut wire = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", payload.len())
            .into_bytes();
        wire.extend_from_slice(&payload);

        let mut reader = canned(&wire).await;
        let head = read_head(&mut reader).await.unwrap();
        let mut body = BodyReader::new(reader, transfer_kind(&Method::GET, &head), TIMEOUT);

        let mut sizes = Vec::new();
        let mut total = Vec::new();
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
            total.extend_from_slice(&chunk);
        }
        assert_eq!(sizes, vec![64 * 1024, 64 * 1024, 22 * 1024]);
        assert_eq!(total, payload);
    }

    #[tokio::test]
    async fn truncated_sized_body_is_an_error() {
        let mut reader =
            canned(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort").await;
        let head = read_head(&mut reader).await.unwrap();
        let mut body = BodyReader::new(reader, transfer_kind(&Method::GET, &head), TIMEOUT);
        let err = body.next_chunk().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn head_responses_never_have_a_body() {
        let mut reader =
            canned(b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n").await;
        let head = read_head(&mut reader).await.unwrap();
        assert_eq!(transfer_kind(&Method::HEAD, &head), TransferKind::None);
    }

    #[tokio::test]
    async fn serializes_requests_with_defaults() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let mut headers = HeaderMap::new();
        headers.insert("x-auth-token", HeaderValue::from_static("secret"));
        send_request(
            &mut client,
            &Method::POST,
            "/v1/portgroups",
            "h:6385",
            &headers,
            Some(b"{\"name\":\"pg\"}"),
        )
        .await
        .unwrap();
        drop(client);

        let mut written = Vec::new();
        server.read_to_end(&mut written).await.unwrap();
        let text = String::from_utf8(written).unwrap();
        assert!(text.starts_with("POST /v1/portgroups HTTP/1.1\r\n"), "{text}");
        assert!(text.contains("host: h:6385\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.contains("x-auth-token: secret\r\n"));
        assert!(text.contains("content-length: 13\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"name\":\"pg\"}"));
    }

    #[tokio::test]
    async fn rejects_malformed_status_lines() {
        let mut reader = canned(b"ICY 200 OK\r\n\r\n").await;
        assert!(read_head(&mut reader).await.is_err());

        let mut reader = canned(b"HTTP/1.1 banana\r\n\r\n").await;
        assert!(read_head(&mut reader).await.is_err());
    }
}

//! HTTP/1.1 wire types: methods, the per-attempt request descriptor, response
//! heads and parsed response bodies.
//!
//! # Design
//! `HttpRequest` is the immutable descriptor for one attempt. A redirect
//! builds a new descriptor from the old one via `HttpRequest::redirected`, so
//! a hop never inherits encoded body bytes, only the form description, which
//! is re-encoded from scratch.
//!
//! Response heads are read line by line off an `AsyncBufRead` and parsed with
//! `httparse`. The same reader serves origin responses and proxy CONNECT
//! replies.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use url::{Position, Url};

use crate::events::EventSink;
use crate::multipart::FormData;
use crate::sink::Output;
use crate::tunnel::TunnelAgent;

/// Upper bound on the number of header lines accepted in a response head.
const MAX_HEADERS: usize = 128;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Methods that carry a request body and therefore always announce a length.
    fn expects_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The descriptor for a single attempt of an exchange.
///
/// Built by `Client::build` with the client defaults already merged into
/// `headers`. Consumed by `Client::execute`.
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: HeaderMap,
    pub data: Option<FormData>,
    pub output: Output,
    pub proxy: Option<TunnelAgent>,
    pub events: Option<Arc<dyn EventSink>>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            data: None,
            output: Output::Memory,
            proxy: None,
            events: None,
        }
    }

    /// Build the descriptor for the next hop of a redirect.
    ///
    /// Method, form, output, proxy and events carry forward. `Authorization`
    /// is dropped when `location` names a different host, and `Host` is always
    /// dropped so it is recomputed for the new URL.
    pub fn redirected(self, location: Url) -> Self {
        let mut headers = self.headers;
        if !same_host(&self.url, &location) {
            headers.remove(header::AUTHORIZATION);
        }
        headers.remove(header::HOST);
        Self {
            url: location,
            headers,
            ..self
        }
    }

    /// `host[:port]` as it belongs in the `Host` header.
    pub(crate) fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Headers for the wire: the descriptor's own, plus `Host`, framing and
    /// `Connection: close`. `body_headers` come from the multipart encoder.
    pub(crate) fn wire_headers(&self, body_headers: Option<HeaderMap>) -> Result<HeaderMap, http::header::InvalidHeaderValue> {
        let mut headers = self.headers.clone();
        if !headers.contains_key(header::HOST) {
            headers.insert(header::HOST, HeaderValue::from_str(&self.host_header())?);
        }
        match body_headers {
            Some(extra) => {
                for (name, value) in extra.iter() {
                    headers.insert(name.clone(), value.clone());
                }
            }
            None if self.method.expects_body() => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
            None => {}
        }
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        Ok(headers)
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("data", &self.data)
            .field("output", &self.output)
            .field("proxy", &self.proxy)
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// Host names are compared case-insensitively; ports are ignored.
pub(crate) fn same_host(a: &Url, b: &Url) -> bool {
    match (a.host_str(), b.host_str()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

/// Write the request line and headers. The request target is origin-form
/// (path and query), which is also what goes through a CONNECT tunnel.
pub(crate) async fn write_request_head<W>(
    writer: &mut W,
    method: HttpMethod,
    url: &Url,
    headers: &HeaderMap,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf_writer = BufWriter::new(writer);
    let target = &url[Position::BeforePath..Position::AfterQuery];
    let target = if target.is_empty() { "/" } else { target };
    buf_writer
        .write_all(format!("{method} {target} HTTP/1.1\r\n").as_bytes())
        .await?;
    for (name, value) in headers.iter() {
        buf_writer.write_all(name.as_str().as_bytes()).await?;
        buf_writer.write_all(b": ").await?;
        buf_writer.write_all(value.as_bytes()).await?;
        buf_writer.write_all(b"\r\n").await?;
    }
    buf_writer.write_all(b"\r\n").await?;
    buf_writer.flush().await
}

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("connection closed before the response head was complete")]
    Closed,
    #[error("response head larger than {0} bytes")]
    TooLarge(usize),
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid response head: {0}")]
    Parse(#[from] httparse::Error),
    #[error("invalid header `{0}`")]
    InvalidHeader(String),
}

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Read a full head (status line through the empty line) from `reader`.
    ///
    /// Bytes after the head are left in the reader.
    pub(crate) async fn read<R>(reader: &mut R, max_size: usize) -> Result<Self, HeadError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::with_capacity(1024);
        loop {
            let start = buf.len();
            let left = max_size.saturating_sub(start) as u64;
            if left == 0 {
                return Err(HeadError::TooLarge(max_size));
            }
            let nr = (&mut *reader).take(left).read_until(b'\n', &mut buf).await?;
            if nr == 0 {
                return Err(HeadError::Closed);
            }
            if buf.last() != Some(&b'\n') {
                return if buf.len() >= max_size {
                    Err(HeadError::TooLarge(max_size))
                } else {
                    Err(HeadError::Closed)
                };
            }
            let line = &buf[start..];
            if start > 0 && (line == b"\r\n" || line == b"\n") {
                break;
            }
        }
        Self::parse(&buf)
    }

    fn parse(buf: &[u8]) -> Result<Self, HeadError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut rsp = httparse::Response::new(&mut headers);
        match rsp.parse(buf)? {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => return Err(HeadError::Closed),
        }

        let mut map = HeaderMap::with_capacity(rsp.headers.len());
        for h in rsp.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|_| HeadError::InvalidHeader(h.name.to_string()))?;
            let value = HeaderValue::from_bytes(h.value)
                .map_err(|_| HeadError::InvalidHeader(h.name.to_string()))?;
            map.append(name, value);
        }

        Ok(ResponseHead {
            status: rsp.code.unwrap_or_default(),
            reason: rsp.reason.unwrap_or_default().to_string(),
            headers: map,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    /// `Location` of a 3xx response. Other statuses never redirect.
    pub fn redirect_location(&self) -> Option<&str> {
        if !(300..400).contains(&self.status) {
            return None;
        }
        self.headers.get(header::LOCATION)?.to_str().ok()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .last()
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }
}

/// The result of a successful exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// In-memory body that parsed as JSON.
    Json(Value),
    /// In-memory body that was not JSON.
    Text(String),
    /// Body saved to a file; the absolute path written to.
    Saved(PathBuf),
    /// Body piped into a caller-provided writer.
    Streamed { bytes: u64 },
}

impl ResponseBody {
    /// Interpret an in-memory body: JSON first, raw text otherwise.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match serde_json::from_slice(bytes) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            ResponseBody::Saved(path) => Some(path),
            _ => None,
        }
    }

    /// Message for an error response: an object's `error` field, else the body.
    pub fn error_message(&self) -> String {
        match self {
            ResponseBody::Json(Value::Object(map)) => match map.get("error") {
                Some(Value::String(message)) => message.clone(),
                Some(other) if !other.is_null() => other.to_string(),
                _ => Value::Object(map.clone()).to_string(),
            },
            ResponseBody::Json(Value::String(text)) => text.clone(),
            ResponseBody::Json(other) => other.to_string(),
            ResponseBody::Text(text) => text.clone(),
            ResponseBody::Saved(path) => path.display().to_string(),
            ResponseBody::Streamed { bytes } => format!("{bytes} bytes"),
        }
    }
}

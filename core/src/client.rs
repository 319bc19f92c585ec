//! The request engine.
//!
//! # Design
//! `Client` holds only immutable configuration: default headers, the
//! transport (TLS roots, connect timeout), an optional default proxy and event
//! sink. Each call builds a fresh `HttpRequest`, so concurrent requests never
//! share mutable state.
//!
//! One exchange walks `connect -> send head (and body) -> read head ->
//! stream body`. A 3xx with a `Location` drains the body, drops the socket and
//! loops with a descriptor rebuilt for the new URL; the loop is bounded by
//! `max_redirects`. Any other non-2xx is read into memory and turned into
//! `ApiError::Http`. Sockets and sinks are owned by the exchange and released
//! on every exit path when they go out of scope.

use std::path::Path;
use std::sync::Arc;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use tokio::io::BufReader;
use tokio_rustls::rustls;
use tracing::Instrument;
use url::Url;

use crate::body::{BodyReader, Framing};
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::events::{ConnectInfo, Emitter, EventSink, ProgressCounter};
use crate::http::{write_request_head, HeadError, HttpMethod, HttpRequest, ResponseBody, ResponseHead};
use crate::multipart::{FormData, MultipartBody, WriteError};
use crate::sink::{Output, Sink};
use crate::transport::{default_tls_config, Target, Transport};
use crate::tunnel::TunnelAgent;

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Per-call options. Everything is optional; `Default` is a bare in-memory GET.
#[derive(Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub data: Option<FormData>,
    pub output: Output,
    pub proxy: Option<TunnelAgent>,
    pub events: Option<Arc<dyn EventSink>>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn data(mut self, form: FormData) -> Self {
        self.data = Some(form);
        self
    }

    pub fn output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    pub fn save_to(self, path: impl AsRef<Path>) -> Self {
        self.output(Output::path(path.as_ref()))
    }

    pub fn proxy(mut self, agent: TunnelAgent) -> Self {
        self.proxy = Some(agent);
        self
    }

    pub fn events(mut self, sink: impl EventSink + 'static) -> Self {
        self.events = Some(Arc::new(sink));
        self
    }
}

enum Step {
    Done(ResponseBody),
    Redirect(HttpRequest),
}

#[derive(Clone)]
pub struct Client {
    default_headers: HeaderMap,
    transport: Transport,
    proxy: Option<TunnelAgent>,
    events: Option<Arc<dyn EventSink>>,
    max_redirects: usize,
    max_header_size: usize,
    connect_timeout: Option<std::time::Duration>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        Ok(Self {
            default_headers: config.default_headers()?,
            transport: Transport::new(default_tls_config()?, config.connect_timeout()),
            proxy: config.proxy_agent()?,
            events: None,
            max_redirects: config.max_redirects,
            max_header_size: config.max_header_size,
            connect_timeout: config.connect_timeout(),
        })
    }

    /// Replace the TLS configuration, e.g. to trust a private root.
    pub fn with_tls_config(mut self, tls_config: Arc<rustls::ClientConfig>) -> Self {
        self.transport = Transport::new(tls_config, self.connect_timeout);
        self
    }

    /// Default proxy for requests that do not bring their own.
    pub fn with_proxy(mut self, agent: TunnelAgent) -> Self {
        self.proxy = Some(agent);
        self
    }

    /// Default event sink for requests that do not bring their own.
    pub fn with_events(mut self, sink: impl EventSink + 'static) -> Self {
        self.events = Some(Arc::new(sink));
        self
    }

    pub async fn get(&self, url: &str, options: RequestOptions) -> Result<ResponseBody, ApiError> {
        self.request(HttpMethod::Get, url, options).await
    }

    pub async fn post(&self, url: &str, options: RequestOptions) -> Result<ResponseBody, ApiError> {
        self.request(HttpMethod::Post, url, options).await
    }

    pub async fn put(&self, url: &str, options: RequestOptions) -> Result<ResponseBody, ApiError> {
        self.request(HttpMethod::Put, url, options).await
    }

    pub async fn delete(&self, url: &str, options: RequestOptions) -> Result<ResponseBody, ApiError> {
        self.request(HttpMethod::Delete, url, options).await
    }

    pub async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        options: RequestOptions,
    ) -> Result<ResponseBody, ApiError> {
        let request = self.build(method, url, options)?;
        self.execute(request).await
    }

    /// Build the first-attempt descriptor: parse the URL and merge the
    /// client's default headers under the per-call ones.
    pub fn build(
        &self,
        method: HttpMethod,
        url: &str,
        options: RequestOptions,
    ) -> Result<HttpRequest, ApiError> {
        let parsed = Url::parse(url).map_err(|e| ApiError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let mut headers = self.default_headers.clone();
        for name in options.headers.keys() {
            headers.remove(name);
        }
        for (name, value) in options.headers.iter() {
            headers.append(name.clone(), value.clone());
        }

        Ok(HttpRequest {
            method,
            url: parsed,
            headers,
            data: options.data,
            output: options.output,
            proxy: options
                .proxy
                .or_else(|| self.proxy.clone())
                .map(|agent| agent.or_max_header_size(self.max_header_size)),
            events: options.events.or_else(|| self.events.clone()),
        })
    }

    /// Run a request to completion, following redirects.
    pub async fn execute(&self, request: HttpRequest) -> Result<ResponseBody, ApiError> {
        let mut request = request;
        let mut hops = 0usize;
        loop {
            let span = tracing::debug_span!(
                "exchange",
                method = %request.method,
                url = %request.url,
                hop = hops
            );
            match self.exchange(request).instrument(span).await? {
                Step::Done(body) => return Ok(body),
                Step::Redirect(next) => {
                    if hops >= self.max_redirects {
                        return Err(ApiError::TooManyRedirects {
                            limit: self.max_redirects,
                            url: next.url.to_string(),
                        });
                    }
                    hops += 1;
                    request = next;
                }
            }
        }
    }

    async fn exchange(&self, request: HttpRequest) -> Result<Step, ApiError> {
        let emitter = Emitter::new(request.events.clone());
        let host_header = request
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let target = Target::from_url(&request.url, host_header.as_deref())?;
        let authority = target.authority();

        let body = match &request.data {
            Some(form) => Some(MultipartBody::encode(form).await?),
            None => None,
        };
        let headers = request
            .wire_headers(body.as_ref().map(MultipartBody::headers))
            .map_err(|e| ApiError::InvalidUrl {
                url: request.url.to_string(),
                reason: e.to_string(),
            })?;
        emitter.headers(&headers);
        emitter.debug(format!("{} {}", request.method, request.url));

        let mut stream = self
            .transport
            .connect(&target, request.proxy.as_ref())
            .await?;

        write_request_head(&mut stream, request.method, &request.url, &headers)
            .await
            .map_err(|e| ApiError::transport(&authority, e))?;
        if let Some(body) = &body {
            body.write_to(&mut stream, |progress| emitter.write(progress))
                .await
                .map_err(|e| upload_error(&authority, e))?;
        }

        let mut reader = BufReader::new(stream);
        let head = loop {
            let head = ResponseHead::read(&mut reader, self.max_header_size)
                .await
                .map_err(|e| head_error(&authority, e))?;
            if !head.is_informational() {
                break head;
            }
            tracing::debug!(status = head.status, "skipping interim response");
        };
        let mut body_reader = BodyReader::new(reader, Framing::of(request.method, &head));

        if let Some(location) = head.redirect_location() {
            let next = request.url.join(location).map_err(|e| {
                ApiError::Protocol(format!("invalid Location `{location}`: {e}"))
            })?;
            emitter.debug(format!(
                "{} {} -> {} {}",
                request.method, request.url, head.status, next
            ));
            body_reader
                .drain()
                .await
                .map_err(|e| body_error(&authority, e))?;
            return Ok(Step::Redirect(request.redirected(next)));
        }

        let success = head.is_success();
        let size = head.content_length();
        let HttpRequest {
            method,
            url,
            output,
            ..
        } = request;

        let mut sink = if success {
            Sink::open(output, &url).await?
        } else {
            Sink::memory()
        };
        if let Some(path) = sink.path() {
            emitter.debug(format!("saving to {}", path.display()));
        }
        emitter.connect(ConnectInfo {
            status: head.status,
            size,
            headers: head.headers.clone(),
            path: sink.path().map(Path::to_path_buf),
            url: url.to_string(),
            method,
        });
        emitter.debug(format!("{method} {url} -> {}", head.status));

        let mut counter = ProgressCounter::new(size);
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = body_reader
                .next_chunk(&mut buf)
                .await
                .map_err(|e| body_error(&authority, e))?;
            if n == 0 {
                break;
            }
            sink.write(&buf[..n]).await?;
            emitter.read(counter.advance(n));
        }

        let body = sink.finish().await?;
        if success {
            Ok(Step::Done(body))
        } else {
            Err(ApiError::Http {
                status: head.status,
                message: body.error_message(),
            })
        }
    }
}

fn head_error(authority: &str, e: HeadError) -> ApiError {
    match e {
        HeadError::Io(source) => ApiError::transport(authority, source),
        other => ApiError::Protocol(other.to_string()),
    }
}

fn body_error(authority: &str, e: std::io::Error) -> ApiError {
    if e.kind() == std::io::ErrorKind::InvalidData {
        ApiError::Protocol(e.to_string())
    } else {
        ApiError::transport(authority, e)
    }
}

/// A form that changed on disk is the caller's problem, not the socket's.
fn upload_error(authority: &str, e: WriteError) -> ApiError {
    match e {
        WriteError::Encoding(e) => ApiError::Encoding(e),
        WriteError::Io(e) => ApiError::transport(authority, e),
    }
}

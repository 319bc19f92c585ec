//! HTTP CONNECT tunneling through an explicit proxy.
//!
//! # Design
//! A `TunnelAgent` describes the proxy only; it holds no sockets. Every call
//! to `connect` opens a fresh connection to the proxy, negotiates one tunnel
//! and hands the socket to the caller, who owns it from then on. Nothing is
//! pooled or reused across destinations.
//!
//! Every failure on the way (proxy unreachable, non-200 reply, TLS handshake
//! over the tunnel, the connect timeout running out) is a `TunnelError`,
//! which reads as a reset connection to the pending request.
//!
//! An `https://` proxy is reached over TLS first; the CONNECT exchange and
//! the destination's own TLS session then run inside that outer session.

use std::fmt;
use std::io;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio_rustls::TlsConnector;
use url::Url;

use crate::error::ApiError;
use crate::http::{HeadError, ResponseHead};
use crate::transport::{tcp_connect, timed_out, tls_upgrade, BoxStream, Target};

const DEFAULT_MAX_HEADER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("socket could not be established: statusCode={0}")]
    Status(u16),
    #[error("socket could not be established: {0}")]
    Connect(#[source] io::Error),
    #[error("socket could not be established: {0}")]
    Handshake(String),
    #[error("socket could not be established: tls handshake with {server_name} failed: {source}")]
    Tls {
        server_name: String,
        #[source]
        source: io::Error,
    },
}

impl TunnelError {
    /// Status the proxy answered the CONNECT with, when it got that far.
    pub fn status(&self) -> Option<u16> {
        match self {
            TunnelError::Status(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<TunnelError> for io::Error {
    fn from(e: TunnelError) -> Self {
        io::Error::new(io::ErrorKind::ConnectionReset, e)
    }
}

impl From<HeadError> for TunnelError {
    fn from(e: HeadError) -> Self {
        match e {
            HeadError::Io(e) => TunnelError::Connect(e),
            other => TunnelError::Handshake(other.to_string()),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An HTTP proxy reachable with CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAgent {
    host: String,
    port: u16,
    credentials: Option<ProxyCredentials>,
    tls: bool,
    /// Unset means "use the client's limit".
    max_header_size: Option<usize>,
}

impl TunnelAgent {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            tls: false,
            max_header_size: None,
        }
    }

    /// Parse `http(s)://[user:pass@]host[:port]`. The port defaults to 80 for
    /// `http` and 443 for `https`.
    pub fn from_url(proxy_url: &str) -> Result<Self, ApiError> {
        let invalid = |reason: String| ApiError::InvalidUrl {
            url: proxy_url.to_string(),
            reason,
        };
        let url = Url::parse(proxy_url).map_err(|e| invalid(e.to_string()))?;
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(invalid(format!("unsupported proxy scheme `{other}`"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if tls { 443 } else { 80 });

        let mut agent = Self::new(host, port).with_tls(tls);
        if !url.username().is_empty() {
            let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
            agent = agent.with_credentials(
                decode(url.username()),
                decode(url.password().unwrap_or_default()),
            );
        }
        Ok(agent)
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(ProxyCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Talk to the proxy itself over TLS.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_max_header_size(mut self, max_header_size: usize) -> Self {
        self.max_header_size = Some(max_header_size);
        self
    }

    /// Set the head limit only if none was chosen explicitly.
    pub(crate) fn or_max_header_size(mut self, max_header_size: usize) -> Self {
        self.max_header_size.get_or_insert(max_header_size);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn credentials(&self) -> Option<&ProxyCredentials> {
        self.credentials.as_ref()
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size.unwrap_or(DEFAULT_MAX_HEADER_SIZE)
    }

    /// `Basic <base64(user:pass)>`, when credentials are configured.
    pub fn proxy_authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(|c| {
            let token = STANDARD.encode(format!("{}:{}", c.username, c.password));
            format!("Basic {token}")
        })
    }

    /// Open a tunnel to `target`, upgrading to TLS when the target is secure.
    ///
    /// `connect_timeout` bounds the whole negotiation: proxy connect, proxy
    /// TLS, the CONNECT reply and the destination TLS handshake.
    pub async fn connect(
        &self,
        target: &Target,
        tls: &TlsConnector,
        connect_timeout: Option<Duration>,
    ) -> Result<BoxStream, TunnelError> {
        let establish = self.establish(target, tls);
        match connect_timeout {
            Some(limit) => tokio::time::timeout(limit, establish).await.map_err(|_| {
                tracing::debug!(proxy = %self.host, destination = %target.authority(), "tunnel timed out");
                TunnelError::Connect(timed_out(&target.authority(), limit))
            })?,
            None => establish.await,
        }
    }

    async fn establish(&self, target: &Target, tls: &TlsConnector) -> Result<BoxStream, TunnelError> {
        let tcp = tcp_connect(&self.host, self.port)
            .await
            .map_err(TunnelError::Connect)?;
        let proxy_stream: BoxStream = if self.tls {
            tls_upgrade(tls, &self.host, tcp)
                .await
                .map_err(|source| TunnelError::Tls {
                    server_name: self.host.clone(),
                    source,
                })?
        } else {
            Box::new(tcp)
        };
        tracing::debug!(proxy = %self.host, port = self.port, tls = self.tls, destination = %target.authority(), "making CONNECT request");

        let stream = self.handshake(proxy_stream, target).await?;
        tracing::debug!(destination = %target.authority(), "connection has been established");

        if !target.secure {
            return Ok(stream);
        }
        tls_upgrade(tls, &target.server_name, stream)
            .await
            .map_err(|source| TunnelError::Tls {
                server_name: target.server_name.clone(),
                source,
            })
    }

    /// Run the CONNECT exchange over an already connected `stream`.
    ///
    /// On success the same stream is returned with nothing buffered, ready to
    /// carry the destination protocol. On failure the stream is dropped.
    pub async fn handshake<S>(&self, stream: S, target: &Target) -> Result<S, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);
        self.send_connect(reader.get_mut(), target)
            .await
            .map_err(TunnelError::Connect)?;

        let head = ResponseHead::read(&mut reader, self.max_header_size()).await?;
        if head.status != 200 {
            tracing::debug!(status = head.status, "proxy refused CONNECT");
            return Err(TunnelError::Status(head.status));
        }
        if !reader.buffer().is_empty() {
            return Err(TunnelError::Handshake(format!(
                "proxy sent {} unexpected bytes after the CONNECT response",
                reader.buffer().len()
            )));
        }
        Ok(reader.into_inner())
    }

    async fn send_connect<W>(&self, writer: &mut W, target: &Target) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let authority = target.authority();
        let mut buf_writer = BufWriter::new(writer);
        buf_writer
            .write_all(format!("CONNECT {authority} HTTP/1.1\r\n").as_bytes())
            .await?;
        buf_writer
            .write_all(format!("Host: {authority}\r\n").as_bytes())
            .await?;
        if let Some(auth) = self.proxy_authorization() {
            buf_writer
                .write_all(format!("Proxy-Authorization: {auth}\r\n").as_bytes())
                .await?;
        }
        buf_writer.write_all(b"\r\n").await?;
        buf_writer.flush().await
    }
}

//! Socket acquisition: plain TCP, TLS, or through a CONNECT tunnel.
//!
//! # Design
//! `Transport::connect` is one async call that returns a ready byte stream or
//! an error. The scheme decides whether TLS is layered on top; an attached
//! `TunnelAgent` replaces the TCP connect step and performs the TLS upgrade
//! over the tunnel itself. The connect timeout covers the TLS handshake as
//! well as the TCP connect.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::TlsConnector;
use url::{Host, Url};

use crate::error::ApiError;
use crate::tunnel::TunnelAgent;

/// Any connected byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Where a request's socket must lead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host without brackets, suitable for DNS / socket addresses.
    pub host: String,
    pub port: u16,
    pub secure: bool,
    /// TLS server name: the `Host` header minus its port, else `host`.
    pub server_name: String,
}

impl Target {
    pub fn from_url(url: &Url, host_header: Option<&str>) -> Result<Self, ApiError> {
        let invalid = |reason: &str| ApiError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(invalid("missing host")),
        };
        let secure = url.scheme() == "https";
        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });
        let server_name = host_header
            .map(strip_port)
            .filter(|name| !name.is_empty())
            .unwrap_or(host.as_str())
            .to_string();
        Ok(Self {
            host,
            port,
            secure,
            server_name,
        })
    }

    /// `host:port` as used in a CONNECT request line.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// `example.com:8080` -> `example.com`, `[::1]:80` -> `::1`.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or_default();
    }
    host.split(':').next().unwrap_or_default()
}

/// TLS client configuration trusting the webpki root set.
pub fn default_tls_config() -> Result<Arc<rustls::ClientConfig>, ApiError> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ApiError::Config(format!("tls: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[derive(Clone)]
pub struct Transport {
    tls: TlsConnector,
    connect_timeout: Option<Duration>,
}

impl Transport {
    pub fn new(tls_config: Arc<rustls::ClientConfig>, connect_timeout: Option<Duration>) -> Self {
        Self {
            tls: TlsConnector::from(tls_config),
            connect_timeout,
        }
    }

    pub async fn connect(
        &self,
        target: &Target,
        tunnel: Option<&TunnelAgent>,
    ) -> Result<BoxStream, ApiError> {
        if let Some(agent) = tunnel {
            let stream = agent.connect(target, &self.tls, self.connect_timeout).await?;
            return Ok(stream);
        }

        let direct = self.connect_direct(target);
        let stream = match self.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, direct).await {
                Ok(result) => result,
                Err(_) => Err(timed_out(&target.authority(), limit)),
            },
            None => direct.await,
        };
        stream.map_err(|e| ApiError::transport(target.authority(), e))
    }

    async fn connect_direct(&self, target: &Target) -> io::Result<BoxStream> {
        let tcp = tcp_connect(&target.host, target.port).await?;
        tracing::debug!(authority = %target.authority(), secure = target.secure, "connected");
        if !target.secure {
            return Ok(Box::new(tcp));
        }
        tls_upgrade(&self.tls, &target.server_name, tcp).await
    }
}

pub(crate) fn timed_out(authority: &str, limit: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("connect to {authority} timed out after {limit:?}"),
    )
}

pub(crate) async fn tcp_connect(host: &str, port: u16) -> io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub(crate) async fn tls_upgrade<S>(
    connector: &TlsConnector,
    server_name: &str,
    stream: S,
) -> io::Result<BoxStream>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let tls_stream = connector.connect(name, stream).await?;
    tracing::debug!(server_name, "tls established");
    Ok(Box::new(tls_stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn target_defaults_ports_by_scheme() {
        let t = Target::from_url(&url("https://example.com/x"), None).unwrap();
        assert_eq!((t.port, t.secure), (443, true));
        let t = Target::from_url(&url("http://example.com/x"), None).unwrap();
        assert_eq!((t.port, t.secure), (80, false));
        let t = Target::from_url(&url("http://example.com:3000/x"), None).unwrap();
        assert_eq!(t.authority(), "example.com:3000");
    }

    #[test]
    fn server_name_comes_from_host_header() {
        let t = Target::from_url(
            &url("https://10.0.0.1/x"),
            Some("api.example.com:8443"),
        )
        .unwrap();
        assert_eq!(t.host, "10.0.0.1");
        assert_eq!(t.server_name, "api.example.com");

        let t = Target::from_url(&url("https://example.com/x"), None).unwrap();
        assert_eq!(t.server_name, "example.com");
    }

    #[test]
    fn ipv6_hosts_are_bracketed_in_authority() {
        let t = Target::from_url(&url("http://[::1]:8080/"), Some("[::1]:8080")).unwrap();
        assert_eq!(t.host, "::1");
        assert_eq!(t.authority(), "[::1]:8080");
        assert_eq!(t.server_name, "::1");
    }

    #[test]
    fn url_without_host_is_invalid() {
        let err = Target::from_url(&url("unix:/run/foo.socket"), None).unwrap_err();
        assert!(matches!(err, ApiError::InvalidUrl { .. }));
    }

    #[test]
    fn default_tls_config_builds() {
        assert!(default_tls_config().is_ok());
    }

    #[tokio::test]
    async fn stalled_tls_handshake_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let transport = Transport::new(default_tls_config().unwrap(), Some(Duration::from_millis(100)));
        let target = Target::from_url(&url(&format!("https://localhost:{port}/")), None).unwrap();
        let err = transport.connect(&target, None).await.err().unwrap();
        match err {
            ApiError::Transport { source, .. } => assert_eq!(source.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {other:?}"),
        }
        hold.abort();
    }
}

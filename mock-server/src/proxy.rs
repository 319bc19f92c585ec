//! A minimal HTTP CONNECT proxy.
//!
//! Only `CONNECT host:port` is understood. Once the tunnel is granted, bytes
//! are copied both ways until either side closes. Every CONNECT attempt is
//! logged with the answer it got.
//!
//! `serve_connection` works on any byte stream, so a caller that terminates
//! TLS itself can run the same proxy behind it.

use std::io;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// How the proxy answers CONNECT requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyMode {
    Open,
    /// Answer every CONNECT with this status.
    Reject(u16),
    /// Require this exact `Proxy-Authorization` value, else 407.
    RequireAuth(String),
}

impl ProxyMode {
    pub fn basic(username: &str, password: &str) -> Self {
        let token = STANDARD.encode(format!("{username}:{password}"));
        ProxyMode::RequireAuth(format!("Basic {token}"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRecord {
    pub authority: String,
    pub proxy_authorization: Option<String>,
    pub status: u16,
}

#[derive(Clone, Default)]
pub struct ProxyLog(Arc<Mutex<Vec<ConnectRecord>>>);

impl ProxyLog {
    pub async fn records(&self) -> Vec<ConnectRecord> {
        self.0.lock().await.clone()
    }

    async fn push(&self, record: ConnectRecord) {
        self.0.lock().await.push(record);
    }
}

pub async fn run_proxy(listener: TcpListener, mode: ProxyMode, log: ProxyLog) -> io::Result<()> {
    let mode = Arc::new(mode);
    loop {
        let (socket, peer) = listener.accept().await?;
        let mode = Arc::clone(&mode);
        let log = log.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(socket, &mode, &log).await {
                tracing::debug!(%peer, error = %e, "proxy connection ended with error");
            }
        });
    }
}

/// Answer one CONNECT request arriving on `socket`, then pipe the tunnel.
pub async fn serve_connection<S>(socket: S, mode: &ProxyMode, log: &ProxyLog) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(socket);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut proxy_authorization = None;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("proxy-authorization") {
                proxy_authorization = Some(value.trim().to_string());
            }
        }
    }
    let mut socket = reader.into_inner();

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let authority = parts.next().unwrap_or_default().to_string();
    if method != "CONNECT" {
        return reply(&mut socket, 405, "Method Not Allowed").await;
    }

    let status = match mode {
        ProxyMode::Open => 200,
        ProxyMode::Reject(code) => *code,
        ProxyMode::RequireAuth(expected) => {
            if proxy_authorization.as_deref() == Some(expected.as_str()) {
                200
            } else {
                407
            }
        }
    };
    log.push(ConnectRecord {
        authority: authority.clone(),
        proxy_authorization,
        status,
    })
    .await;
    tracing::info!(%authority, status, "CONNECT");

    if status != 200 {
        return reply(&mut socket, status, "Refused").await;
    }
    let mut upstream = match TcpStream::connect(authority.as_str()).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(%authority, error = %e, "upstream unreachable");
            return reply(&mut socket, 502, "Bad Gateway").await;
        }
    };
    socket
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    tokio::io::copy_bidirectional(&mut socket, &mut upstream).await?;
    Ok(())
}

async fn reply<S: AsyncWrite + Unpin>(socket: &mut S, status: u16, reason: &str) -> io::Result<()> {
    socket
        .write_all(format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\n\r\n").as_bytes())
        .await?;
    socket.shutdown().await
}

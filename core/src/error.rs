//! Error types for the transfer engine.
//!
//! # Design
//! Every failure an exchange can hit resolves into a single `ApiError`, so the
//! caller gets one rejection per logical request. Variants keep the structured
//! detail a caller needs to decide on remediation: the HTTP status for
//! `Http`, the proxy status for `Tunnel`, and the originating `io::Error` for
//! transport and sink failures. Redirects are not errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::multipart::EncodeError;
use crate::tunnel::TunnelError;

/// Errors returned by `Client` operations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The URL could not be parsed or names no host.
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The client configuration is unusable (bad header, bad proxy URL, TLS setup).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A multipart field could not be measured. Raised before any network I/O.
    #[error(transparent)]
    Encoding(#[from] EncodeError),

    /// DNS, connect, TLS or socket read/write failure.
    #[error("transport error ({target}): {source}")]
    Transport {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The CONNECT handshake through the proxy failed.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// The server answered with a non-2xx status. `message` is the body's
    /// `error` field when present, else the body itself.
    #[error("{message}")]
    Http { status: u16, message: String },

    /// The output destination could not be created, opened or written.
    #[error("cannot write output {}: {source}", path.display())]
    Sink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The peer sent something that is not a well-formed HTTP/1.x response.
    #[error("malformed response: {0}")]
    Protocol(String),

    /// The redirect chain exceeded `ClientConfig::max_redirects`.
    #[error("too many redirects (limit {limit}), last location {url}")]
    TooManyRedirects { limit: usize, url: String },
}

impl ApiError {
    /// HTTP status carried by the error, if the server produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// True for failures reported as a reset connection: every tunnel failure,
    /// and transport failures whose cause was a reset.
    pub fn is_connection_reset(&self) -> bool {
        match self {
            ApiError::Tunnel(_) => true,
            ApiError::Transport { source, .. } => source.kind() == io::ErrorKind::ConnectionReset,
            _ => false,
        }
    }

    pub(crate) fn transport(target: impl Into<String>, source: io::Error) -> Self {
        ApiError::Transport {
            target: target.into(),
            source,
        }
    }
}

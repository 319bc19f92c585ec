//! Streaming HTTP/1.1 client core.
//!
//! # Overview
//! Sends requests with optional multipart bodies, follows redirects, and
//! streams responses into memory, a file, or any async writer. Requests can be
//! tunneled through an HTTP proxy with CONNECT, upgrading to TLS over the
//! tunnel for `https` destinations.
//!
//! # Design
//! - `Client` is immutable after construction; every call builds its own
//!   `HttpRequest`, so one client serves any number of concurrent requests.
//! - Bodies are never buffered whole. Multipart files are read in chunks and
//!   response bytes go straight to the selected `Output`.
//! - Progress and diagnostics are pushed to an optional `EventSink`; with no
//!   sink attached they only reach `tracing`.
//! - Errors are one `ApiError` enum whose variants map onto the failure
//!   domains: URL, encoding, transport, tunnel, HTTP status, sink.

mod body;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod multipart;
pub mod sink;
pub mod transport;
pub mod tunnel;

pub use client::{Client, RequestOptions};
pub use config::ClientConfig;
pub use error::ApiError;
pub use events::{ConnectInfo, Event, EventSink, Progress};
pub use http::{HttpMethod, HttpRequest, ResponseBody, ResponseHead};
pub use multipart::{EncodeError, FormData, FormValue, MultipartBody, WriteError, BOUNDARY};
pub use sink::{Output, SaveTarget, DEFAULT_FILE_NAME};
pub use transport::{default_tls_config, Target};
pub use tunnel::{ProxyCredentials, TunnelAgent, TunnelError};

pub use ::http::header::{self, HeaderMap, HeaderName, HeaderValue};

//! Fake origin server used to exercise the client end to end.
//!
//! # Design
//! Every request passing through the router is recorded (method, path,
//! headers) so tests can assert on what actually reached the wire, e.g. that
//! `Authorization` was dropped after a cross-host redirect. Multipart uploads
//! are parsed and kept as receipts.

pub mod proxy;

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{multipart::MultipartError, Multipart, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

/// A request as seen by the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub id: Uuid,
    pub method: String,
    pub path: String,
    /// Lowercase names; repeated headers joined with `, `.
    pub headers: BTreeMap<String, String>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub size: usize,
}

/// Receipt for one multipart request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Upload {
    pub id: Uuid,
    pub method: String,
    pub fields: Vec<(String, String)>,
    pub files: Vec<UploadedFile>,
}

impl Upload {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Default)]
pub struct AppState {
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    uploads: Arc<RwLock<Vec<Upload>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().await.clone()
    }

    /// Recorded requests for `path`, oldest first.
    pub async fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests
            .read()
            .await
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub async fn uploads(&self) -> Vec<Upload> {
        self.uploads.read().await.clone()
    }
}

pub fn app() -> Router {
    app_with_state(AppState::new())
}

pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .route("/", get(page))
        .route("/page1", get(page))
        .route("/json", get(json_page))
        .route("/files/{name}", get(file_contents))
        .route("/bytes/{n}", get(fixed_bytes))
        .route("/chunked/{n}", get(chunked_bytes))
        .route("/relative_redirect", get(relative_redirect))
        .route("/absolute_redirect", get(absolute_redirect))
        .route("/cross_host", get(cross_host_redirect))
        .route("/chain/a", get(|| async { found("/chain/b") }))
        .route("/chain/b", get(|| async { found("/chain/c") }))
        .route("/chain/c", get(|| async { "end of chain" }))
        .route("/loop", get(|| async { found("/loop") }))
        .route("/no_location", get(no_location))
        .route("/error/{code}/{message}", get(json_error))
        .route("/text_error", get(text_error))
        .route("/post", post(post_form))
        .route("/put", put(put_form))
        .route("/upload", post(upload).put(upload))
        .route("/upload_redirect", post(upload_redirect))
        .route("/delete", delete(delete_resource))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), record))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_state(listener, AppState::new()).await
}

pub async fn run_with_state(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

async fn record(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let recorded = RecordedRequest {
        id: Uuid::new_v4(),
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
        headers: flatten_headers(request.headers()),
    };
    tracing::debug!(method = %recorded.method, path = %recorded.path, "request");
    state.requests.write().await.push(recorded);
    next.run(request).await
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        flat.entry(name.as_str().to_string())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(&value);
            })
            .or_insert(value);
    }
    flat
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn host(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string()
}

async fn page() -> &'static str {
    "A page"
}

async fn json_page() -> Json<serde_json::Value> {
    Json(json!({ "key": 12 }))
}

async fn file_contents(Path(name): Path<String>) -> String {
    format!("contents of {name}")
}

async fn fixed_bytes(Path(n): Path<usize>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        vec![b'x'; n],
    )
}

/// `n` bytes sent in 1000-byte chunks without a `Content-Length`.
async fn chunked_bytes(Path(n): Path<usize>) -> Response {
    let chunks: Vec<Vec<u8>> = (0..n)
        .step_by(1000)
        .map(|start| vec![b'y'; (n - start).min(1000)])
        .collect();
    let stream = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, Infallible>));
    Body::from_stream(stream).into_response()
}

async fn relative_redirect() -> Response {
    found("/page1")
}

async fn absolute_redirect(headers: HeaderMap) -> Response {
    found(&format!("http://{}/page1", host(&headers)))
}

/// Redirect to the same server under its other name, `localhost` <->
/// `127.0.0.1`, so the client sees a host change.
async fn cross_host_redirect(headers: HeaderMap) -> Response {
    let host = host(&headers);
    let (name, port) = host.split_once(':').unwrap_or((host.as_str(), "80"));
    let other = if name == "127.0.0.1" { "localhost" } else { "127.0.0.1" };
    found(&format!("http://{other}:{port}/json"))
}

/// 307 so the form is sent again to the new location. The body is read so
/// the socket is not reset under the client.
async fn upload_redirect(_body: axum::body::Bytes) -> Response {
    (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, "/upload")]).into_response()
}

async fn no_location() -> Response {
    (StatusCode::FOUND, "moved somewhere").into_response()
}

async fn json_error(Path((code, message)): Path<(u16, String)>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": message }))).into_response()
}

async fn text_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "server exploded").into_response()
}

async fn post_form(State(state): State<AppState>, multipart: Multipart) -> Result<&'static str, (StatusCode, String)> {
    store_upload(&state, "POST", multipart).await?;
    Ok("A post request")
}

async fn put_form(State(state): State<AppState>, multipart: Multipart) -> Result<&'static str, (StatusCode, String)> {
    store_upload(&state, "PUT", multipart).await?;
    Ok("A put request")
}

async fn upload(
    State(state): State<AppState>,
    method: axum::http::Method,
    multipart: Multipart,
) -> Result<Json<Upload>, (StatusCode, String)> {
    let receipt = store_upload(&state, method.as_str(), multipart).await?;
    Ok(Json(receipt))
}

async fn store_upload(
    state: &AppState,
    method: &str,
    mut multipart: Multipart,
) -> Result<Upload, (StatusCode, String)> {
    let mut receipt = Upload {
        id: Uuid::new_v4(),
        method: method.to_string(),
        fields: Vec::new(),
        files: Vec::new(),
    };
    while let Some(field) = multipart.next_field().await.map_err(rejection)? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_owned);
        let content_type = field.content_type().map(str::to_owned);
        let data = field.bytes().await.map_err(rejection)?;
        match file_name {
            Some(file_name) => receipt.files.push(UploadedFile {
                field: name,
                file_name,
                content_type,
                size: data.len(),
            }),
            None => receipt
                .fields
                .push((name, String::from_utf8_lossy(&data).into_owned())),
        }
    }
    state.uploads.write().await.push(receipt.clone());
    Ok(receipt)
}

fn rejection(e: MultipartError) -> (StatusCode, String) {
    (e.status(), e.body_text())
}

async fn delete_resource() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "404: File Not Found")
}

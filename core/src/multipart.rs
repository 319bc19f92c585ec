//! `multipart/form-data` encoding with an exact length computed up front.
//!
//! # Design
//! `FormData` is an ordered list of parts and is cheap to clone, so every
//! redirect hop can re-encode it. `MultipartBody::encode` turns it into a list
//! of segments: literal byte runs for boundaries, part headers and scalar
//! values, and file references for stream fields. File sizes are taken from
//! metadata during encoding, so a missing file fails before any socket is
//! opened and `Content-Length` is known before the first byte is written.
//!
//! Files are read in chunks while writing; each chunk produces its own
//! progress callback. A file that yields fewer bytes than were measured fails
//! the write instead of silently desynchronising the body.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::events::{Progress, ProgressCounter};

/// Boundary token shared by every encoded body.
pub const BOUNDARY: &str = "----courierformboundary";

const CONTENT_TYPE: &str = "multipart/form-data; boundary=----courierformboundary";

const FILE_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cannot stat `{}` for field `{field}`: {source}", path.display())]
    Stat {
        field: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{}` for field `{field}` is not a regular file", path.display())]
    NotAFile { field: String, path: PathBuf },
    #[error("cannot open `{}` for field `{field}`: {source}", path.display())]
    Open {
        field: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{}` for field `{field}` shrank while uploading: measured {measured} bytes, read {read}", path.display())]
    Shrunk {
        field: String,
        path: PathBuf,
        measured: u64,
        read: u64,
    },
}

/// Failure while streaming an encoded body.
#[derive(Debug, Error)]
pub enum WriteError {
    /// A stream field could not be opened or read in full.
    #[error(transparent)]
    Encoding(#[from] EncodeError),
    /// The destination (usually the socket) failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Value of one form part.
#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    /// Scalar field. Strings go in verbatim; anything else as JSON text.
    Field(Value),
    /// Stream field read from disk. `file_name` defaults to the path's file name.
    File {
        path: PathBuf,
        file_name: Option<String>,
    },
    /// Stream field held in memory.
    Bytes { data: Bytes, file_name: String },
}

impl From<&str> for FormValue {
    fn from(value: &str) -> Self {
        FormValue::Field(Value::String(value.to_string()))
    }
}

impl From<String> for FormValue {
    fn from(value: String) -> Self {
        FormValue::Field(Value::String(value))
    }
}

impl From<Value> for FormValue {
    fn from(value: Value) -> Self {
        FormValue::Field(value)
    }
}

/// Ordered field name to value mapping. Duplicate names are kept as separate parts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormData {
    parts: Vec<(String, FormValue)>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<FormValue>) -> Self {
        self.push(name, value);
        self
    }

    pub fn file(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.push(
            name,
            FormValue::File {
                path: path.into(),
                file_name: None,
            },
        );
        self
    }

    pub fn bytes(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.push(
            name,
            FormValue::Bytes {
                data: data.into(),
                file_name: file_name.into(),
            },
        );
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<FormValue>) {
        self.parts.push((name.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FormValue)> {
        self.parts.iter().map(|(name, value)| (name.as_str(), value))
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(Bytes),
    File { field: String, path: PathBuf, len: u64 },
}

impl Segment {
    fn len(&self) -> u64 {
        match self {
            Segment::Literal(bytes) => bytes.len() as u64,
            Segment::File { len, .. } => *len,
        }
    }
}

/// An encoded body, ready to be written.
#[derive(Debug, Clone)]
pub struct MultipartBody {
    segments: Vec<Segment>,
    content_length: u64,
}

impl MultipartBody {
    pub async fn encode(form: &FormData) -> Result<Self, EncodeError> {
        let mut segments = Vec::with_capacity(form.len() * 4 + 1);

        for (name, value) in form.iter() {
            segments.push(literal(format!("--{BOUNDARY}\r\n")));
            match value {
                FormValue::Field(value) => {
                    segments.push(literal(format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        escape_quotes(name)
                    )));
                    segments.push(literal(format!("{}\r\n", scalar_text(value))));
                }
                FormValue::File { path, file_name } => {
                    let len = measure(name, path).await?;
                    let file_name = file_name
                        .clone()
                        .unwrap_or_else(|| default_file_name(path));
                    segments.push(literal(stream_part_header(name, &file_name)));
                    segments.push(Segment::File {
                        field: name.to_string(),
                        path: path.clone(),
                        len,
                    });
                    segments.push(literal("\r\n".to_string()));
                }
                FormValue::Bytes { data, file_name } => {
                    segments.push(literal(stream_part_header(name, file_name)));
                    segments.push(Segment::Literal(data.clone()));
                    segments.push(literal("\r\n".to_string()));
                }
            }
        }
        segments.push(literal(format!("--{BOUNDARY}--\r\n")));

        let content_length = segments.iter().map(Segment::len).sum();
        Ok(Self {
            segments,
            content_length,
        })
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    /// `Content-Type` and `Content-Length` for this body.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(2);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.content_length));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
        headers
    }

    /// Stream the body into `writer`, calling `on_progress` once per literal
    /// segment and once per chunk read from a file. Returns the bytes written.
    pub async fn write_to<W, F>(&self, writer: &mut W, mut on_progress: F) -> Result<u64, WriteError>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(Progress),
    {
        let mut counter = ProgressCounter::new(Some(self.content_length));
        let mut buf = vec![0u8; FILE_CHUNK_SIZE];

        for segment in &self.segments {
            match segment {
                Segment::Literal(bytes) => {
                    writer.write_all(bytes).await?;
                    on_progress(counter.advance(bytes.len()));
                }
                Segment::File { field, path, len } => {
                    let file = tokio::fs::File::open(path).await.map_err(|source| {
                        EncodeError::Open {
                            field: field.clone(),
                            path: path.clone(),
                            source,
                        }
                    })?;
                    let mut file = file.take(*len);
                    let mut sent = 0u64;
                    loop {
                        let n = file.read(&mut buf).await.map_err(|source| EncodeError::Open {
                            field: field.clone(),
                            path: path.clone(),
                            source,
                        })?;
                        if n == 0 {
                            break;
                        }
                        writer.write_all(&buf[..n]).await?;
                        sent += n as u64;
                        on_progress(counter.advance(n));
                    }
                    if sent != *len {
                        return Err(EncodeError::Shrunk {
                            field: field.clone(),
                            path: path.clone(),
                            measured: *len,
                            read: sent,
                        }
                        .into());
                    }
                }
            }
        }
        writer.flush().await?;
        Ok(counter.pos())
    }

    /// Encode into memory. Intended for tests and small bodies.
    pub async fn to_vec(&self) -> Result<Vec<u8>, WriteError> {
        let mut out = Vec::with_capacity(self.content_length as usize);
        self.write_to(&mut out, |_| {}).await?;
        Ok(out)
    }
}

fn literal(text: String) -> Segment {
    Segment::Literal(Bytes::from(text))
}

fn stream_part_header(name: &str, file_name: &str) -> String {
    format!(
        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n",
        escape_quotes(name),
        escape_quotes(file_name)
    )
}

fn escape_quotes(s: &str) -> String {
    s.replace('"', "\\\"")
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn default_file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "blob".to_string())
}

async fn measure(field: &str, path: &Path) -> Result<u64, EncodeError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|source| EncodeError::Stat {
            field: field.to_string(),
            path: path.to_path_buf(),
            source,
        })?;
    if !meta.is_file() {
        return Err(EncodeError::NotAFile {
            field: field.to_string(),
            path: path.to_path_buf(),
        });
    }
    Ok(meta.len())
}

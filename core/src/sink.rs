//! Where response bytes go.
//!
//! # Design
//! The destination is chosen once per request with an explicit `Output`
//! variant; nothing is inferred from the runtime shape of a value. A path is
//! resolved against the request URL (directory vs. file name), directories are
//! created and the file is opened before any body byte is read, so a bad
//! destination fails early. Error responses always land in memory so they can
//! be parsed into a message.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use url::Url;

use crate::error::ApiError;
use crate::http::ResponseBody;

/// File name used when neither the destination nor the URL names one.
pub const DEFAULT_FILE_NAME: &str = "download.bin";

pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Destination for a successful response body.
#[derive(Default)]
pub enum Output {
    /// Buffer in memory and parse as JSON or text.
    #[default]
    Memory,
    /// Save to disk. A directory (existing, or ending in a separator) receives
    /// a file named after the URL; anything else is the file path itself.
    Path(PathBuf),
    /// Pipe into a caller-provided writer, which is shut down at the end.
    Writer(BoxWriter),
}

impl Output {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Output::Path(path.into())
    }

    pub fn writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Output::Writer(Box::new(writer))
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Memory => f.write_str("Memory"),
            Output::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Output::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// A save destination split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTarget {
    pub directory: PathBuf,
    pub file_name: Option<String>,
}

impl SaveTarget {
    pub fn resolve(save: &Path) -> Self {
        let text = save.to_string_lossy();
        let ends_with_separator = text.ends_with('/') || text.ends_with(std::path::MAIN_SEPARATOR);
        if ends_with_separator || save.is_dir() {
            return Self {
                directory: save.to_path_buf(),
                file_name: None,
            };
        }
        Self {
            directory: save
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            file_name: save
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
        }
    }

    /// Final file path, taking the name from the URL's last path segment
    /// when the destination does not carry one.
    pub fn file_path(&self, url: &Url) -> PathBuf {
        let name = self
            .file_name
            .clone()
            .or_else(|| file_name_from_url(url))
            .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
        self.directory.join(name)
    }
}

fn file_name_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let decoded = percent_decode_str(segment).decode_utf8_lossy();
    let name = decoded.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        None
    } else {
        Some(name.to_string())
    }
}

/// An opened destination for one exchange.
pub(crate) enum Sink {
    Memory(Vec<u8>),
    File { file: BufWriter<File>, path: PathBuf },
    Writer { writer: BoxWriter, bytes: u64 },
}

impl Sink {
    pub(crate) fn memory() -> Self {
        Sink::Memory(Vec::new())
    }

    /// Open `output` for the response to `url`.
    pub(crate) async fn open(output: Output, url: &Url) -> Result<Self, ApiError> {
        match output {
            Output::Memory => Ok(Sink::memory()),
            Output::Writer(writer) => Ok(Sink::Writer { writer, bytes: 0 }),
            Output::Path(save) => {
                let target = SaveTarget::resolve(&save);
                let path = target.file_path(url);
                let path = std::path::absolute(&path).map_err(|source| ApiError::Sink {
                    path: path.clone(),
                    source,
                })?;
                if !target.directory.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(&target.directory)
                        .await
                        .map_err(|source| ApiError::Sink {
                            path: target.directory.clone(),
                            source,
                        })?;
                }
                let file = File::create(&path).await.map_err(|source| ApiError::Sink {
                    path: path.clone(),
                    source,
                })?;
                Ok(Sink::File {
                    file: BufWriter::new(file),
                    path,
                })
            }
        }
    }

    /// Resolved file path, when saving to disk.
    pub(crate) fn path(&self) -> Option<&Path> {
        match self {
            Sink::File { path, .. } => Some(path),
            _ => None,
        }
    }

    pub(crate) async fn write(&mut self, chunk: &[u8]) -> Result<(), ApiError> {
        match self {
            Sink::Memory(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            Sink::File { file, path } => file.write_all(chunk).await.map_err(|source| ApiError::Sink {
                path: path.clone(),
                source,
            }),
            Sink::Writer { writer, bytes } => {
                writer.write_all(chunk).await.map_err(writer_error)?;
                *bytes += chunk.len() as u64;
                Ok(())
            }
        }
    }

    /// Flush and close the destination and produce the result value.
    pub(crate) async fn finish(self) -> Result<ResponseBody, ApiError> {
        match self {
            Sink::Memory(buf) => Ok(ResponseBody::from_bytes(&buf)),
            Sink::File { mut file, path } => {
                file.shutdown().await.map_err(|source| ApiError::Sink {
                    path: path.clone(),
                    source,
                })?;
                Ok(ResponseBody::Saved(path))
            }
            Sink::Writer { mut writer, bytes } => {
                writer.shutdown().await.map_err(writer_error)?;
                Ok(ResponseBody::Streamed { bytes })
            }
        }
    }
}

fn writer_error(source: io::Error) -> ApiError {
    ApiError::Sink {
        path: PathBuf::from("<writer>"),
        source,
    }
}

//! Response body framing.
//!
//! `BodyReader` hands out the body one chunk at a time so the engine can emit
//! exactly one progress event per chunk. It understands `Content-Length`,
//! `chunked` transfer coding and read-until-close bodies. A body that ends
//! before its declared framing is complete is an `UnexpectedEof` error.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::http::{HttpMethod, ResponseHead};

/// Limit for a chunk-size line or a trailer line.
const MAX_LINE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

impl Framing {
    pub(crate) fn of(method: HttpMethod, head: &ResponseHead) -> Self {
        if method == HttpMethod::Head
            || (100..200).contains(&head.status)
            || head.status == 204
            || head.status == 304
        {
            Framing::Empty
        } else if head.is_chunked() {
            Framing::Chunked
        } else if let Some(len) = head.content_length() {
            Framing::Length(len)
        } else {
            Framing::UntilClose
        }
    }
}

pub(crate) struct BodyReader<R> {
    reader: R,
    framing: Framing,
    /// Bytes left in the current chunk, or in the whole body for `Length`.
    remaining: u64,
    in_chunk: bool,
    done: bool,
}

impl<R> BodyReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub(crate) fn new(reader: R, framing: Framing) -> Self {
        let remaining = match framing {
            Framing::Length(len) => len,
            _ => 0,
        };
        Self {
            reader,
            framing,
            remaining,
            in_chunk: false,
            done: framing == Framing::Empty,
        }
    }

    /// Read the next chunk of body bytes into `buf`. Returns 0 at the end of the body.
    pub(crate) async fn next_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        match self.framing {
            Framing::Empty => Ok(0),
            Framing::UntilClose => {
                let n = self.reader.read(buf).await?;
                if n == 0 {
                    self.done = true;
                }
                Ok(n)
            }
            Framing::Length(_) => {
                if self.remaining == 0 {
                    self.done = true;
                    return Ok(0);
                }
                self.read_limited(buf).await
            }
            Framing::Chunked => {
                if self.remaining == 0 {
                    if self.in_chunk {
                        self.expect_crlf().await?;
                        self.in_chunk = false;
                    }
                    let size = self.read_chunk_size().await?;
                    if size == 0 {
                        self.skip_trailers().await?;
                        self.done = true;
                        return Ok(0);
                    }
                    self.remaining = size;
                    self.in_chunk = true;
                }
                self.read_limited(buf).await
            }
        }
    }

    /// Drain the rest of the body without keeping it.
    pub(crate) async fn drain(&mut self) -> io::Result<u64> {
        let mut buf = vec![0u8; 8 * 1024];
        let mut total = 0u64;
        loop {
            let n = self.next_chunk(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
        }
    }

    async fn read_limited(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.reader.read(&mut buf[..max]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed with {} body bytes outstanding", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }

    async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        let nr = (&mut self.reader)
            .take(MAX_LINE)
            .read_until(b'\n', &mut line)
            .await?;
        if nr == 0 || line.last() != Some(&b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside chunked framing",
            ));
        }
        Ok(line)
    }

    async fn read_chunk_size(&mut self) -> io::Result<u64> {
        let line = self.read_line().await?;
        let text = std::str::from_utf8(&line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let size = text.split(';').next().unwrap_or_default().trim();
        u64::from_str_radix(size, 16).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid chunk size line {:?}", text.trim_end()),
            )
        })
    }

    async fn expect_crlf(&mut self) -> io::Result<()> {
        let line = self.read_line().await?;
        if line == b"\r\n" || line == b"\n" {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing CRLF after chunk data",
            ))
        }
    }

    async fn skip_trailers(&mut self) -> io::Result<()> {
        loop {
            let line = self.read_line().await?;
            if line == b"\r\n" || line == b"\n" {
                return Ok(());
            }
        }
    }
}

//! Progress and debug notifications.
//!
//! # Design
//! Observers implement `EventSink`. A request with no sink is fully inert:
//! `Emitter` swallows every event. Closures and unbounded tokio channels are
//! sinks out of the box. Events are owned values so they can cross a channel.
//!
//! Debug strings are mirrored into `tracing` whether or not a sink is present.

use std::path::PathBuf;
use std::sync::Arc;

use http::HeaderMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::http::HttpMethod;

/// Byte progress of one direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Advertised total: `Content-Length` when reading, encoded length when writing.
    pub size: Option<u64>,
    /// Bytes transferred so far, including `delta`.
    pub pos: u64,
    /// Bytes in the chunk that produced this event.
    pub delta: u64,
}

/// Emitted once the response head of the final hop is in.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectInfo {
    pub status: u16,
    pub size: Option<u64>,
    pub headers: HeaderMap,
    /// Resolved file path when the body is being saved to disk.
    pub path: Option<PathBuf>,
    pub url: String,
    pub method: HttpMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Outgoing request headers, before connecting.
    Headers(HeaderMap),
    Connect(ConnectInfo),
    Read(Progress),
    Write(Progress),
    Debug(String),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Headers(_) => "api/headers",
            Event::Connect(_) => "api/connect",
            Event::Read(_) => "api/read",
            Event::Write(_) => "api/write",
            Event::Debug(_) => "debug",
        }
    }
}

/// Receiver of transfer events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl<F> EventSink for F
where
    F: Fn(Event) + Send + Sync,
{
    fn emit(&self, event: Event) {
        self(event)
    }
}

/// A dropped receiver is not an error; events are simply discarded.
impl EventSink for UnboundedSender<Event> {
    fn emit(&self, event: Event) {
        let _ = self.send(event);
    }
}

#[derive(Clone, Default)]
pub(crate) struct Emitter {
    sink: Option<Arc<dyn EventSink>>,
}

impl Emitter {
    pub(crate) fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        Self { sink }
    }

    fn emit(&self, event: Event) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    pub(crate) fn headers(&self, headers: &HeaderMap) {
        if self.sink.is_some() {
            self.emit(Event::Headers(headers.clone()));
        }
    }

    pub(crate) fn connect(&self, info: ConnectInfo) {
        self.emit(Event::Connect(info));
    }

    pub(crate) fn read(&self, progress: Progress) {
        tracing::trace!(pos = progress.pos, delta = progress.delta, "read");
        self.emit(Event::Read(progress));
    }

    pub(crate) fn write(&self, progress: Progress) {
        tracing::trace!(pos = progress.pos, delta = progress.delta, "write");
        self.emit(Event::Write(progress));
    }

    pub(crate) fn debug(&self, message: String) {
        tracing::debug!("{message}");
        self.emit(Event::Debug(message));
    }
}

/// Running position for one direction of a transfer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProgressCounter {
    size: Option<u64>,
    pos: u64,
}

impl ProgressCounter {
    pub(crate) fn new(size: Option<u64>) -> Self {
        Self { size, pos: 0 }
    }

    pub(crate) fn advance(&mut self, delta: usize) -> Progress {
        let delta = delta as u64;
        self.pos += delta;
        Progress {
            size: self.size,
            pos: self.pos,
            delta,
        }
    }

    pub(crate) fn pos(&self) -> u64 {
        self.pos
    }
}

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::NetError;

pub const DEFAULT_MIN_READ: usize = 1;
pub const DEFAULT_MAX_READ: usize = 2048;
pub const MAX_READ: usize = skein_transport::MAX_READ_LEN;

/// What a link's completion handler asks of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFlow {
    Continue,
    /// Tear the stream down and drop every queued link.
    Stop,
}

/// Bytes delivered to a read handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadChunk {
    pub data: Option<Bytes>,
    pub eof: bool,
}

/// Inclusive length bounds for one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBounds {
    pub min: usize,
    pub max: usize,
}

impl ReadBounds {
    /// `max` lies in `1..=MAX_READ` and `min` never exceeds it.
    pub fn new(min: usize, max: usize) -> Self {
        let max = max.clamp(1, MAX_READ);
        Self { min: min.min(max), max }
    }
}

impl Default for ReadBounds {
    fn default() -> Self { Self::new(DEFAULT_MIN_READ, DEFAULT_MAX_READ) }
}

pub type WriteHandler = Box<dyn FnOnce(Option<&NetError>) -> ChainFlow + Send>;
pub type ReadHandler = Box<dyn FnOnce(ReadChunk, Option<&NetError>) -> ChainFlow + Send>;

/// One queued operation against a duplex stream.
pub enum ChainLink {
    Write { data: Bytes, timeout: Duration, handler: WriteHandler },
    Read { bounds: ReadBounds, timeout: Duration, handler: ReadHandler },
    /// Write, then read the reply.
    Communicate { data: Bytes, bounds: ReadBounds, timeout: Duration, handler: ReadHandler },
    CloseWrite,
    CloseRead,
}

impl ChainLink {
    pub fn kind(&self) -> &'static str {
        match self {
            ChainLink::Write { .. } => "write",
            ChainLink::Read { .. } => "read",
            ChainLink::Communicate { .. } => "communicate",
            ChainLink::CloseWrite => "close-write",
            ChainLink::CloseRead => "close-read",
        }
    }

    /// Complete the link with `error` without running it.
    pub(crate) fn reject(self, error: NetError) {
        match self {
            ChainLink::Write { handler, .. } => {
                handler(Some(&error));
            }
            ChainLink::Read { handler, .. } | ChainLink::Communicate { handler, .. } => {
                handler(ReadChunk::default(), Some(&error));
            }
            ChainLink::CloseWrite | ChainLink::CloseRead => {}
        }
    }
}

impl fmt::Debug for ChainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainLink::Write { data, timeout, .. } => f
                .debug_struct("Write")
                .field("len", &data.len())
                .field("timeout", timeout)
                .finish_non_exhaustive(),
            ChainLink::Read { bounds, timeout, .. } => f
                .debug_struct("Read")
                .field("bounds", bounds)
                .field("timeout", timeout)
                .finish_non_exhaustive(),
            ChainLink::Communicate { data, bounds, timeout, .. } => f
                .debug_struct("Communicate")
                .field("len", &data.len())
                .field("bounds", bounds)
                .field("timeout", timeout)
                .finish_non_exhaustive(),
            ChainLink::CloseWrite => write!(f, "CloseWrite"),
            ChainLink::CloseRead => write!(f, "CloseRead"),
        }
    }
}

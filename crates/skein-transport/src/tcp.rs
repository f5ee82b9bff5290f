//! Duplex byte streams over tokio TCP, optionally wrapped in TLS.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use skein_config::ConfigurationSnapshot;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Result, TransportError, TransportErrorKind};
use crate::stream::{StreamConnection, StreamEvent, StreamEventSink, StreamTransport};
use crate::types::{MAX_READ_LEN, ReadOutcome, StreamTarget};

/// Buffer growth step for one read; large bounds are never allocated up front.
const READ_CHUNK: usize = 16 * 1024;

trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

type Io = Box<dyn AsyncIo>;

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self { Self }
}

impl StreamTransport for TcpTransport {
    type Connection = TcpConnection;

    fn open(
        &self,
        config: &ConfigurationSnapshot,
        target: StreamTarget,
        events: StreamEventSink,
    ) -> Result<TcpConnection> {
        let (host, port) = match target {
            StreamTarget::Host { host, port } => (host, port),
            StreamTarget::Service(name) => parse_authority(&name)?,
        };
        let (state, _) = watch::channel(ConnectState::Pending);
        Ok(TcpConnection {
            inner: Arc::new(Inner {
                host,
                port,
                connect_timeout: config.request_timeout(),
                events,
                state,
                reader: Mutex::new(None),
                writer: Mutex::new(None),
                started: AtomicBool::new(false),
                read_closed: AtomicBool::new(false),
                write_closed: AtomicBool::new(false),
                invalidated: AtomicBool::new(false),
                finishing: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                cancel: CancellationToken::new(),
            }),
        })
    }
}

/// Split `host:port`, accepting a bracketed IPv6 host.
fn parse_authority(name: &str) -> Result<(String, u16)> {
    let (host, port) = name
        .rsplit_once(':')
        .ok_or_else(|| TransportError::invalid_request(format!("service `{name}` has no port")))?;
    let port = port
        .parse()
        .map_err(|_| TransportError::invalid_request(format!("service `{name}` has a bad port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(TransportError::invalid_request(format!("service `{name}` has no host")));
    }
    Ok((host.to_string(), port))
}

#[derive(Debug, Clone)]
enum ConnectState {
    Pending,
    Ready,
    Failed(TransportError),
}

pub struct TcpConnection {
    inner: Arc<Inner>,
}

struct Inner {
    host: String,
    port: u16,
    connect_timeout: Duration,
    events: StreamEventSink,
    state: watch::Sender<ConnectState>,
    reader: Mutex<Option<ReadHalf<Io>>>,
    writer: Mutex<Option<WriteHalf<Io>>>,
    started: AtomicBool,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
    invalidated: AtomicBool,
    finishing: AtomicBool,
    completed: AtomicBool,
    in_flight: AtomicUsize,
    cancel: CancellationToken,
}

impl Inner {
    fn emit(&self, event: StreamEvent) {
        if self.events.send(event).is_err() {
            trace!("stream event receiver gone");
        }
    }

    fn complete(&self, error: Option<TransportError>) {
        if !self.completed.swap(true, Ordering::AcqRel) {
            self.emit(StreamEvent::Completed { error });
        }
    }

    async fn connect(&self, secure: bool) -> Result<Io> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let tcp = if self.connect_timeout.is_zero() {
            connect.await?
        } else {
            tokio::time::timeout(self.connect_timeout, connect)
                .await
                .map_err(|_| TransportError::timeout(format!("connecting to {}:{}", self.host, self.port)))??
        };
        tcp.set_nodelay(true)?;
        if !secure {
            return Ok(Box::new(tcp));
        }

        let connector = tokio_native_tls::native_tls::TlsConnector::new()
            .map_err(|e| TransportError::new(TransportErrorKind::Tls, e.to_string()))?;
        let tls = tokio_native_tls::TlsConnector::from(connector)
            .connect(&self.host, tcp)
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Tls, e.to_string()))?;
        Ok(Box::new(tls))
    }

    async fn ready(&self) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(TransportError::closed("connection not started"));
        }
        let mut state = self.state.subscribe();
        let state = state
            .wait_for(|s| !matches!(s, ConnectState::Pending))
            .await
            .map_err(|_| TransportError::closed("connection dropped"))?;
        if let ConnectState::Failed(e) = &*state {
            return Err(e.clone());
        }
        Ok(())
    }

    /// Run one read or write under the cancellation token and `timeout`.
    async fn operation<T>(&self, timeout: Duration, op: impl Future<Output = Result<T>>) -> Result<T> {
        if self.invalidated.load(Ordering::Acquire) {
            return Err(TransportError::closed("connection invalidated"));
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let bounded = async {
            if timeout.is_zero() {
                op.await
            } else {
                tokio::time::timeout(timeout, op)
                    .await
                    .map_err(|_| TransportError::timeout("stream operation timed out"))?
            }
        };
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::cancelled()),
            result = bounded => result,
        };
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 && self.finishing.load(Ordering::Acquire) {
            self.shut_down(None).await;
        }
        result
    }

    async fn shut_down(&self, error: Option<TransportError>) {
        self.cancel.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
        self.complete(error);
    }
}

impl StreamConnection for TcpConnection {
    fn start(&self, secure: bool) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let connected = tokio::select! {
                _ = inner.cancel.cancelled() => Err(TransportError::cancelled()),
                io = inner.connect(secure) => io,
            };
            match connected {
                Ok(io) => {
                    let (reader, writer) = tokio::io::split(io);
                    *inner.reader.lock().await = Some(reader);
                    *inner.writer.lock().await = Some(writer);
                    debug!(host = %inner.host, port = inner.port, secure, "stream connected");
                    inner.state.send_replace(ConnectState::Ready);
                }
                Err(e) => {
                    warn!(host = %inner.host, port = inner.port, error = %e, "stream connect failed");
                    inner.state.send_replace(ConnectState::Failed(e.clone()));
                    inner.complete(Some(e));
                }
            }
        });
    }

    async fn write(&self, data: Bytes, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        if inner.write_closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("write side closed"));
        }
        inner
            .operation(timeout, async {
                inner.ready().await?;
                let mut guard = inner.writer.lock().await;
                let writer = guard.as_mut().ok_or_else(|| TransportError::closed("write side closed"))?;
                writer.write_all(&data).await?;
                writer.flush().await?;
                Ok(())
            })
            .await
    }

    async fn read(&self, min: usize, max: usize, timeout: Duration) -> Result<ReadOutcome> {
        let inner = &self.inner;
        if inner.read_closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("read side closed"));
        }
        let max = max.clamp(1, MAX_READ_LEN);
        let min = min.min(max);
        inner
            .operation(timeout, async {
                inner.ready().await?;
                let mut guard = inner.reader.lock().await;
                let reader = guard.as_mut().ok_or_else(|| TransportError::closed("read side closed"))?;

                let mut buf = BytesMut::with_capacity(max.min(READ_CHUNK));
                let mut eof = false;
                while buf.len() < max {
                    let remaining = max - buf.len();
                    buf.reserve(remaining.min(READ_CHUNK));
                    let n = (&mut *reader).take(remaining as u64).read_buf(&mut buf).await?;
                    if n == 0 {
                        eof = true;
                        break;
                    }
                    if buf.len() >= min {
                        break;
                    }
                }
                Ok(ReadOutcome { data: (!buf.is_empty()).then(|| buf.freeze()), eof })
            })
            .await
    }

    fn close_read(&self) {
        if self.inner.read_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.reader.lock().await.take();
            inner.emit(StreamEvent::ReadClosed);
        });
    }

    fn close_write(&self) {
        if self.inner.write_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Some(mut writer) = inner.writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
            inner.emit(StreamEvent::WriteClosed);
        });
    }

    fn invalidate_and_cancel(&self) {
        if self.inner.invalidated.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(host = %self.inner.host, "invalidating stream connection");
        let inner = self.inner.clone();
        // cancel first so a pending read releases the reader lock
        inner.cancel.cancel();
        tokio::spawn(async move { inner.shut_down(Some(TransportError::cancelled())).await });
    }

    fn finish_tasks_and_invalidate(&self) {
        if self.inner.invalidated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.finishing.store(true, Ordering::Release);
        if self.inner.in_flight.load(Ordering::Acquire) == 0 {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.shut_down(None).await });
        }
    }
}

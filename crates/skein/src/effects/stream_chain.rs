use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use skein_config::ConfigurationManager;
use skein_transport::{
    AuthChallenge, AuthDisposition, ReadOutcome, StreamConnection, StreamEvent, StreamTarget,
    StreamTransport,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::data::{ChainFlow, ChainLink, ReadBounds, ReadChunk, ReadHandler};
use crate::effects::token::{Cancellable, CancellationToken};
use crate::error::NetError;

type AuthHandler = Arc<dyn Fn(&AuthChallenge) -> AuthDisposition + Send + Sync>;
/// Receives (torn down because of an error, transport error).
type CompletionHandler = Arc<dyn Fn(bool, Option<&NetError>) + Send + Sync>;
/// Receives whether the chain was torn down because of an error.
type CloseHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Strict FIFO chain of operations over one duplex stream.
///
/// Links run one at a time. A link's handler may return [`ChainFlow::Stop`];
/// stopping or failing half-closes both directions, invalidates the
/// connection and drops every queued link. A drained chain stays connected.
///
/// Must be used from within a tokio runtime.
pub struct StreamChainOrchestrator<T: StreamTransport> {
    inner: Arc<StreamInner<T>>,
}

struct StreamInner<T: StreamTransport> {
    transport: T,
    config: Mutex<ConfigurationManager>,
    handlers: RwLock<Handlers>,
    connection: Mutex<Option<Arc<T::Connection>>>,
    chain: Mutex<ChainState>,
    events: mpsc::UnboundedSender<StreamEvent>,
    pending_events: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
    shutdown: tokio_util::sync::CancellationToken,
}

#[derive(Default)]
struct Handlers {
    session_auth: Option<AuthHandler>,
    task_auth: Option<AuthHandler>,
    on_complete: Option<CompletionHandler>,
    on_read_closed: Option<CloseHandler>,
    on_write_closed: Option<CloseHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ChainPhase {
    #[default]
    Idle,
    Executing,
    TornDown,
}

/// Every flag a teardown reads, under one lock.
#[derive(Default)]
struct ChainState {
    /// Bumped by every reconnect; a drive loop only acts on its own generation.
    generation: u64,
    links: VecDeque<ChainLink>,
    phase: ChainPhase,
    read_closed: bool,
    write_closed: bool,
    failed: bool,
    finish_after_current: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Advance,
    Stop,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TearDown {
    Stop,
    Fail,
    Cancel,
    Finish,
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Read,
    Write,
}

impl<T: StreamTransport> StreamChainOrchestrator<T> {
    pub fn new(transport: T) -> Self { Self::with_configuration(transport, ConfigurationManager::default()) }

    pub fn with_configuration(transport: T, config: ConfigurationManager) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(StreamInner {
                transport,
                config: Mutex::new(config),
                handlers: RwLock::new(Handlers::default()),
                connection: Mutex::new(None),
                chain: Mutex::new(ChainState::default()),
                events,
                pending_events: Mutex::new(Some(events_rx)),
                shutdown: tokio_util::sync::CancellationToken::new(),
            }),
        }
    }

    /// Prepare a connection to `host:port`, replacing any previous one.
    pub fn connect_to(&self, host: impl Into<String>, port: u16) -> &Self {
        self.inner.open(StreamTarget::Host { host: host.into(), port });
        self
    }

    pub fn connect_to_service(&self, name: impl Into<String>) -> &Self {
        self.inner.open(StreamTarget::Service(name.into()));
        self
    }

    pub fn start_connect(&self) -> CancellationToken { self.start(false) }

    pub fn start_secure_connect(&self) -> CancellationToken { self.start(true) }

    fn start(&self, secure: bool) -> CancellationToken {
        self.inner.spawn_dispatcher();
        match self.inner.connection.lock().as_ref() {
            Some(conn) => conn.start(secure),
            None => warn!("start requested without a connection"),
        }
        let target: Arc<dyn Cancellable> = self.inner.clone();
        CancellationToken::new(Arc::downgrade(&target))
    }

    /// Write `data`, then read a reply within `bounds`.
    pub fn communicate(
        &self,
        data: impl Into<Bytes>,
        bounds: ReadBounds,
        timeout: Option<Duration>,
        handler: impl FnOnce(ReadChunk, Option<&NetError>) -> ChainFlow + Send + 'static,
    ) -> &Self {
        let timeout = self.inner.resolve(timeout);
        self.inner.enqueue(ChainLink::Communicate {
            data: data.into(),
            bounds,
            timeout,
            handler: Box::new(handler),
        });
        self
    }

    pub fn write(
        &self,
        data: impl Into<Bytes>,
        timeout: Option<Duration>,
        handler: impl FnOnce(Option<&NetError>) -> ChainFlow + Send + 'static,
    ) -> &Self {
        let timeout = self.inner.resolve(timeout);
        self.inner.enqueue(ChainLink::Write { data: data.into(), timeout, handler: Box::new(handler) });
        self
    }

    pub fn read(
        &self,
        bounds: ReadBounds,
        timeout: Option<Duration>,
        handler: impl FnOnce(ReadChunk, Option<&NetError>) -> ChainFlow + Send + 'static,
    ) -> &Self {
        let timeout = self.inner.resolve(timeout);
        self.inner.enqueue(ChainLink::Read { bounds, timeout, handler: Box::new(handler) });
        self
    }

    pub fn close_write_stream(&self) -> &Self {
        self.inner.enqueue(ChainLink::CloseWrite);
        self
    }

    pub fn close_read_stream(&self) -> &Self {
        self.inner.enqueue(ChainLink::CloseRead);
        self
    }

    /// Links waiting behind the one executing.
    pub fn queued(&self) -> usize { self.inner.chain.lock().links.len() }

    pub fn is_torn_down(&self) -> bool { self.inner.chain.lock().phase == ChainPhase::TornDown }

    pub fn on_complete(&self, handler: impl Fn(bool, Option<&NetError>) + Send + Sync + 'static) -> &Self {
        self.inner.handlers.write().on_complete = Some(Arc::new(handler));
        self
    }

    pub fn on_read_closed(&self, handler: impl Fn(bool) + Send + Sync + 'static) -> &Self {
        self.inner.handlers.write().on_read_closed = Some(Arc::new(handler));
        self
    }

    pub fn on_write_closed(&self, handler: impl Fn(bool) + Send + Sync + 'static) -> &Self {
        self.inner.handlers.write().on_write_closed = Some(Arc::new(handler));
        self
    }

    pub fn session_auth(
        &self,
        handler: impl Fn(&AuthChallenge) -> AuthDisposition + Send + Sync + 'static,
    ) -> &Self {
        self.inner.handlers.write().session_auth = Some(Arc::new(handler));
        self
    }

    pub fn task_auth(
        &self,
        handler: impl Fn(&AuthChallenge) -> AuthDisposition + Send + Sync + 'static,
    ) -> &Self {
        self.inner.handlers.write().task_auth = Some(Arc::new(handler));
        self
    }

    /// Edit the configuration used for the next connection.
    pub fn configure(&self, f: impl FnOnce(&mut ConfigurationManager)) -> &Self {
        f(&mut self.inner.config.lock());
        self
    }

    pub fn request_timeout(&self, timeout: Duration) -> &Self { self.configure(|c| c.set_request_timeout(timeout)) }
}

impl<T: StreamTransport> StreamInner<T> {
    fn spawn_dispatcher(self: &Arc<Self>) {
        if let Some(events) = self.pending_events.lock().take() {
            tokio::spawn(run_dispatcher(Arc::downgrade(self), events, self.shutdown.clone()));
        }
    }

    fn resolve(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.config.lock().request_timeout())
    }

    fn open(self: &Arc<Self>, target: StreamTarget) {
        self.spawn_dispatcher();
        if let Some(previous) = self.connection.lock().take() {
            debug!("replacing stream connection");
            previous.invalidate_and_cancel();
        }
        let stale = {
            let mut chain = self.chain.lock();
            let generation = chain.generation + 1;
            std::mem::replace(&mut *chain, ChainState { generation, ..ChainState::default() })
        };
        drop(stale);

        let snapshot = self.config.lock().snapshot();
        match self.transport.open(&snapshot, target.clone(), self.events.clone()) {
            Ok(conn) => {
                debug!(%target, "stream connection prepared");
                *self.connection.lock() = Some(Arc::new(conn));
            }
            Err(error) => {
                warn!(%target, %error, "stream connection could not be opened");
                self.chain.lock().failed = true;
                let _ = self.events.send(StreamEvent::Completed { error: Some(error) });
            }
        }
    }

    fn enqueue(self: &Arc<Self>, link: ChainLink) {
        let mut chain = self.chain.lock();
        if chain.phase == ChainPhase::TornDown || chain.finish_after_current {
            drop(chain);
            trace!(kind = link.kind(), "chain closing, rejecting link");
            link.reject(NetError::ChainTornDown);
            return;
        }
        chain.links.push_back(link);
        if chain.phase == ChainPhase::Idle {
            chain.phase = ChainPhase::Executing;
            let generation = chain.generation;
            drop(chain);
            tokio::spawn(drive(self.clone(), generation));
        }
    }

    async fn execute(&self, link: ChainLink) -> Step {
        let conn = self.connection.lock().clone();
        let Some(conn) = conn else {
            trace!(kind = link.kind(), "no connection for link");
            link.reject(NetError::NotConnected);
            return Step::Advance;
        };
        trace!(kind = link.kind(), "executing link");

        match link {
            ChainLink::Write { data, timeout, handler } => match conn.write(data, timeout).await {
                Ok(()) => flow(handler(None)),
                Err(error) => {
                    let error = NetError::from(error);
                    handler(Some(&error));
                    Step::Fail
                }
            },
            ChainLink::Read { bounds, timeout, handler } => read_leg(&*conn, bounds, timeout, handler).await,
            ChainLink::Communicate { data, bounds, timeout, handler } => match conn.write(data, timeout).await {
                Ok(()) => read_leg(&*conn, bounds, timeout, handler).await,
                Err(error) => {
                    let error = NetError::from(error);
                    handler(ReadChunk::default(), Some(&error));
                    Step::Fail
                }
            },
            ChainLink::CloseWrite => {
                self.close_side(&*conn, Side::Write);
                Step::Advance
            }
            ChainLink::CloseRead => {
                self.close_side(&*conn, Side::Read);
                Step::Advance
            }
        }
    }

    /// Half-close one side once; later calls are no-ops.
    fn close_side(&self, conn: &T::Connection, side: Side) {
        let first = {
            let mut chain = self.chain.lock();
            let flag = match side {
                Side::Read => &mut chain.read_closed,
                Side::Write => &mut chain.write_closed,
            };
            !std::mem::replace(flag, true)
        };
        if !first {
            trace!(?side, "side already closed");
            return;
        }
        match side {
            Side::Read => conn.close_read(),
            Side::Write => conn.close_write(),
        }
    }

    /// Tear down the chain of `generation`; a superseded generation is left alone.
    fn tear_down(&self, reason: TearDown, generation: u64) {
        let (dropped, close_read, close_write) = {
            let mut chain = self.chain.lock();
            if chain.phase == ChainPhase::TornDown || chain.generation != generation {
                return;
            }
            chain.phase = ChainPhase::TornDown;
            chain.failed |= reason == TearDown::Fail;
            let close_read = !std::mem::replace(&mut chain.read_closed, true);
            let close_write = !std::mem::replace(&mut chain.write_closed, true);
            (std::mem::take(&mut chain.links), close_read, close_write)
        };

        let conn = self.connection.lock().take();
        if let Some(conn) = conn {
            if close_read {
                conn.close_read();
            }
            if close_write {
                conn.close_write();
            }
            match reason {
                TearDown::Finish => conn.finish_tasks_and_invalidate(),
                TearDown::Stop | TearDown::Fail | TearDown::Cancel => conn.invalidate_and_cancel(),
            }
        }
        debug!(?reason, dropped = dropped.len(), "stream chain torn down");
        drop(dropped);
    }

    fn handle(&self, event: StreamEvent) {
        let failed = self.chain.lock().failed;
        match event {
            StreamEvent::ReadClosed => {
                let handler = self.handlers.read().on_read_closed.clone();
                if let Some(handler) = handler {
                    handler(failed);
                }
            }
            StreamEvent::WriteClosed => {
                let handler = self.handlers.read().on_write_closed.clone();
                if let Some(handler) = handler {
                    handler(failed);
                }
            }
            StreamEvent::Completed { error } => {
                let handler = self.handlers.read().on_complete.clone();
                if let Some(handler) = handler {
                    let error = error.map(NetError::from);
                    handler(failed, error.as_ref());
                }
            }
            StreamEvent::SessionAuthChallenge { challenge, reply } => {
                let handler = self.handlers.read().session_auth.clone();
                let _ = reply.send(handler.map(|h| h(&challenge)).unwrap_or_default());
            }
            StreamEvent::TaskAuthChallenge { challenge, reply } => {
                let handler = self.handlers.read().task_auth.clone();
                let _ = reply.send(handler.map(|h| h(&challenge)).unwrap_or_default());
            }
        }
    }
}

fn flow(decision: ChainFlow) -> Step {
    match decision {
        ChainFlow::Continue => Step::Advance,
        ChainFlow::Stop => Step::Stop,
    }
}

/// An empty read without a transport error counts as a failure.
async fn read_leg<C: StreamConnection>(
    conn: &C,
    bounds: ReadBounds,
    timeout: Duration,
    handler: ReadHandler,
) -> Step {
    match conn.read(bounds.min, bounds.max, timeout).await {
        Ok(ReadOutcome { data: Some(data), eof }) if !data.is_empty() => {
            flow(handler(ReadChunk { data: Some(data), eof }, None))
        }
        Ok(ReadOutcome { eof, .. }) => {
            handler(ReadChunk { data: None, eof }, Some(&NetError::NoDataFromStream));
            Step::Fail
        }
        Err(error) => {
            let error = NetError::from(error);
            handler(ReadChunk::default(), Some(&error));
            Step::Fail
        }
    }
}

/// Runs queued links of one generation until the chain drains or is torn down.
async fn drive<T: StreamTransport>(inner: Arc<StreamInner<T>>, generation: u64) {
    loop {
        let link = {
            let mut chain = inner.chain.lock();
            if chain.generation != generation || chain.phase != ChainPhase::Executing {
                return;
            }
            match chain.links.pop_front() {
                Some(link) => link,
                None if chain.finish_after_current => {
                    drop(chain);
                    inner.tear_down(TearDown::Finish, generation);
                    return;
                }
                None => {
                    chain.phase = ChainPhase::Idle;
                    trace!("stream chain drained");
                    return;
                }
            }
        };

        match inner.execute(link).await {
            Step::Advance => {}
            Step::Stop => {
                inner.tear_down(TearDown::Stop, generation);
                return;
            }
            Step::Fail => {
                inner.tear_down(TearDown::Fail, generation);
                return;
            }
        }
    }
}

impl<T: StreamTransport> Cancellable for StreamInner<T> {
    fn cancel_now(&self) {
        let generation = self.chain.lock().generation;
        self.tear_down(TearDown::Cancel, generation)
    }

    fn cancel_after_current(&self) {
        let mut chain = self.chain.lock();
        let generation = chain.generation;
        match chain.phase {
            ChainPhase::Executing => {
                chain.finish_after_current = true;
                let dropped = std::mem::take(&mut chain.links);
                drop(chain);
                debug!(dropped = dropped.len(), "stream chain finishing current link");
            }
            ChainPhase::Idle => {
                drop(chain);
                self.tear_down(TearDown::Finish, generation);
            }
            ChainPhase::TornDown => {}
        }
    }
}

impl<T: StreamTransport> Drop for StreamInner<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(conn) = self.connection.get_mut().take() {
            conn.invalidate_and_cancel();
        }
    }
}

async fn run_dispatcher<T: StreamTransport>(
    weak: Weak<StreamInner<T>>,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = weak.upgrade() else { break };
        inner.handle(event);
    }
    trace!("stream dispatcher stopped");
}

//! Scripted transports for exercising orchestrators without a network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::Mutex;
use skein_config::ConfigurationSnapshot;
use tokio::sync::{Notify, oneshot};
use tokio::task::AbortHandle;
use url::Url;

use crate::error::{Result, TransportError};
use crate::http::{EventSink, HttpSession, HttpTransport, TransportEvent};
use crate::stream::{StreamConnection, StreamEvent, StreamEventSink, StreamTransport};
use crate::types::{
    AuthChallenge, AuthDisposition, Body, ProtectionSpace, ReadOutcome, Request, Response,
    StreamTarget, TaskId, TaskMetrics, TaskRequest,
};

/// What the mock does with one dispatched task.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Respond { status: u16, body: Bytes },
    /// Propose a redirect to `location`; a followed redirect answers 200 there.
    Redirect { location: Url },
    /// Raise a task auth challenge; a credential answers 200, anything else 401.
    Challenge,
    /// Same as `Challenge`, raised at session level.
    SessionChallenge,
    /// Deliver `body` as a chunk, then fail with `error`.
    PartialFail { body: Bytes, error: TransportError },
    Fail(TransportError),
    /// Complete with neither response nor error.
    NoResponse,
    /// Never complete until the session is invalidated.
    Pending,
}

impl MockOutcome {
    pub fn ok(body: &'static [u8]) -> Self {
        MockOutcome::Respond { status: 200, body: Bytes::from_static(body) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub task: TaskId,
    pub kind: &'static str,
    pub url: Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    Cancel,
    Finish,
}

type Script = Box<dyn Fn(&Dispatch) -> MockOutcome + Send + Sync>;

struct HttpState {
    script: Script,
    delay: Duration,
    log: Mutex<Vec<Dispatch>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    snapshots: Mutex<Vec<ConfigurationSnapshot>>,
    invalidations: Mutex<Vec<Invalidation>>,
}

/// HTTP transport answering every task from a script.
///
/// Clones share state, so a test can keep one handle for inspection while the
/// orchestrator owns another.
#[derive(Clone)]
pub struct MockHttpTransport {
    state: Arc<HttpState>,
}

impl MockHttpTransport {
    pub fn new(script: impl Fn(&Dispatch) -> MockOutcome + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(HttpState {
                script: Box::new(script),
                delay: Duration::from_millis(5),
                log: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                snapshots: Mutex::new(Vec::new()),
                invalidations: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn dispatches(&self) -> Vec<Dispatch> { self.state.log.lock().clone() }

    pub fn max_in_flight(&self) -> usize { self.state.max_in_flight.load(Ordering::SeqCst) }

    pub fn sessions_opened(&self) -> usize { self.state.snapshots.lock().len() }

    pub fn last_snapshot(&self) -> Option<ConfigurationSnapshot> {
        self.state.snapshots.lock().last().cloned()
    }

    pub fn invalidations(&self) -> Vec<Invalidation> { self.state.invalidations.lock().clone() }
}

impl HttpTransport for MockHttpTransport {
    type Session = MockHttpSession;

    fn open_session(&self, config: &ConfigurationSnapshot, events: EventSink) -> Result<MockHttpSession> {
        self.state.snapshots.lock().push(config.clone());
        Ok(MockHttpSession {
            shared: Arc::new(SessionShared {
                state: self.state.clone(),
                events,
                tasks: Mutex::new(HashMap::new()),
                closed: Mutex::new(false),
            }),
        })
    }
}

pub struct MockHttpSession {
    shared: Arc<SessionShared>,
}

struct SessionShared {
    state: Arc<HttpState>,
    events: EventSink,
    tasks: Mutex<HashMap<TaskId, AbortHandle>>,
    closed: Mutex<bool>,
}

impl SessionShared {
    fn complete(
        &self,
        task: TaskId,
        started: Instant,
        bytes_sent: u64,
        response: Option<Response>,
        error: Option<TransportError>,
    ) {
        if self.tasks.lock().remove(&task).is_none() {
            return;
        }
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(response) = &response {
            let metrics = TaskMetrics {
                fetch_start: SystemTime::now(),
                duration: started.elapsed(),
                redirect_count: 0,
                bytes_sent,
                bytes_received: 0,
                status: Some(response.status),
            };
            let _ = self.events.send(TransportEvent::MetricsCollected { task, metrics });
        }
        let _ = self.events.send(TransportEvent::Completed { task, response, error });
    }

    async fn run(&self, dispatch: Dispatch, request: TaskRequest) {
        tokio::time::sleep(self.state.delay).await;
        let started = Instant::now();
        let task = dispatch.task;
        let url = dispatch.url.clone();
        let is_download = matches!(request, TaskRequest::Download(_));
        let sent = self.upload(task, request).await;

        match (self.state.script)(&dispatch) {
            MockOutcome::Respond { status, body } => {
                let response = Response::new(url, status);
                self.deliver(task, is_download, body).await;
                self.complete(task, started, sent, Some(response), None);
            }
            MockOutcome::Redirect { location } => {
                let (reply, answer) = oneshot::channel();
                let _ = self.events.send(TransportEvent::Redirect {
                    task,
                    response: Response::new(url.clone(), 302),
                    proposed: Request::get(location),
                    reply,
                });
                let response = match answer.await {
                    Ok(Some(next)) => Response::new(next.url, 200),
                    _ => Response::new(url, 302),
                };
                self.complete(task, started, sent, Some(response), None);
            }
            MockOutcome::Challenge => {
                let (reply, answer) = oneshot::channel();
                let challenge = challenge_for(&url);
                let _ = self.events.send(TransportEvent::TaskAuthChallenge { task, challenge, reply });
                let status = status_for(answer.await);
                self.complete(task, started, sent, Some(Response::new(url, status)), None);
            }
            MockOutcome::SessionChallenge => {
                let (reply, answer) = oneshot::channel();
                let challenge = challenge_for(&url);
                let _ = self.events.send(TransportEvent::SessionAuthChallenge { challenge, reply });
                let status = status_for(answer.await);
                self.complete(task, started, sent, Some(Response::new(url, status)), None);
            }
            MockOutcome::PartialFail { body, error } => {
                self.deliver(task, is_download, body).await;
                self.complete(task, started, sent, None, Some(error));
            }
            MockOutcome::Fail(error) => self.complete(task, started, sent, None, Some(error)),
            MockOutcome::NoResponse => self.complete(task, started, sent, None, None),
            MockOutcome::Pending => std::future::pending::<()>().await,
        }
    }

    /// Consume the request body and report upload progress. Returns bytes sent.
    async fn upload(&self, task: TaskId, request: TaskRequest) -> u64 {
        let sent = match request {
            TaskRequest::UploadData { payload, .. } => payload.len() as u64,
            TaskRequest::UploadFile { path, .. } => match tokio::fs::read(&path).await {
                Ok(contents) => contents.len() as u64,
                Err(_) => return 0,
            },
            TaskRequest::UploadStream(request) => {
                let body = match request.body {
                    Body::Stream(body) => Some(body),
                    _ => {
                        let (reply, answer) = oneshot::channel();
                        let _ = self.events.send(TransportEvent::NeedNewBodyStream { task, reply });
                        answer.await.ok().flatten()
                    }
                };
                let Some(mut body) = body else { return 0 };
                let mut sent = 0u64;
                while let Some(Ok(chunk)) = body.next().await {
                    sent += chunk.len() as u64;
                }
                sent
            }
            TaskRequest::Data(_) | TaskRequest::Download(_) => return 0,
        };
        let _ = self.events.send(TransportEvent::UploadProgress { task, sent, expected: Some(sent) });
        sent
    }

    async fn deliver(&self, task: TaskId, is_download: bool, body: Bytes) {
        if !is_download {
            if !body.is_empty() {
                let _ = self.events.send(TransportEvent::BodyChunk { task, chunk: body });
            }
            return;
        }
        let location = std::env::temp_dir().join(format!("skein-mock-{}-{}", std::process::id(), task.0));
        if tokio::fs::write(&location, &body).await.is_err() {
            return;
        }
        let len = body.len() as u64;
        let _ = self.events.send(TransportEvent::DownloadProgress { task, written: len, expected: Some(len) });
        let (done, finished) = oneshot::channel();
        let _ = self.events.send(TransportEvent::DownloadFinished { task, location: location.clone(), done });
        let _ = finished.await;
        let _ = tokio::fs::remove_file(&location).await;
    }
}

fn challenge_for(url: &Url) -> AuthChallenge {
    AuthChallenge {
        protection_space: ProtectionSpace {
            host: url.host_str().unwrap_or_default().to_string(),
            port: url.port_or_known_default().unwrap_or(0),
            scheme: "basic".into(),
            realm: None,
        },
        previous_failure_count: 0,
    }
}

fn status_for(answer: std::result::Result<AuthDisposition, oneshot::error::RecvError>) -> u16 {
    match answer {
        Ok(AuthDisposition::UseCredential(_)) => 200,
        _ => 401,
    }
}

impl HttpSession for MockHttpSession {
    fn start_task(&self, task: TaskId, request: TaskRequest) -> Result<()> {
        if *self.shared.closed.lock() {
            return Err(TransportError::closed("session invalidated"));
        }
        let dispatch = Dispatch { task, kind: request.kind(), url: request.request().url.clone() };
        self.shared.state.log.lock().push(dispatch.clone());
        let now = self.shared.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.state.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut tasks = self.shared.tasks.lock();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { shared.run(dispatch, request).await });
        tasks.insert(task, handle.abort_handle());
        Ok(())
    }

    fn invalidate_and_cancel(&self) {
        *self.shared.closed.lock() = true;
        self.shared.state.invalidations.lock().push(Invalidation::Cancel);
        let drained: Vec<_> = self.shared.tasks.lock().drain().collect();
        for (task, handle) in drained {
            handle.abort();
            self.shared.state.in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = self.shared.events.send(TransportEvent::Completed {
                task,
                response: None,
                error: Some(TransportError::cancelled()),
            });
        }
    }

    fn finish_tasks_and_invalidate(&self) {
        *self.shared.closed.lock() = true;
        self.shared.state.invalidations.lock().push(Invalidation::Finish);
    }
}

#[derive(Default)]
struct StreamState {
    buffer: Mutex<BytesMut>,
    writes: Mutex<Vec<Bytes>>,
    write_failure: Mutex<Option<TransportError>>,
    targets: Mutex<Vec<StreamTarget>>,
    secure: Mutex<Option<bool>>,
    close_read_calls: AtomicUsize,
    close_write_calls: AtomicUsize,
    invalidations: Mutex<Vec<Invalidation>>,
    block_empty_reads: AtomicBool,
    blocked_reads: AtomicUsize,
    incoming: Notify,
}

/// Stream transport whose connections echo every write back to the reader.
#[derive(Clone, Default)]
pub struct MockStreamTransport {
    state: Arc<StreamState>,
}

impl MockStreamTransport {
    pub fn new() -> Self { Self::default() }

    /// Make every later write fail with `error`.
    pub fn fail_writes(&self, error: TransportError) { *self.state.write_failure.lock() = Some(error); }

    pub fn writes(&self) -> Vec<Bytes> { self.state.writes.lock().clone() }

    pub fn targets(&self) -> Vec<StreamTarget> { self.state.targets.lock().clone() }

    pub fn started_secure(&self) -> Option<bool> { *self.state.secure.lock() }

    pub fn close_read_calls(&self) -> usize { self.state.close_read_calls.load(Ordering::SeqCst) }

    pub fn close_write_calls(&self) -> usize { self.state.close_write_calls.load(Ordering::SeqCst) }

    pub fn invalidations(&self) -> Vec<Invalidation> { self.state.invalidations.lock().clone() }

    /// Make reads on an empty buffer wait for [`push_incoming`](Self::push_incoming)
    /// or invalidation instead of returning no data.
    pub fn block_empty_reads(&self) { self.state.block_empty_reads.store(true, Ordering::SeqCst); }

    /// Times a read started waiting on an empty buffer.
    pub fn blocked_reads(&self) -> usize { self.state.blocked_reads.load(Ordering::SeqCst) }

    /// Bytes arriving from the peer, waking any waiting read.
    pub fn push_incoming(&self, data: &[u8]) {
        self.state.buffer.lock().extend_from_slice(data);
        self.state.incoming.notify_waiters();
    }
}

impl StreamTransport for MockStreamTransport {
    type Connection = MockStreamConnection;

    fn open(
        &self,
        _config: &ConfigurationSnapshot,
        target: StreamTarget,
        events: StreamEventSink,
    ) -> Result<MockStreamConnection> {
        self.state.targets.lock().push(target);
        Ok(MockStreamConnection {
            state: self.state.clone(),
            events,
            cancel: tokio_util::sync::CancellationToken::new(),
        })
    }
}

pub struct MockStreamConnection {
    state: Arc<StreamState>,
    events: StreamEventSink,
    cancel: tokio_util::sync::CancellationToken,
}

impl StreamConnection for MockStreamConnection {
    fn start(&self, secure: bool) { *self.state.secure.lock() = Some(secure); }

    async fn write(&self, data: Bytes, _timeout: Duration) -> Result<()> {
        if let Some(error) = self.state.write_failure.lock().clone() {
            return Err(error);
        }
        self.state.writes.lock().push(data.clone());
        self.state.buffer.lock().extend_from_slice(&data);
        Ok(())
    }

    async fn read(&self, _min: usize, max: usize, _timeout: Duration) -> Result<ReadOutcome> {
        loop {
            let incoming = self.state.incoming.notified();
            {
                let mut buffer = self.state.buffer.lock();
                if !buffer.is_empty() {
                    let take = buffer.len().min(max.max(1));
                    return Ok(ReadOutcome { data: Some(buffer.split_to(take).freeze()), eof: false });
                }
            }
            if !self.state.block_empty_reads.load(Ordering::SeqCst) {
                return Ok(ReadOutcome { data: None, eof: false });
            }
            self.state.blocked_reads.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::cancelled()),
                _ = incoming => {}
            }
        }
    }

    fn close_read(&self) {
        self.state.close_read_calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(StreamEvent::ReadClosed);
    }

    fn close_write(&self) {
        self.state.close_write_calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(StreamEvent::WriteClosed);
    }

    fn invalidate_and_cancel(&self) {
        self.cancel.cancel();
        self.state.invalidations.lock().push(Invalidation::Cancel);
        let _ = self.events.send(StreamEvent::Completed { error: Some(TransportError::cancelled()) });
    }

    fn finish_tasks_and_invalidate(&self) {
        self.cancel.cancel();
        self.state.invalidations.lock().push(Invalidation::Finish);
        let _ = self.events.send(StreamEvent::Completed { error: None });
    }
}

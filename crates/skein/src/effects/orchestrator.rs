use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use skein_config::{
    CachePolicy, ConfigurationManager, ConfigurationSnapshot, CookieAcceptPolicy, SessionClass,
};
use skein_transport::{
    AuthChallenge, AuthDisposition, BodyStream, HttpSession, HttpTransport, Request, Response,
    TaskId, TaskMetrics, TaskRequest, TransportError, TransportEvent,
};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

use crate::core::{OperationRegistry, RetryDecision, decide_retry};
use crate::data::{OperationRecord, Phase, RegistryId, RequestFactory, TaskType};
use crate::effects::token::{Cancellable, CancellationToken};
use crate::error::NetError;

/// Serial dispatch engine for queued HTTP operations.
///
/// Operations are registered first, then [`fire`](Self::fire) schedules every
/// queued record. Exactly one platform task runs at a time; the next record is
/// admitted only after the previous one reached a terminal state.
///
/// Per-record registration calls configure the most recently queued record.
/// All callbacks run on the orchestrator's dispatcher task.
///
/// `fire` must be called from within a tokio runtime.
pub struct RequestOrchestrator<T: HttpTransport> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: HttpTransport> {
    transport: T,
    registry: OperationRegistry,
    config: Mutex<ConfigurationManager>,
    session: Mutex<Option<Arc<T::Session>>>,
    /// Binary admission permit between dispatches.
    gate: Arc<Notify>,
    state: Mutex<DispatchState<T>>,
    next_task: AtomicU64,
    events: mpsc::UnboundedSender<TransportEvent>,
    queue: mpsc::UnboundedSender<RegistryId>,
    workers: Mutex<Option<Workers>>,
    shutdown: tokio_util::sync::CancellationToken,
}

struct DispatchState<T: HttpTransport> {
    cancelled: bool,
    /// A dispatch cycle owns the gate; only `finish_cycle` or a cancel releases it.
    gate_held: bool,
    current: Option<TaskId>,
    keep_alive: Option<Arc<Inner<T>>>,
}

struct Workers {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    queue: mpsc::UnboundedReceiver<RegistryId>,
}

impl<T: HttpTransport> RequestOrchestrator<T> {
    pub fn new(transport: T) -> Self { Self::with_configuration(transport, ConfigurationManager::default()) }

    pub fn with_configuration(transport: T, config: ConfigurationManager) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (queue, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                transport,
                registry: OperationRegistry::new(),
                config: Mutex::new(config),
                session: Mutex::new(None),
                gate: Arc::new(Notify::new()),
                state: Mutex::new(DispatchState {
                    cancelled: false,
                    gate_held: false,
                    current: None,
                    keep_alive: None,
                }),
                next_task: AtomicU64::new(1),
                events,
                queue,
                workers: Mutex::new(Some(Workers { events: events_rx, queue: queue_rx })),
                shutdown: tokio_util::sync::CancellationToken::new(),
            }),
        }
    }

    /// Schedule every queued record and start dispatching.
    pub fn fire(&self) -> CancellationToken {
        let inner = &self.inner;
        inner.spawn_workers();

        let ids = inner.registry.schedule_pending();
        let prime = {
            let mut state = inner.state.lock();
            state.cancelled = false;
            if !ids.is_empty() {
                state.keep_alive = Some(inner.clone());
            }
            let prime = !ids.is_empty() && !state.gate_held;
            state.gate_held |= prime;
            prime
        };
        for id in &ids {
            let _ = inner.queue.send(*id);
        }
        if prime {
            inner.gate.notify_one();
        }
        debug!(scheduled = ids.len(), primed = prime, "fired");

        let target: Arc<dyn Cancellable> = inner.clone();
        CancellationToken::new(Arc::downgrade(&target))
    }

    /// Number of records not yet removed.
    pub fn pending(&self) -> usize { self.inner.registry.len() }

    pub fn registry(&self) -> &OperationRegistry { &self.inner.registry }

    pub fn configuration_snapshot(&self) -> ConfigurationSnapshot { self.inner.config.lock().snapshot() }

    /// Queue a record built elsewhere.
    pub fn enqueue(&self, record: OperationRecord) -> &Self {
        let id = self.inner.registry.push(record);
        trace!(registry_id = %id, "queued");
        self
    }

    pub fn data(&self, f: impl Fn() -> Request + Send + Sync + 'static) -> &Self {
        self.enqueue(OperationRecord::new(RequestFactory::data(f)))
    }

    pub fn download(&self, f: impl Fn() -> Request + Send + Sync + 'static) -> &Self {
        self.enqueue(OperationRecord::new(RequestFactory::download(f)))
    }

    pub fn upload_stream(&self, f: impl Fn() -> Request + Send + Sync + 'static) -> &Self {
        self.enqueue(OperationRecord::new(RequestFactory::upload_stream(f)))
    }

    pub fn upload_data(&self, f: impl Fn() -> (Request, Bytes) + Send + Sync + 'static) -> &Self {
        self.enqueue(OperationRecord::new(RequestFactory::upload_data(f)))
    }

    pub fn upload_file(&self, f: impl Fn() -> (Request, PathBuf) + Send + Sync + 'static) -> &Self {
        self.enqueue(OperationRecord::new(RequestFactory::upload_file(f)))
    }

    fn update_trailing(&self, what: &'static str, f: impl FnOnce(&mut OperationRecord)) -> &Self {
        if !self.inner.registry.update_trailing(f) {
            warn!(what, "nothing queued to configure");
        }
        self
    }

    /// Add a consumer of (response, body). Data tasks only.
    pub fn on_data(&self, cb: impl Fn(&Response, &Bytes) + Send + Sync + 'static) -> &Self {
        self.update_trailing("data callback", |r| r.data_callbacks.push(Arc::new(cb)))
    }

    pub fn on_success(&self, cb: impl Fn(&Response) + Send + Sync + 'static) -> &Self {
        self.update_trailing("success callback", |r| r.success_callbacks.push(Arc::new(cb)))
    }

    pub fn on_failure(&self, cb: impl Fn(&NetError) + Send + Sync + 'static) -> &Self {
        self.update_trailing("failure callback", |r| r.failure = Some(Arc::new(cb)))
    }

    pub fn on_redirect(
        &self,
        handler: impl Fn(&Response, Request) -> Option<Request> + Send + Sync + 'static,
    ) -> &Self {
        self.update_trailing("redirect handler", |r| r.redirect = Some(Arc::new(handler)))
    }

    pub fn on_upload_progress(&self, cb: impl Fn(u64, Option<u64>) + Send + Sync + 'static) -> &Self {
        self.update_trailing("upload progress", |r| r.upload_progress = Some(Arc::new(cb)))
    }

    pub fn on_download_progress(&self, cb: impl Fn(u64, Option<u64>) + Send + Sync + 'static) -> &Self {
        self.update_trailing("download progress", |r| r.download_progress = Some(Arc::new(cb)))
    }

    pub fn on_download_finished(&self, handler: impl Fn(&Path) + Send + Sync + 'static) -> &Self {
        self.update_trailing("download handler", |r| r.download_finished = Some(Arc::new(handler)))
    }

    pub fn on_task_auth(
        &self,
        handler: impl Fn(&AuthChallenge) -> AuthDisposition + Send + Sync + 'static,
    ) -> &Self {
        self.update_trailing("task auth handler", |r| r.task_auth = Some(Arc::new(handler)))
    }

    pub fn stream_producer(&self, f: impl Fn() -> Option<BodyStream> + Send + Sync + 'static) -> &Self {
        self.update_trailing("stream producer", |r| r.stream_producer = Some(Arc::new(f)))
    }

    pub fn analyze_metrics(&self, f: impl Fn(&TaskMetrics) + Send + Sync + 'static) -> &Self {
        self.update_trailing("metrics analyzer", |r| r.analyzer = Some(Arc::new(f)))
    }

    pub fn retry(&self, budget: u32) -> &Self {
        self.update_trailing("retry budget", |r| r.retry_budget = Some(budget))
    }

    pub fn global_redirect(
        &self,
        handler: impl Fn(&Response, Request) -> Option<Request> + Send + Sync + 'static,
    ) -> &Self {
        self.inner.registry.set_global_redirect(Arc::new(handler));
        self
    }

    pub fn global_failure(&self, cb: impl Fn(&NetError) + Send + Sync + 'static) -> &Self {
        self.inner.registry.set_global_failure(Arc::new(cb));
        self
    }

    pub fn global_retry(&self, budget: u32) -> &Self {
        self.inner.registry.set_global_retry_budget(budget);
        self
    }

    pub fn session_auth(
        &self,
        handler: impl Fn(&AuthChallenge) -> AuthDisposition + Send + Sync + 'static,
    ) -> &Self {
        self.inner.registry.set_session_auth(Arc::new(handler));
        self
    }

    /// Edit the configuration used for the next session.
    pub fn configure(&self, f: impl FnOnce(&mut ConfigurationManager)) -> &Self {
        f(&mut self.inner.config.lock());
        self
    }

    pub fn session_class(&self, class: SessionClass) -> &Self { self.configure(|c| c.set_session_class(class)) }

    pub fn append_http_additional_headers<I, K, V>(&self, headers: I) -> &Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.configure(|c| c.append_http_additional_headers(headers))
    }

    pub fn discretionary(&self, discretionary: bool) -> &Self {
        self.configure(|c| c.set_discretionary(discretionary))
    }

    pub fn sends_launch_events(&self, sends: bool) -> &Self { self.configure(|c| c.set_sends_launch_events(sends)) }

    pub fn resource_timeout(&self, timeout: Duration) -> &Self { self.configure(|c| c.set_resource_timeout(timeout)) }

    pub fn request_timeout(&self, timeout: Duration) -> &Self { self.configure(|c| c.set_request_timeout(timeout)) }

    pub fn should_send_cookies(&self, send: bool) -> &Self { self.configure(|c| c.set_should_send_cookies(send)) }

    pub fn cookie_accept_policy(&self, policy: CookieAcceptPolicy) -> &Self {
        self.configure(|c| c.set_cookie_accept_policy(policy))
    }

    pub fn cache_policy(&self, policy: CachePolicy) -> &Self { self.configure(|c| c.set_cache_policy(policy)) }
}

impl<T: HttpTransport> Inner<T> {
    fn spawn_workers(self: &Arc<Self>) {
        let Some(Workers { events, queue }) = self.workers.lock().take() else {
            return;
        };
        tokio::spawn(run_dispatcher(Arc::downgrade(self), events, self.shutdown.clone()));
        tokio::spawn(run_admission(
            Arc::downgrade(self),
            queue,
            self.gate.clone(),
            self.shutdown.clone(),
        ));
    }

    fn session(&self) -> Result<Arc<T::Session>, TransportError> {
        let mut slot = self.session.lock();
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }
        let snapshot = self.config.lock().snapshot();
        let session = Arc::new(self.transport.open_session(&snapshot, self.events.clone())?);
        debug!(class = %snapshot.session_class(), "opened transport session");
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Admit one scheduled record.
    fn dispatch(self: &Arc<Self>, id: RegistryId) {
        if self.state.lock().cancelled {
            trace!(registry_id = %id, "cancelled, skipping");
            self.finish_cycle();
            return;
        }
        match self.registry.get_by_registry_id(id) {
            Some(record) => self.start(record),
            None => {
                trace!(registry_id = %id, "record gone before dispatch");
                self.finish_cycle();
            }
        }
    }

    /// Start a platform task for `record`. Also the in-place retry path.
    fn start(self: &Arc<Self>, mut record: OperationRecord) {
        let id = record.registry_id();
        let request = record.factory().build();
        if let TaskRequest::UploadStream(upload) = &request {
            if !upload.body.is_stream() && record.stream_producer.is_none() {
                debug!(registry_id = %id, "stream upload has no body or producer, dropping");
                self.registry.remove_by_registry_id(id);
                self.finish_cycle();
                return;
            }
        }

        let task = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
        record.platform_task_id = Some(task);
        record.phase = Phase::InFlight;
        self.registry.replace_by_registry_id(record, id);
        self.state.lock().current = Some(task);

        debug!(%task, registry_id = %id, kind = request.kind(), url = %request.request().url, "dispatching");
        let started = self.session().and_then(|session| session.start_task(task, request));
        if let Err(error) = started {
            warn!(%task, %error, "task did not start");
            let _ = self.events.send(TransportEvent::Completed { task, response: None, error: Some(error) });
        }
    }

    fn handle(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::SessionAuthChallenge { challenge, reply } => {
                let disposition = self
                    .registry
                    .session_auth()
                    .map(|handler| handler(&challenge))
                    .unwrap_or_default();
                let _ = reply.send(disposition);
            }
            TransportEvent::TaskAuthChallenge { task, challenge, reply } => {
                let disposition = self
                    .registry
                    .get_by_task_id(task)
                    .and_then(|r| r.task_auth)
                    .map(|handler| handler(&challenge))
                    .unwrap_or_default();
                let _ = reply.send(disposition);
            }
            TransportEvent::Redirect { task, response, proposed, reply } => {
                let next = self
                    .registry
                    .redirect_for(task)
                    .and_then(|handler| handler(&response, proposed));
                trace!(%task, follow = next.is_some(), "redirect");
                let _ = reply.send(next);
            }
            TransportEvent::BodyChunk { task, chunk } => {
                self.registry.append_chunk(task, &chunk);
            }
            TransportEvent::UploadProgress { task, sent, expected } => {
                if let Some(cb) = self.registry.get_by_task_id(task).and_then(|r| r.upload_progress) {
                    cb(sent, expected);
                }
            }
            TransportEvent::DownloadProgress { task, written, expected } => {
                if let Some(cb) = self.registry.get_by_task_id(task).and_then(|r| r.download_progress) {
                    cb(written, expected);
                }
            }
            TransportEvent::DownloadFinished { task, location, done } => {
                if let Some(handler) = self.registry.get_by_task_id(task).and_then(|r| r.download_finished) {
                    handler(location.as_path());
                }
                let _ = done.send(());
            }
            TransportEvent::NeedNewBodyStream { task, reply } => {
                let body = self
                    .registry
                    .get_by_task_id(task)
                    .and_then(|r| r.stream_producer)
                    .and_then(|producer| producer());
                let _ = reply.send(body);
            }
            TransportEvent::MetricsCollected { task, metrics } => {
                if let Some(analyzer) = self.registry.get_by_task_id(task).and_then(|r| r.analyzer) {
                    analyzer(&metrics);
                }
            }
            TransportEvent::Completed { task, response, error } => self.on_completed(task, response, error),
        }
    }

    fn on_completed(
        self: &Arc<Self>,
        task: TaskId,
        response: Option<Response>,
        error: Option<TransportError>,
    ) {
        if self.state.lock().current != Some(task) {
            trace!(%task, "completion of a superseded task");
            return;
        }
        let Some(record) = self.registry.get_by_task_id(task) else {
            trace!(%task, "completed task has no record");
            self.finish_cycle();
            return;
        };
        match (response, error) {
            (_, Some(error)) => self.retry_or_fail(record, error.into()),
            (None, None) => self.retry_or_fail(record, NetError::NoResponse),
            (Some(response), None) => self.succeed(record, response),
        }
    }

    fn retry_or_fail(self: &Arc<Self>, mut record: OperationRecord, error: NetError) {
        let id = record.registry_id();
        let task = record.platform_task_id().unwrap_or(TaskId(0));
        let budget = self.registry.retry_count_for(task);
        let cancelled = self.state.lock().cancelled;

        match decide_retry(budget, cancelled) {
            RetryDecision::Retry { remaining } => {
                debug!(%task, registry_id = %id, remaining, %error, "retrying");
                record.retry_budget = Some(remaining);
                if let Some(buffer) = record.response_buffer.as_mut() {
                    buffer.clear();
                }
                self.start(record);
            }
            RetryDecision::GiveUp => {
                let failure = self.registry.failure_for(task);
                let dropped = self.registry.remove_all();
                warn!(%task, registry_id = %id, dropped, %error, "giving up, registry cleared");
                if let Some(cb) = failure {
                    cb(&error);
                }
                self.finish_cycle();
            }
        }
    }

    fn succeed(self: &Arc<Self>, record: OperationRecord, response: Response) {
        if record.task_type() == TaskType::Data {
            let body = record.response_buffer.clone().map(BytesMut::freeze).unwrap_or_default();
            for cb in &record.data_callbacks {
                cb(&response, &body);
            }
        }
        for cb in &record.success_callbacks {
            cb(&response);
        }
        self.registry.remove_by_registry_id(record.registry_id());
        debug!(registry_id = %record.registry_id(), status = response.status, "completed");
        self.finish_cycle();
    }

    /// End a non-retry cycle: invalidate when drained, else admit the next record.
    fn finish_cycle(&self) {
        let mut state = self.state.lock();
        state.current = None;
        if self.registry.is_empty() {
            state.gate_held = false;
            let keep_alive = state.keep_alive.take();
            drop(state);
            if let Some(session) = self.session.lock().take() {
                debug!("registry drained, invalidating session");
                session.finish_tasks_and_invalidate();
            }
            drop(keep_alive);
        } else {
            let keep_alive = if self.registry.has_scheduled() { None } else { state.keep_alive.take() };
            drop(state);
            self.gate.notify_one();
            drop(keep_alive);
        }
    }

    fn cancel(&self, finish_current: bool) {
        let dropped = self.registry.remove_all();
        let keep_alive = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.gate_held = false;
            state.current = None;
            state.keep_alive.take()
        };
        if let Some(session) = self.session.lock().take() {
            if finish_current {
                session.finish_tasks_and_invalidate();
            } else {
                session.invalidate_and_cancel();
            }
        }
        debug!(dropped, finish_current, "orchestrator cancelled");
        drop(keep_alive);
    }
}

impl<T: HttpTransport> Cancellable for Inner<T> {
    fn cancel_now(&self) { self.cancel(false) }

    fn cancel_after_current(&self) { self.cancel(true) }
}

impl<T: HttpTransport> Drop for Inner<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(session) = self.session.get_mut().take() {
            session.invalidate_and_cancel();
        }
    }
}

/// Routes every transport event to its record.
async fn run_dispatcher<T: HttpTransport>(
    weak: Weak<Inner<T>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
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
    trace!("dispatcher stopped");
}

/// Waits on the gate before each scheduled record.
async fn run_admission<T: HttpTransport>(
    weak: Weak<Inner<T>>,
    mut queue: mpsc::UnboundedReceiver<RegistryId>,
    gate: Arc<Notify>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    loop {
        let id = tokio::select! {
            _ = shutdown.cancelled() => break,
            id = queue.recv() => match id {
                Some(id) => id,
                None => break,
            },
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = gate.notified() => {}
        }
        let Some(inner) = weak.upgrade() else { break };
        inner.dispatch(id);
    }
    trace!("admission worker stopped");
}

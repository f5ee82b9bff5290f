//! Task-based HTTP session backed by `reqwest`.
//!
//! Redirects are never followed by the client itself: each 3xx becomes a
//! [`TransportEvent::Redirect`] and the answer decides whether to go on.
//! Server-trust and other session-level challenges are handled inside the
//! TLS stack, so this backend never emits `SessionAuthChallenge`.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use parking_lot::Mutex;
use reqwest::header::{CACHE_CONTROL, HeaderMap, HeaderName, HeaderValue};
use skein_config::ConfigurationSnapshot;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Result, TransportError};
use crate::http::{EventSink, HttpSession, HttpTransport, TransportEvent};
use crate::types::{
    AuthChallenge, AuthDisposition, Body, BodyStream, Credential, Method, ProtectionSpace, Request,
    Response, TaskId, TaskMetrics, TaskRequest,
};

const MAX_REDIRECTS: u32 = 16;
const MAX_AUTH_ATTEMPTS: u32 = 8;

/// Builds one `reqwest::Client` per session from the configuration snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqwestTransport;

impl ReqwestTransport {
    pub fn new() -> Self { Self }
}

impl HttpTransport for ReqwestTransport {
    type Session = ReqwestSession;

    fn open_session(
        &self,
        config: &ConfigurationSnapshot,
        events: EventSink,
    ) -> Result<ReqwestSession> {
        let client = build_client(config)?;
        debug!(class = %config.session_class(), "built reqwest session");
        Ok(ReqwestSession {
            shared: Arc::new(Shared {
                client,
                events,
                tasks: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

fn build_client(config: &ConfigurationSnapshot) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in config.additional_headers() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::invalid_request(format!("header `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::invalid_request(format!("header `{name}`: {e}")))?;
        headers.insert(name, value);
    }
    if let Some(directive) = config.cache_policy().cache_control() {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(directive));
    }

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::none())
        .cookie_store(config.stores_cookies());
    if !config.request_timeout().is_zero() {
        builder = builder.read_timeout(config.request_timeout());
    }
    if !config.resource_timeout().is_zero() {
        builder = builder.timeout(config.resource_timeout());
    }
    Ok(builder.build()?)
}

pub struct ReqwestSession {
    shared: Arc<Shared>,
}

struct Shared {
    client: reqwest::Client,
    events: EventSink,
    tasks: Mutex<HashMap<TaskId, AbortHandle>>,
    closed: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            trace!("event receiver gone");
        }
    }

    /// Emit `Completed` unless invalidation already did.
    fn complete(&self, task: TaskId, outcome: Result<Response>) {
        if self.tasks.lock().remove(&task).is_none() {
            return;
        }
        let (response, error) = match outcome {
            Ok(response) => (Some(response), None),
            Err(error) => (None, Some(error)),
        };
        self.emit(TransportEvent::Completed { task, response, error });
    }
}

impl HttpSession for ReqwestSession {
    fn start_task(&self, task: TaskId, request: TaskRequest) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("session invalidated"));
        }
        trace!(%task, kind = request.kind(), url = %request.request().url, "starting task");

        // Held across spawn so the task cannot complete before it is tracked.
        let mut tasks = self.shared.tasks.lock();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let outcome = run_task(&shared, task, request).await;
            shared.complete(task, outcome);
        });
        tasks.insert(task, handle.abort_handle());
        Ok(())
    }

    fn invalidate_and_cancel(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.shared.tasks.lock().drain().collect();
        debug!(aborted = drained.len(), "invalidating reqwest session");
        for (task, handle) in drained {
            handle.abort();
            self.shared.emit(TransportEvent::Completed {
                task,
                response: None,
                error: Some(TransportError::cancelled()),
            });
        }
    }

    fn finish_tasks_and_invalidate(&self) {
        self.shared.closed.store(true, Ordering::Release);
        debug!(running = self.shared.tasks.lock().len(), "finishing reqwest session");
    }
}

#[derive(Default)]
struct Counters {
    redirects: u32,
    sent: Arc<AtomicU64>,
    received: u64,
    status: Option<u16>,
}

async fn run_task(shared: &Shared, task: TaskId, request: TaskRequest) -> Result<Response> {
    let fetch_start = SystemTime::now();
    let clock = Instant::now();
    let mut counters = Counters::default();

    let outcome = drive(shared, task, request, &mut counters).await;

    shared.emit(TransportEvent::MetricsCollected {
        task,
        metrics: TaskMetrics {
            fetch_start,
            duration: clock.elapsed(),
            redirect_count: counters.redirects,
            bytes_sent: counters.sent.load(Ordering::Relaxed),
            bytes_received: counters.received,
            status: counters.status,
        },
    });
    outcome
}

/// Where each attempt takes its request body from.
enum BodySource {
    Inline,
    Payload(Bytes),
    File(PathBuf),
    Stream { consumed: bool },
}

async fn drive(
    shared: &Shared,
    task: TaskId,
    request: TaskRequest,
    counters: &mut Counters,
) -> Result<Response> {
    let download = matches!(request, TaskRequest::Download(_));
    let (mut current, mut source) = match request {
        TaskRequest::Data(request) | TaskRequest::Download(request) => {
            let source =
                if request.body.is_stream() { BodySource::Stream { consumed: false } } else { BodySource::Inline };
            (request, source)
        }
        TaskRequest::UploadStream(request) => (request, BodySource::Stream { consumed: false }),
        TaskRequest::UploadData { request, payload } => (request, BodySource::Payload(payload)),
        TaskRequest::UploadFile { request, path } => (request, BodySource::File(path)),
    };
    let mut credential: Option<Credential> = None;
    let mut auth_failures = 0u32;

    loop {
        let body = next_body(shared, task, &mut source, &mut current, counters).await?;
        let mut builder = shared.client.request(to_reqwest_method(current.method), current.url.clone());
        for (name, value) in &current.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = current.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(credential) = &credential {
            builder = builder.basic_auth(&credential.user, Some(&credential.password));
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let resp = builder.send().await?;
        let response = to_response(&resp);
        counters.status = Some(response.status);

        if response.is_redirect() {
            if let Some(location) = response.header("location") {
                if counters.redirects >= MAX_REDIRECTS {
                    return Err(TransportError::protocol("too many redirects"));
                }
                let target = response
                    .url
                    .join(location)
                    .map_err(|e| TransportError::protocol(format!("bad redirect location: {e}")))?;
                let proposed = redirected_request(&current, response.status, target);
                let (reply, answer) = oneshot::channel();
                shared.emit(TransportEvent::Redirect {
                    task,
                    response: response.clone(),
                    proposed,
                    reply,
                });
                if let Ok(Some(next)) = answer.await {
                    trace!(%task, to = %next.url, "following redirect");
                    counters.redirects += 1;
                    if next.method.is_safe() {
                        source = BodySource::Inline;
                    }
                    current = next;
                    continue;
                }
            }
        }

        if response.status == 401 && auth_failures < MAX_AUTH_ATTEMPTS {
            let (reply, answer) = oneshot::channel();
            shared.emit(TransportEvent::TaskAuthChallenge {
                task,
                challenge: challenge_for(&response, auth_failures),
                reply,
            });
            match answer.await.unwrap_or_default() {
                AuthDisposition::UseCredential(next) => {
                    auth_failures += 1;
                    credential = Some(next);
                    continue;
                }
                AuthDisposition::CancelChallenge => {
                    return Err(TransportError::cancelled());
                }
                AuthDisposition::PerformDefaultHandling | AuthDisposition::RejectProtectionSpace => {}
            }
        }

        if download {
            receive_download(shared, task, resp, counters).await?;
        } else {
            let mut chunks = resp.bytes_stream();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk?;
                counters.received += chunk.len() as u64;
                shared.emit(TransportEvent::BodyChunk { task, chunk });
            }
        }
        return Ok(response);
    }
}

async fn next_body(
    shared: &Shared,
    task: TaskId,
    source: &mut BodySource,
    current: &mut Request,
    counters: &Counters,
) -> Result<Option<reqwest::Body>> {
    let body = match source {
        BodySource::Inline => match &current.body {
            Body::Empty => None,
            Body::Bytes(bytes) => Some(reqwest::Body::from(bytes.clone())),
            // a redirect or resend cannot replay an inline stream
            Body::Stream(_) => return Err(TransportError::invalid_request("inline stream body cannot be replayed")),
        },
        BodySource::Payload(payload) => {
            let expected = Some(payload.len() as u64);
            let chunks: BodyStream = Box::pin(stream::once(std::future::ready(Ok(payload.clone()))));
            Some(upload_body(shared, task, chunks, expected, counters))
        }
        BodySource::File(path) => {
            let file = tokio::fs::File::open(&*path).await?;
            let expected = file.metadata().await.ok().map(|m| m.len());
            let chunks: BodyStream = Box::pin(ReaderStream::new(file));
            Some(upload_body(shared, task, chunks, expected, counters))
        }
        BodySource::Stream { consumed } => {
            let taken = match std::mem::take(&mut current.body) {
                Body::Stream(chunks) if !*consumed => Some(chunks),
                _ => None,
            };
            *consumed = true;
            let chunks = match taken {
                Some(chunks) => chunks,
                None => request_new_body_stream(shared, task).await?,
            };
            let expected = current
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.parse().ok());
            Some(upload_body(shared, task, chunks, expected, counters))
        }
    };
    Ok(body)
}

async fn request_new_body_stream(shared: &Shared, task: TaskId) -> Result<BodyStream> {
    let (reply, answer) = oneshot::channel();
    shared.emit(TransportEvent::NeedNewBodyStream { task, reply });
    match answer.await {
        Ok(Some(chunks)) => Ok(chunks),
        _ => Err(TransportError::invalid_request("no body stream available for upload")),
    }
}

fn upload_body(
    shared: &Shared,
    task: TaskId,
    chunks: BodyStream,
    expected: Option<u64>,
    counters: &Counters,
) -> reqwest::Body {
    let events = shared.events.clone();
    let sent = counters.sent.clone();
    let mut total = 0u64;
    let counted = chunks.map(move |chunk: io::Result<Bytes>| {
        if let Ok(bytes) = &chunk {
            total += bytes.len() as u64;
            sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            let _ = events.send(TransportEvent::UploadProgress { task, sent: total, expected });
        }
        chunk
    });
    reqwest::Body::wrap_stream(counted)
}

async fn receive_download(
    shared: &Shared,
    task: TaskId,
    resp: reqwest::Response,
    counters: &mut Counters,
) -> Result<()> {
    let expected = resp.content_length();
    let (file, path) = tempfile::NamedTempFile::new()?.into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let mut chunks = resp.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        shared.emit(TransportEvent::DownloadProgress { task, written, expected });
    }
    file.flush().await?;
    drop(file);
    counters.received += written;

    let (done, finished) = oneshot::channel();
    shared.emit(TransportEvent::DownloadFinished { task, location: path.to_path_buf(), done });
    let _ = finished.await;
    // dropping the temp path removes the file
    drop(path);
    Ok(())
}

fn redirected_request(current: &Request, status: u16, url: Url) -> Request {
    let preserve = matches!(status, 307 | 308) || current.method == Method::Head;
    let method = if preserve { current.method } else { Method::Get };
    let same_origin = current.url.origin() == url.origin();
    let headers = current
        .headers
        .iter()
        .filter(|(k, _)| preserve || !k.to_ascii_lowercase().starts_with("content-"))
        .filter(|(k, _)| same_origin || !k.eq_ignore_ascii_case("authorization"))
        .cloned()
        .collect();
    let body = if preserve { current.body.try_clone().unwrap_or_default() } else { Body::Empty };
    Request { method, url, headers, body, timeout: current.timeout }
}

fn challenge_for(response: &Response, previous_failure_count: u32) -> AuthChallenge {
    let header = response.header("www-authenticate").unwrap_or("Basic");
    let scheme = header.split_whitespace().next().unwrap_or("basic").to_ascii_lowercase();
    let realm = header
        .split("realm=")
        .nth(1)
        .and_then(|rest| rest.split(',').next())
        .map(|realm| realm.trim().trim_matches('"').to_string());
    AuthChallenge {
        protection_space: ProtectionSpace {
            host: response.url.host_str().unwrap_or_default().to_string(),
            port: response.url.port_or_known_default().unwrap_or(0),
            scheme,
            realm,
        },
        previous_failure_count,
    }
}

fn to_response(resp: &reqwest::Response) -> Response {
    Response {
        url: resp.url().clone(),
        status: resp.status().as_u16(),
        headers: resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect(),
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Options => reqwest::Method::OPTIONS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url { s.parse().unwrap() }

    #[test]
    fn test_see_other_rewrites_to_get() {
        let current = Request::new(Method::Post, url("http://a.test/form"))
            .header("Content-Type", "text/plain")
            .header("X-Trace", "1")
            .body(Bytes::from_static(b"data"));

        let next = redirected_request(&current, 303, url("http://a.test/done"));
        assert_eq!(next.method, Method::Get);
        assert!(matches!(next.body, Body::Empty));
        assert_eq!(next.headers, vec![("X-Trace".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_temporary_redirect_keeps_method_and_body() {
        let current = Request::new(Method::Put, url("http://a.test/x"))
            .header("Authorization", "Basic abc")
            .body(Bytes::from_static(b"data"));

        let next = redirected_request(&current, 307, url("http://b.test/x"));
        assert_eq!(next.method, Method::Put);
        assert!(matches!(next.body, Body::Bytes(ref b) if b.as_ref() == b"data"));
        assert!(next.headers.is_empty(), "authorization dropped across origins");
    }

    #[test]
    fn test_challenge_parses_scheme_and_realm() {
        let mut response = Response::new(url("https://api.test/secret"), 401);
        response
            .headers
            .push(("WWW-Authenticate".into(), "Basic realm=\"vault\", charset=\"UTF-8\"".into()));

        let challenge = challenge_for(&response, 2);
        assert_eq!(challenge.protection_space.scheme, "basic");
        assert_eq!(challenge.protection_space.realm.as_deref(), Some("vault"));
        assert_eq!(challenge.protection_space.port, 443);
        assert_eq!(challenge.previous_failure_count, 2);
    }

    #[test]
    fn test_client_rejects_invalid_header() {
        let mut manager = skein_config::ConfigurationManager::new();
        manager.append_http_additional_headers([("bad header", "x")]);
        let err = build_client(&manager.snapshot()).unwrap_err();
        assert_eq!(err.kind, crate::TransportErrorKind::InvalidRequest);
    }
}

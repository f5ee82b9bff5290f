use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::Stream;
use url::Url;

/// A boxed, sendable stream of body chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Correlation key between a started task and every event it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "task-{}", self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }

    /// Whether a body sent with this method is dropped when a redirect rewrites it.
    pub fn is_safe(&self) -> bool { matches!(self, Method::Get | Method::Head | Method::Options) }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Request body.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    /// A one-shot stream. Replaying it requires asking the owner for a new one.
    Stream(BodyStream),
}

impl Body {
    pub fn is_stream(&self) -> bool { matches!(self, Body::Stream(_)) }

    /// Clone the body unless it is a one-shot stream.
    pub fn try_clone(&self) -> Option<Body> {
        match self {
            Body::Empty => Some(Body::Empty),
            Body::Bytes(bytes) => Some(Body::Bytes(bytes.clone())),
            Body::Stream(_) => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Empty"),
            Body::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Body::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self { Body::Bytes(bytes) }
}

impl From<BodyStream> for Body {
    fn from(stream: BodyStream) -> Self { Body::Stream(stream) }
}

/// Request descriptor handed to a transport.
///
/// # Examples
///
/// ```
/// use skein_transport::{Method, Request};
///
/// let url = "https://example.com/items".parse().unwrap();
/// let request = Request::new(Method::Post, url)
///     .header("Content-Type", "application/json")
///     .body(bytes::Bytes::from_static(b"{}"));
/// assert_eq!(request.method, Method::Post);
/// ```
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Body,
    /// Per-request timeout overriding the session request timeout.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self { method, url, headers: Vec::new(), body: Body::Empty, timeout: None }
    }

    pub fn get(url: Url) -> Self { Self::new(Method::Get, url) }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Clone the request unless its body is a one-shot stream.
    pub fn try_clone(&self) -> Option<Request> {
        Some(Request {
            method: self.method,
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
            timeout: self.timeout,
        })
    }
}

/// Response head; the body arrives separately as chunks or a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl Response {
    pub fn new(url: Url, status: u16) -> Self { Self { url, status, headers: Vec::new() } }

    /// Case-insensitive header lookup returning the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_success(&self) -> bool { (200..300).contains(&self.status) }

    pub fn is_redirect(&self) -> bool { matches!(self.status, 301 | 302 | 303 | 307 | 308) }
}

/// One task to start, tagged by the kind of platform task it becomes.
#[derive(Debug)]
pub enum TaskRequest {
    Data(Request),
    Download(Request),
    /// Upload whose body is `request.body` as a stream, or a stream obtained
    /// through a need-new-body-stream event.
    UploadStream(Request),
    UploadData { request: Request, payload: Bytes },
    UploadFile { request: Request, path: PathBuf },
}

impl TaskRequest {
    pub fn request(&self) -> &Request {
        match self {
            TaskRequest::Data(request)
            | TaskRequest::Download(request)
            | TaskRequest::UploadStream(request)
            | TaskRequest::UploadData { request, .. }
            | TaskRequest::UploadFile { request, .. } => request,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskRequest::Data(_) => "data",
            TaskRequest::Download(_) => "download",
            TaskRequest::UploadStream(_) => "upload-stream",
            TaskRequest::UploadData { .. } => "upload-data",
            TaskRequest::UploadFile { .. } => "upload-file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionSpace {
    pub host: String,
    pub port: u16,
    /// Lower-case authentication scheme, e.g. `basic`.
    pub scheme: String,
    pub realm: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub protection_space: ProtectionSpace,
    pub previous_failure_count: u32,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub password: String,
}

impl Credential {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self { user: user.into(), password: password.into() }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Answer to an authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthDisposition {
    UseCredential(Credential),
    #[default]
    PerformDefaultHandling,
    CancelChallenge,
    RejectProtectionSpace,
}

/// Timing and volume of one finished task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMetrics {
    pub fetch_start: SystemTime,
    pub duration: Duration,
    pub redirect_count: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub status: Option<u16>,
}

/// Where a duplex stream connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    Host { host: String, port: u16 },
    /// Named service, resolved by the transport.
    Service(String),
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTarget::Host { host, port } => write!(f, "{host}:{port}"),
            StreamTarget::Service(name) => write!(f, "service {name}"),
        }
    }
}

/// Largest number of bytes a single stream read may return.
pub const MAX_READ_LEN: usize = 1024 * 1024;

/// Result of one bounded stream read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    pub data: Option<Bytes>,
    pub eof: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn url(s: &str) -> Url { s.parse().unwrap() }

    #[test]
    fn test_response_header_lookup_ignores_case() {
        let mut response = Response::new(url("http://example.com/"), 200);
        response.headers.push(("Content-Length".into(), "42".into()));

        assert_eq!(response.header("content-length"), Some("42"));
        assert_eq!(response.content_length(), Some(42));
        assert!(response.is_success());
        assert!(!response.is_redirect());
    }

    #[test]
    fn test_stream_body_is_not_cloneable() {
        let chunks: BodyStream = Box::pin(stream::iter(vec![Ok(Bytes::from_static(b"a"))]));
        let request = Request::new(Method::Put, url("http://example.com/up")).body(chunks);

        assert!(request.body.is_stream());
        assert!(request.try_clone().is_none());

        let plain = Request::get(url("http://example.com/")).header("A", "1");
        let copy = plain.try_clone().unwrap();
        assert_eq!(copy.headers, vec![("A".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_task_request_kind() {
        let request = TaskRequest::UploadData {
            request: Request::new(Method::Post, url("http://example.com/")),
            payload: Bytes::from_static(b"x"),
        };
        assert_eq!(request.kind(), "upload-data");
        assert_eq!(request.request().method, Method::Post);
    }

    #[test]
    fn test_credential_debug_redacts_password() {
        let rendered = format!("{:?}", Credential::new("ann", "hunter2"));
        assert!(rendered.contains("ann"));
        assert!(!rendered.contains("hunter2"));
    }
}

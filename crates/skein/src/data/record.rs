use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use skein_transport::{
    AuthChallenge, AuthDisposition, BodyStream, Request, Response, TaskId, TaskMetrics, TaskRequest,
};

use crate::error::NetError;

pub type DataCallback = Arc<dyn Fn(&Response, &Bytes) + Send + Sync>;
pub type SuccessCallback = Arc<dyn Fn(&Response) + Send + Sync>;
pub type FailureCallback = Arc<dyn Fn(&NetError) + Send + Sync>;
/// Maps (response, proposed request) to the request to follow, or `None` to stop.
pub type RedirectHandler = Arc<dyn Fn(&Response, Request) -> Option<Request> + Send + Sync>;
/// Receives (bytes so far, expected total).
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;
/// Receives the temporary file; it is removed once the handler returns.
pub type DownloadFinishedHandler = Arc<dyn Fn(&Path) + Send + Sync>;
pub type AuthHandler = Arc<dyn Fn(&AuthChallenge) -> AuthDisposition + Send + Sync>;
pub type StreamProducer = Arc<dyn Fn() -> Option<BodyStream> + Send + Sync>;
pub type MetricsAnalyzer = Arc<dyn Fn(&TaskMetrics) + Send + Sync>;

type RequestFn = Arc<dyn Fn() -> Request + Send + Sync>;

/// Identity assigned by the registry on push. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RegistryId(pub u64);

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Data,
    Download,
    UploadStream,
    UploadData,
    UploadFile,
}

/// Produces a fresh request for every attempt of a record.
///
/// The variant is the task type, so a factory can never disagree with it.
#[derive(Clone)]
pub enum RequestFactory {
    Data(RequestFn),
    Download(RequestFn),
    UploadStream(RequestFn),
    UploadData(Arc<dyn Fn() -> (Request, Bytes) + Send + Sync>),
    UploadFile(Arc<dyn Fn() -> (Request, PathBuf) + Send + Sync>),
}

impl RequestFactory {
    pub fn data(f: impl Fn() -> Request + Send + Sync + 'static) -> Self {
        RequestFactory::Data(Arc::new(f))
    }

    pub fn download(f: impl Fn() -> Request + Send + Sync + 'static) -> Self {
        RequestFactory::Download(Arc::new(f))
    }

    pub fn upload_stream(f: impl Fn() -> Request + Send + Sync + 'static) -> Self {
        RequestFactory::UploadStream(Arc::new(f))
    }

    pub fn upload_data(f: impl Fn() -> (Request, Bytes) + Send + Sync + 'static) -> Self {
        RequestFactory::UploadData(Arc::new(f))
    }

    pub fn upload_file(f: impl Fn() -> (Request, PathBuf) + Send + Sync + 'static) -> Self {
        RequestFactory::UploadFile(Arc::new(f))
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            RequestFactory::Data(_) => TaskType::Data,
            RequestFactory::Download(_) => TaskType::Download,
            RequestFactory::UploadStream(_) => TaskType::UploadStream,
            RequestFactory::UploadData(_) => TaskType::UploadData,
            RequestFactory::UploadFile(_) => TaskType::UploadFile,
        }
    }

    pub fn build(&self) -> TaskRequest {
        match self {
            RequestFactory::Data(f) => TaskRequest::Data(f()),
            RequestFactory::Download(f) => TaskRequest::Download(f()),
            RequestFactory::UploadStream(f) => TaskRequest::UploadStream(f()),
            RequestFactory::UploadData(f) => {
                let (request, payload) = f();
                TaskRequest::UploadData { request, payload }
            }
            RequestFactory::UploadFile(f) => {
                let (request, path) = f();
                TaskRequest::UploadFile { request, path }
            }
        }
    }
}

impl fmt::Debug for RequestFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestFactory::{:?}", self.task_type())
    }
}

/// Where a record is in its dispatch life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Registered, not yet fired.
    #[default]
    Queued,
    /// Fired and waiting for the admission gate.
    Scheduled,
    /// A platform task is running for it.
    InFlight,
}

/// One queued network operation and everything registered for it.
///
/// Records are values: the registry hands out copies and takes them back
/// through its replace operations.
#[derive(Clone)]
pub struct OperationRecord {
    factory: RequestFactory,
    pub(crate) response_buffer: Option<BytesMut>,
    pub(crate) data_callbacks: Vec<DataCallback>,
    pub(crate) success_callbacks: Vec<SuccessCallback>,
    pub(crate) failure: Option<FailureCallback>,
    pub(crate) redirect: Option<RedirectHandler>,
    pub(crate) upload_progress: Option<ProgressCallback>,
    pub(crate) download_progress: Option<ProgressCallback>,
    pub(crate) download_finished: Option<DownloadFinishedHandler>,
    pub(crate) task_auth: Option<AuthHandler>,
    pub(crate) stream_producer: Option<StreamProducer>,
    pub(crate) analyzer: Option<MetricsAnalyzer>,
    pub(crate) retry_budget: Option<u32>,
    pub(crate) platform_task_id: Option<TaskId>,
    pub(crate) registry_id: RegistryId,
    pub(crate) phase: Phase,
}

impl OperationRecord {
    pub fn new(factory: RequestFactory) -> Self {
        let response_buffer = (factory.task_type() == TaskType::Data).then(BytesMut::new);
        Self {
            factory,
            response_buffer,
            data_callbacks: Vec::new(),
            success_callbacks: Vec::new(),
            failure: None,
            redirect: None,
            upload_progress: None,
            download_progress: None,
            download_finished: None,
            task_auth: None,
            stream_producer: None,
            analyzer: None,
            retry_budget: None,
            platform_task_id: None,
            registry_id: RegistryId::default(),
            phase: Phase::Queued,
        }
    }

    pub fn task_type(&self) -> TaskType { self.factory.task_type() }

    pub fn factory(&self) -> &RequestFactory { &self.factory }

    pub fn registry_id(&self) -> RegistryId { self.registry_id }

    pub fn platform_task_id(&self) -> Option<TaskId> { self.platform_task_id }

    pub fn phase(&self) -> Phase { self.phase }

    /// Own retry budget, without the registry-wide fallback.
    pub fn retry_budget(&self) -> Option<u32> { self.retry_budget }

    /// Bytes accumulated so far; `None` for anything but data tasks.
    pub fn buffered(&self) -> Option<&[u8]> { self.response_buffer.as_deref() }

    #[must_use]
    pub fn with_retry(mut self, budget: u32) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    #[must_use]
    pub fn on_success(mut self, cb: impl Fn(&Response) + Send + Sync + 'static) -> Self {
        self.success_callbacks.push(Arc::new(cb));
        self
    }

    #[must_use]
    pub fn on_failure(mut self, cb: impl Fn(&NetError) + Send + Sync + 'static) -> Self {
        self.failure = Some(Arc::new(cb));
        self
    }
}

impl fmt::Debug for OperationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRecord")
            .field("task_type", &self.task_type())
            .field("registry_id", &self.registry_id)
            .field("platform_task_id", &self.platform_task_id)
            .field("phase", &self.phase)
            .field("retry_budget", &self.retry_budget)
            .field("buffered", &self.response_buffer.as_ref().map(BytesMut::len))
            .field("data_callbacks", &self.data_callbacks.len())
            .field("success_callbacks", &self.success_callbacks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request { Request::get("http://example.com/".parse().unwrap()) }

    #[test]
    fn test_factory_fixes_task_type() {
        let upload = RequestFactory::upload_data(|| (request(), Bytes::from_static(b"x")));
        assert_eq!(upload.task_type(), TaskType::UploadData);
        assert!(matches!(upload.build(), TaskRequest::UploadData { .. }));

        let download = RequestFactory::download(request);
        assert!(matches!(download.build(), TaskRequest::Download(_)));
    }

    #[test]
    fn test_only_data_records_buffer() {
        assert_eq!(OperationRecord::new(RequestFactory::data(request)).buffered(), Some(&[][..]));
        assert_eq!(OperationRecord::new(RequestFactory::download(request)).buffered(), None);
    }

    #[test]
    fn test_clone_shares_callbacks() {
        let record = OperationRecord::new(RequestFactory::data(request)).on_success(|_| {});
        let copy = record.clone();
        assert!(Arc::ptr_eq(&record.success_callbacks[0], &copy.success_callbacks[0]));
        assert_eq!(copy.phase(), Phase::Queued);
    }
}

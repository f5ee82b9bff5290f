use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use skein_config::ConfigurationSnapshot;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::types::{
    AuthChallenge, AuthDisposition, BodyStream, Request, Response, TaskId, TaskMetrics, TaskRequest,
};

/// Channel every session pushes its delegate events into.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Everything a task-based session reports back.
///
/// Events that need an answer carry a `oneshot` sender. Dropping the sender
/// without replying is read by the transport as the default answer.
pub enum TransportEvent {
    SessionAuthChallenge {
        challenge: AuthChallenge,
        reply: oneshot::Sender<AuthDisposition>,
    },
    TaskAuthChallenge {
        task: TaskId,
        challenge: AuthChallenge,
        reply: oneshot::Sender<AuthDisposition>,
    },
    /// A 3xx was received. Replying `None` delivers the 3xx itself as the response.
    Redirect {
        task: TaskId,
        response: Response,
        proposed: Request,
        reply: oneshot::Sender<Option<Request>>,
    },
    BodyChunk { task: TaskId, chunk: Bytes },
    UploadProgress { task: TaskId, sent: u64, expected: Option<u64> },
    DownloadProgress { task: TaskId, written: u64, expected: Option<u64> },
    /// The file at `location` is removed once `done` is answered or dropped.
    DownloadFinished { task: TaskId, location: PathBuf, done: oneshot::Sender<()> },
    NeedNewBodyStream { task: TaskId, reply: oneshot::Sender<Option<BodyStream>> },
    MetricsCollected { task: TaskId, metrics: TaskMetrics },
    /// Emitted exactly once per started task.
    Completed {
        task: TaskId,
        response: Option<Response>,
        error: Option<crate::TransportError>,
    },
}

impl TransportEvent {
    pub fn task(&self) -> Option<TaskId> {
        match self {
            TransportEvent::SessionAuthChallenge { .. } => None,
            TransportEvent::TaskAuthChallenge { task, .. }
            | TransportEvent::Redirect { task, .. }
            | TransportEvent::BodyChunk { task, .. }
            | TransportEvent::UploadProgress { task, .. }
            | TransportEvent::DownloadProgress { task, .. }
            | TransportEvent::DownloadFinished { task, .. }
            | TransportEvent::NeedNewBodyStream { task, .. }
            | TransportEvent::MetricsCollected { task, .. }
            | TransportEvent::Completed { task, .. } => Some(*task),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TransportEvent::SessionAuthChallenge { .. } => "SessionAuthChallenge",
            TransportEvent::TaskAuthChallenge { .. } => "TaskAuthChallenge",
            TransportEvent::Redirect { .. } => "Redirect",
            TransportEvent::BodyChunk { .. } => "BodyChunk",
            TransportEvent::UploadProgress { .. } => "UploadProgress",
            TransportEvent::DownloadProgress { .. } => "DownloadProgress",
            TransportEvent::DownloadFinished { .. } => "DownloadFinished",
            TransportEvent::NeedNewBodyStream { .. } => "NeedNewBodyStream",
            TransportEvent::MetricsCollected { .. } => "MetricsCollected",
            TransportEvent::Completed { .. } => "Completed",
        }
    }
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.name());
        if let Some(task) = self.task() {
            s.field("task", &task);
        }
        match self {
            TransportEvent::BodyChunk { chunk, .. } => {
                s.field("len", &chunk.len());
            }
            TransportEvent::Completed { response, error, .. } => {
                s.field("status", &response.as_ref().map(|r| r.status));
                s.field("error", error);
            }
            _ => {}
        }
        s.finish()
    }
}

/// Factory for task-based sessions.
///
/// A session is built from an immutable configuration snapshot and reports
/// every delegate callback through `events`.
pub trait HttpTransport: Send + Sync + 'static {
    type Session: HttpSession;

    fn open_session(
        &self,
        config: &ConfigurationSnapshot,
        events: EventSink,
    ) -> Result<Self::Session>;
}

/// A live session that runs tasks until invalidated.
pub trait HttpSession: Send + Sync + 'static {
    /// Create and start a task. Its progress and completion arrive as events
    /// tagged with `task`.
    ///
    /// # Errors
    ///
    /// Fails without emitting any event when the session no longer accepts
    /// tasks or the request cannot be started.
    fn start_task(&self, task: TaskId, request: TaskRequest) -> Result<()>;

    /// Abort every running task and refuse new ones.
    fn invalidate_and_cancel(&self);

    /// Refuse new tasks and let running ones finish.
    fn finish_tasks_and_invalidate(&self);
}

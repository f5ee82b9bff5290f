use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use skein_config::ConfigurationSnapshot;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, TransportError};
use crate::types::{AuthChallenge, AuthDisposition, ReadOutcome, StreamTarget};

pub type StreamEventSink = mpsc::UnboundedSender<StreamEvent>;

#[derive(Debug)]
pub enum StreamEvent {
    ReadClosed,
    WriteClosed,
    /// The stream task ended. Emitted at most once per connection.
    Completed { error: Option<TransportError> },
    SessionAuthChallenge {
        challenge: AuthChallenge,
        reply: oneshot::Sender<AuthDisposition>,
    },
    TaskAuthChallenge {
        challenge: AuthChallenge,
        reply: oneshot::Sender<AuthDisposition>,
    },
}

/// Factory for duplex byte-stream connections.
pub trait StreamTransport: Send + Sync + 'static {
    type Connection: StreamConnection;

    /// Prepare a connection to `target`. No I/O happens until
    /// [`StreamConnection::start`].
    fn open(
        &self,
        config: &ConfigurationSnapshot,
        target: StreamTarget,
        events: StreamEventSink,
    ) -> Result<Self::Connection>;
}

/// A duplex stream. A zero timeout means no timeout.
pub trait StreamConnection: Send + Sync + 'static {
    /// Begin connecting, upgrading to TLS when `secure`.
    fn start(&self, secure: bool);

    fn write(&self, data: Bytes, timeout: Duration) -> impl Future<Output = Result<()>> + Send;

    /// Read at least `min` and at most `max` bytes, or fewer when the peer
    /// closes its side.
    fn read(
        &self,
        min: usize,
        max: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<ReadOutcome>> + Send;

    fn close_read(&self);

    fn close_write(&self);

    fn invalidate_and_cancel(&self);

    fn finish_tasks_and_invalidate(&self);
}

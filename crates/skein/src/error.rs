//! Error types for skein.

use skein_transport::TransportError;
use thiserror::Error;

/// Every failure a registered callback can observe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("task completed without a response")]
    NoResponse,

    /// Reserved: a data task with a response but nothing buffered.
    #[error("task completed without response data")]
    NoResponseData,

    #[error("no data read from stream")]
    NoDataFromStream,

    #[error("stream is not connected")]
    NotConnected,

    #[error("stream chain has been torn down")]
    ChainTornDown,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl NetError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NetError::Transport(e) if e.is_cancelled())
    }
}

//! Declarative orchestration of HTTP transfers and duplex stream exchanges.
//!
//! HTTP work is queued on a [`RequestOrchestrator`] and dispatched strictly one
//! task at a time once fired. Stream work is queued on a
//! [`StreamChainOrchestrator`] as a chain of write, read and close links.
//! Both return a [`CancellationToken`].
//!
//! Transports live in [`transport`]; configuration in [`config`].

mod core;
mod data;
mod effects;
mod error;

pub use crate::core::{OperationRegistry, RetryDecision, decide_retry};
pub use data::{
    AuthHandler, ChainFlow, ChainLink, DEFAULT_MAX_READ, DEFAULT_MIN_READ, DataCallback,
    DownloadFinishedHandler, FailureCallback, MAX_READ, MetricsAnalyzer, OperationRecord, Phase,
    ProgressCallback, ReadBounds, ReadChunk, ReadHandler, RedirectHandler, RegistryId,
    RequestFactory, StreamProducer, SuccessCallback, TaskType, WriteHandler,
};
pub use effects::{Cancellable, CancellationToken, RequestOrchestrator, StreamChainOrchestrator};
pub use error::NetError;
pub use skein_config as config;
pub use skein_transport as transport;

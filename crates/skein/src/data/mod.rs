//! Records, chain links and callback types.

mod chain;
mod record;

pub use chain::{
    ChainFlow, ChainLink, DEFAULT_MAX_READ, DEFAULT_MIN_READ, MAX_READ, ReadBounds, ReadChunk,
    ReadHandler, WriteHandler,
};
pub use record::{
    AuthHandler, DataCallback, DownloadFinishedHandler, FailureCallback, MetricsAnalyzer,
    OperationRecord, Phase, ProgressCallback, RedirectHandler, RegistryId, RequestFactory,
    StreamProducer, SuccessCallback, TaskType,
};

//! Orchestrators driving transports, and the token that cancels them.

mod orchestrator;
mod stream_chain;
mod token;

pub use orchestrator::RequestOrchestrator;
pub use stream_chain::StreamChainOrchestrator;
pub use token::{Cancellable, CancellationToken};

//! Pure state: the operation registry and the retry decision.

mod registry;
mod retry;

pub use registry::OperationRegistry;
pub use retry::{RetryDecision, decide_retry};

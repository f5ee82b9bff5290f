//! Transport boundary for skein orchestrators.
//!
//! # Architecture
//!
//! - [`HttpTransport`] / [`HttpSession`] - task-based sessions reporting every
//!   delegate callback as a [`TransportEvent`]
//! - [`StreamTransport`] / [`StreamConnection`] - duplex byte streams with
//!   bounded reads, timed writes and half-close
//!
//! Backends: [`ReqwestTransport`] (feature `reqwest`) and [`TcpTransport`]
//! (feature `tcp`). The `testing` feature adds scripted transports.

mod error;
mod http;
mod stream;
mod types;

#[cfg(feature = "reqwest")]
mod reqwest_impl;
#[cfg(feature = "tcp")]
mod tcp;
#[cfg(feature = "testing")]
pub mod testing;

pub use error::{Result, TransportError, TransportErrorKind};
pub use http::{EventSink, HttpSession, HttpTransport, TransportEvent};
pub use stream::{StreamConnection, StreamEvent, StreamEventSink, StreamTransport};
pub use types::{
    AuthChallenge, AuthDisposition, Body, BodyStream, Credential, MAX_READ_LEN, Method,
    ProtectionSpace, ReadOutcome, Request, Response, StreamTarget, TaskId, TaskMetrics, TaskRequest,
};

#[cfg(feature = "reqwest")]
pub use reqwest_impl::{ReqwestSession, ReqwestTransport};
#[cfg(feature = "tcp")]
pub use tcp::{TcpConnection, TcpTransport};

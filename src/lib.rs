//! Load-balanced reactive request dispatcher
//!
//! Takes requests addressed to a logical service, picks a concrete server for
//! each attempt through a pluggable [`ServerRegistry`], rewrites the target,
//! executes it through a [`Transport`], and hands the result back as a lazy,
//! cancellable stream, retrying and failing over according to a
//! [`RetryPolicy`] while notifying [`ExecutionListener`]s.

pub mod balancer;
pub mod bridge;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod transport;

pub use balancer::{CallOutcome, Server, ServerRegistry, StaticServerRegistry};
pub use command::{ExecutionAttempt, ExecutionListener, RetryPolicy};
pub use dispatcher::{DispatchStream, RequestDispatcher};
pub use error::{DispatchError, Result, TransportError};
pub use transport::{HttpRequest, HttpResponse, StreamingResponse, Transport};

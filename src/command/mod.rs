//! Command module - per-request selection, retry/failover and listener notification

pub mod listener;
pub mod load_balanced;
pub mod retry;

pub use listener::{
    AttemptOutcome, ExecutionAttempt, ExecutionListener, ListenerRegistration, ListenerRegistry,
    TracingListener,
};
pub use load_balanced::{CommandStream, DispatchCommand};
pub use retry::{Backoff, RetryPolicy, RetryStep};

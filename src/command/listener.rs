//! Execution listeners - observers of attempt lifecycle

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::any::Any;
use reqwest::Url;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::balancer::server::Server;
use crate::error::DispatchError;

/// Where an attempt stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    /// Finished normally after producing `items` values
    Succeeded { items: u64 },
    Failed,
}

/// One execution of a request against one selected server
#[derive(Debug, Clone)]
pub struct ExecutionAttempt {
    pub id: Uuid,
    /// 1-based position within its dispatch
    pub number: u32,
    pub server: Server,
    /// Target as addressed by the caller, before rewriting
    pub logical_target: Url,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    started: Instant,
}

impl ExecutionAttempt {
    pub fn new(number: u32, server: Server, logical_target: Url) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            server,
            logical_target,
            started_at: Utc::now(),
            outcome: AttemptOutcome::Pending,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Observer of attempt lifecycle events.
///
/// Callbacks run inline on the dispatch path and must not block. Errors and
/// panics are logged and dropped; they never affect the attempt's outcome.
pub trait ExecutionListener: Send + Sync {
    /// Server selected, transport call about to start
    fn on_start(&self, _attempt: &ExecutionAttempt) -> anyhow::Result<()> {
        Ok(())
    }

    /// A value produced by the attempt, before it reaches the caller.
    /// Downcast `value` to the dispatch's item type, e.g. `HttpResponse<Bytes>`.
    fn on_value(&self, _attempt: &ExecutionAttempt, _value: &dyn Any) -> anyhow::Result<()> {
        Ok(())
    }

    /// Attempt finished; `attempt.outcome` says how many values it produced.
    ///
    /// `value` is the response of a unary dispatch. Streaming dispatches succeed
    /// on completion and pass `None`; their values went through `on_value`.
    fn on_success(&self, _attempt: &ExecutionAttempt, _value: Option<&dyn Any>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Attempt failed or was cancelled
    fn on_failure(&self, _attempt: &ExecutionAttempt, _cause: &DispatchError) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Immutable, ordered set of listeners captured for one dispatch.
///
/// An empty registration holds no allocation and every notification is a
/// single branch.
#[derive(Clone, Default)]
pub struct ListenerRegistration {
    listeners: Option<Arc<[Arc<dyn ExecutionListener>]>>,
}

impl ListenerRegistration {
    pub fn new(listeners: Vec<Arc<dyn ExecutionListener>>) -> Self {
        if listeners.is_empty() {
            Self::empty()
        } else {
            Self {
                listeners: Some(listeners.into()),
            }
        }
    }

    pub fn empty() -> Self {
        Self { listeners: None }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_none()
    }

    pub fn len(&self) -> usize {
        self.listeners.as_ref().map(|l| l.len()).unwrap_or(0)
    }

    pub(crate) fn notify_start(&self, attempt: &ExecutionAttempt) {
        self.notify("start", |listener| listener.on_start(attempt));
    }

    pub(crate) fn notify_value(&self, attempt: &ExecutionAttempt, value: &dyn Any) {
        self.notify("value", |listener| listener.on_value(attempt, value));
    }

    pub(crate) fn notify_success(&self, attempt: &ExecutionAttempt, value: Option<&dyn Any>) {
        self.notify("success", |listener| listener.on_success(attempt, value));
    }

    pub(crate) fn notify_failure(&self, attempt: &ExecutionAttempt, cause: &DispatchError) {
        self.notify("failure", |listener| listener.on_failure(attempt, cause));
    }

    fn notify<F>(&self, event: &'static str, call: F)
    where
        F: Fn(&dyn ExecutionListener) -> anyhow::Result<()>,
    {
        let Some(listeners) = &self.listeners else {
            return;
        };

        for (index, listener) in listeners.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = index, event, error = %e, "Execution listener failed, ignoring");
                }
                Err(_) => {
                    warn!(listener = index, event, "Execution listener panicked, ignoring");
                }
            }
        }
    }
}

impl std::fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Mutable listener set owned by a dispatcher; each dispatch takes a snapshot
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn ExecutionListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener; it is notified after those registered before it
    pub fn register(&self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Freeze the current listeners for one dispatch
    pub fn snapshot(&self) -> ListenerRegistration {
        let listeners = self.listeners.read();
        if listeners.is_empty() {
            ListenerRegistration::empty()
        } else {
            ListenerRegistration::new(listeners.clone())
        }
    }
}

/// Logs every attempt event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl ExecutionListener for TracingListener {
    fn on_start(&self, attempt: &ExecutionAttempt) -> anyhow::Result<()> {
        debug!(
            attempt_id = %attempt.id,
            attempt = attempt.number,
            server = %attempt.server,
            target = %attempt.logical_target,
            "Attempt started"
        );
        Ok(())
    }

    fn on_success(&self, attempt: &ExecutionAttempt, _value: Option<&dyn Any>) -> anyhow::Result<()> {
        debug!(
            attempt_id = %attempt.id,
            attempt = attempt.number,
            server = %attempt.server,
            outcome = ?attempt.outcome,
            elapsed_ms = attempt.elapsed().as_millis() as u64,
            "Attempt succeeded"
        );
        Ok(())
    }

    fn on_failure(&self, attempt: &ExecutionAttempt, cause: &DispatchError) -> anyhow::Result<()> {
        warn!(
            attempt_id = %attempt.id,
            attempt = attempt.number,
            server = %attempt.server,
            error = %cause,
            elapsed_ms = attempt.elapsed().as_millis() as u64,
            "Attempt failed"
        );
        Ok(())
    }
}

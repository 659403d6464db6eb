//! Load-balanced command - selection, retry/failover and listener notification
//! around one logical request

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream};
use std::any::Any;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::balancer::registry::ServerRegistry;
use crate::balancer::server::{CallOutcome, Server};
use crate::command::listener::{AttemptOutcome, ExecutionAttempt, ListenerRegistration};
use crate::command::retry::{RetryPolicy, RetryStep};
use crate::error::{DispatchError, Result};
use crate::transport::HttpRequest;

type UnitOfWork<T> = Box<dyn Fn(Server) -> BoxStream<'static, Result<T>> + Send + Sync>;

/// How an attempt reaches its successful end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cardinality {
    /// At the first value
    Single,
    /// When the inner stream completes
    Many,
}

/// Orchestration unit for one dispatch. Built fresh per call and consumed by `submit`.
#[derive(Clone)]
pub struct DispatchCommand {
    registry: Arc<dyn ServerRegistry>,
    policy: RetryPolicy,
    listeners: ListenerRegistration,
}

impl DispatchCommand {
    pub fn new(
        registry: Arc<dyn ServerRegistry>,
        policy: RetryPolicy,
        listeners: ListenerRegistration,
    ) -> Self {
        Self {
            registry,
            policy,
            listeners,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn listeners(&self) -> &ListenerRegistration {
        &self.listeners
    }

    /// Run `work` once per selected server until one attempt's stream completes.
    ///
    /// Values are forwarded as they arrive. A failure after the current attempt
    /// has produced values is terminal, since the partial stream cannot be replayed.
    pub fn submit<T, F>(self, request: HttpRequest, work: F) -> CommandStream<T>
    where
        T: Send + 'static,
        F: Fn(Server) -> BoxStream<'static, Result<T>> + Send + Sync + 'static,
    {
        self.start(request, Box::new(work), Cardinality::Many)
    }

    /// Like [`submit`](Self::submit), but an attempt succeeds at its first value
    /// and the returned stream yields at most one value.
    pub fn submit_single<T, F>(self, request: HttpRequest, work: F) -> CommandStream<T>
    where
        T: Send + 'static,
        F: Fn(Server) -> BoxStream<'static, Result<T>> + Send + Sync + 'static,
    {
        self.start(request, Box::new(work), Cardinality::Single)
    }

    fn start<T>(self, request: HttpRequest, work: UnitOfWork<T>, cardinality: Cardinality) -> CommandStream<T> {
        let mut stream = CommandStream {
            state: State::Done,
            registry: self.registry,
            policy: self.policy,
            listeners: self.listeners,
            request: Arc::new(request),
            work,
            cardinality,
            dispatch_id: Uuid::new_v4(),
            attempts: 0,
            same_server_retries: 0,
            next_server_retries: 0,
        };
        stream.state = State::Selecting(stream.selection());
        stream
    }
}

enum State<T> {
    Selecting(BoxFuture<'static, Result<Server>>),
    Running {
        attempt: ExecutionAttempt,
        inner: BoxStream<'static, Result<T>>,
        emitted: u64,
    },
    Backoff {
        delay: Pin<Box<Sleep>>,
        step: RetryStep,
        server: Server,
    },
    Done,
}

/// Stream returned by [`DispatchCommand::submit`].
///
/// Nothing happens until it is polled. Dropping it cancels the live attempt
/// (listeners see `on_failure` with [`DispatchError::Cancelled`]) and no
/// further attempt is started.
pub struct CommandStream<T> {
    state: State<T>,
    registry: Arc<dyn ServerRegistry>,
    policy: RetryPolicy,
    listeners: ListenerRegistration,
    request: Arc<HttpRequest>,
    work: UnitOfWork<T>,
    cardinality: Cardinality,
    dispatch_id: Uuid,
    attempts: u32,
    same_server_retries: u32,
    next_server_retries: u32,
}

impl<T> CommandStream<T> {
    /// Attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn selection(&self) -> BoxFuture<'static, Result<Server>> {
        let registry = self.registry.clone();
        let request = self.request.clone();
        async move { registry.select(&request).await }.boxed()
    }

    fn start_attempt(&mut self, server: Server) {
        self.attempts += 1;
        let attempt = ExecutionAttempt::new(self.attempts, server.clone(), self.request.uri().clone());

        debug!(
            dispatch_id = %self.dispatch_id,
            attempt = attempt.number,
            server = %server,
            "Starting attempt"
        );

        self.listeners.notify_start(&attempt);
        let inner = (self.work)(server);
        self.state = State::Running {
            attempt,
            inner,
            emitted: 0,
        };
    }

    fn succeed(&mut self, mut attempt: ExecutionAttempt, items: u64, value: Option<&dyn Any>) {
        attempt.outcome = AttemptOutcome::Succeeded { items };
        self.registry.record_outcome(&attempt.server, CallOutcome::Success);
        self.listeners.notify_success(&attempt, value);
        self.state = State::Done;
    }

    /// Record a failed attempt and either schedule the next one or return the
    /// error that ends the stream.
    fn fail(&mut self, mut attempt: ExecutionAttempt, emitted: u64, err: DispatchError) -> Option<DispatchError> {
        attempt.outcome = AttemptOutcome::Failed;
        if matches!(err, DispatchError::Transport(_)) {
            self.registry.record_outcome(&attempt.server, CallOutcome::Failure);
        }
        self.listeners.notify_failure(&attempt, &err);
        self.state = State::Done;

        if emitted > 0 || !self.policy.is_retriable(self.request.method(), &err) {
            warn!(
                dispatch_id = %self.dispatch_id,
                attempt = attempt.number,
                server = %attempt.server,
                emitted,
                error = %err,
                "Attempt failed, not retrying"
            );
            return Some(err);
        }

        let Some(step) = self
            .policy
            .next_step(self.same_server_retries, self.next_server_retries)
        else {
            warn!(
                dispatch_id = %self.dispatch_id,
                attempts = self.attempts,
                error = %err,
                "Retries exhausted"
            );
            return Some(match err {
                DispatchError::Transport(last) => DispatchError::RetriesExhausted {
                    attempts: self.attempts,
                    last,
                },
                other => other,
            });
        };

        match step {
            RetryStep::SameServer => self.same_server_retries += 1,
            RetryStep::NextServer => {
                self.next_server_retries += 1;
                self.same_server_retries = 0;
            }
        }

        let delay = self.policy.backoff.delay(self.attempts);
        debug!(
            dispatch_id = %self.dispatch_id,
            attempt = attempt.number,
            server = %attempt.server,
            step = ?step,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after failed attempt"
        );

        if delay.is_zero() {
            self.retry(step, attempt.server);
        } else {
            self.state = State::Backoff {
                delay: Box::pin(tokio::time::sleep(delay)),
                step,
                server: attempt.server,
            };
        }
        None
    }

    fn retry(&mut self, step: RetryStep, server: Server) {
        match step {
            RetryStep::SameServer => self.start_attempt(server),
            RetryStep::NextServer => self.state = State::Selecting(self.selection()),
        }
    }
}

impl<T: 'static> Stream for CommandStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match mem::replace(&mut this.state, State::Done) {
                State::Selecting(mut selection) => match selection.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.state = State::Selecting(selection);
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(server)) => this.start_attempt(server),
                    Poll::Ready(Err(e)) => {
                        warn!(dispatch_id = %this.dispatch_id, error = %e, "Server selection failed");
                        return Poll::Ready(Some(Err(e)));
                    }
                },
                State::Backoff {
                    mut delay,
                    step,
                    server,
                } => match delay.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.state = State::Backoff { delay, step, server };
                        return Poll::Pending;
                    }
                    Poll::Ready(()) => this.retry(step, server),
                },
                State::Running {
                    attempt,
                    mut inner,
                    emitted,
                } => match inner.as_mut().poll_next(cx) {
                    Poll::Pending => {
                        this.state = State::Running {
                            attempt,
                            inner,
                            emitted,
                        };
                        return Poll::Pending;
                    }
                    Poll::Ready(Some(Ok(item))) => {
                        let emitted = emitted + 1;
                        this.listeners.notify_value(&attempt, &item);
                        if this.cardinality == Cardinality::Single {
                            drop(inner);
                            this.succeed(attempt, emitted, Some(&item as &dyn Any));
                        } else {
                            this.state = State::Running {
                                attempt,
                                inner,
                                emitted,
                            };
                        }
                        return Poll::Ready(Some(Ok(item)));
                    }
                    Poll::Ready(Some(Err(e))) => {
                        drop(inner);
                        if let Some(err) = this.fail(attempt, emitted, e) {
                            return Poll::Ready(Some(Err(err)));
                        }
                    }
                    Poll::Ready(None) => {
                        drop(inner);
                        this.succeed(attempt, emitted, None);
                        return Poll::Ready(None);
                    }
                },
                State::Done => return Poll::Ready(None),
            }
        }
    }
}

impl<T> Drop for CommandStream<T> {
    fn drop(&mut self) {
        if let State::Running {
            mut attempt, inner, ..
        } = mem::replace(&mut self.state, State::Done)
        {
            drop(inner);
            attempt.outcome = AttemptOutcome::Failed;
            debug!(
                dispatch_id = %self.dispatch_id,
                attempt = attempt.number,
                server = %attempt.server,
                "Dispatch cancelled during attempt"
            );
            self.listeners.notify_failure(&attempt, &DispatchError::Cancelled);
        }
    }
}

//! Push-based stream dialect used by transports

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{DispatchError, Result};

/// Slots between producer and consumer. One in flight keeps the producer
/// suspended in `emit` until the consumer has taken the previous item.
const CHANNEL_CAPACITY: usize = 1;

type Producer<T> = Box<dyn FnOnce(Emitter<T>) -> BoxFuture<'static, ()> + Send>;

/// A cold, single-subscription source of `Result<T>` items.
///
/// The producer closure runs only once [`Publisher::subscribe`] is called, on a
/// task of the current tokio runtime. It pushes items through an [`Emitter`]
/// and completes the sequence by returning.
pub struct Publisher<T> {
    producer: Mutex<Option<Producer<T>>>,
}

impl<T: Send + 'static> Publisher<T> {
    /// Create a publisher from a producer closure
    pub fn new<F, Fut>(produce: F) -> Self
    where
        F: FnOnce(Emitter<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let producer: Producer<T> =
            Box::new(move |emitter: Emitter<T>| -> BoxFuture<'static, ()> { produce(emitter).boxed() });
        Self {
            producer: Mutex::new(Some(producer)),
        }
    }

    /// Publisher emitting one value then completing
    pub fn just(item: T) -> Self {
        Self::new(move |emitter| async move {
            emitter.emit(item).await;
        })
    }

    /// Publisher failing immediately with `err`
    pub fn failed(err: DispatchError) -> Self {
        Self::new(move |emitter: Emitter<T>| async move {
            emitter.error(err).await;
        })
    }

    /// Start the producer and return the consuming end.
    ///
    /// Fails with [`DispatchError::BridgeViolation`] on a second call, or when
    /// no tokio runtime is available to drive the producer.
    pub fn subscribe(&self) -> Result<Subscription<T>> {
        let producer = self.producer.lock().take().ok_or_else(|| {
            DispatchError::BridgeViolation("publisher already subscribed".to_string())
        })?;
        let runtime = Handle::try_current().map_err(|_| {
            DispatchError::BridgeViolation("subscription requires a tokio runtime".to_string())
        })?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = runtime.spawn(producer(Emitter { tx }));

        Ok(Subscription { rx, task })
    }

    /// Whether the single subscription has been used
    pub fn is_subscribed(&self) -> bool {
        self.producer.lock().is_none()
    }
}

impl<T> std::fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("subscribed", &self.producer.lock().is_none())
            .finish()
    }
}

/// Producer side of a subscription
pub struct Emitter<T> {
    tx: mpsc::Sender<Result<T>>,
}

impl<T> Emitter<T> {
    /// Push a value; returns `false` once the subscriber has gone away
    pub async fn emit(&self, item: T) -> bool {
        self.send(Ok(item)).await
    }

    /// Push a terminal error
    pub async fn error(&self, err: DispatchError) -> bool {
        self.send(Err(err)).await
    }

    /// Push a value or an error as-is
    pub async fn send(&self, item: Result<T>) -> bool {
        self.tx.send(item).await.is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the subscriber has gone away
    pub async fn cancelled(&self) {
        self.tx.closed().await
    }
}

/// Consumer side of a publisher. Dropping it cancels the producer.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::Receiver<Result<T>>,
    task: JoinHandle<()>,
}

impl<T> Subscription<T> {
    /// Next item, or `None` once the producer has finished
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.rx.recv().await
    }

    pub fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<T>>> {
        self.rx.poll_recv(cx)
    }

    /// Stop the producer
    pub fn cancel(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

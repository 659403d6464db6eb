//! Conversions between the pull dialect (`futures::Stream`) and [`Publisher`]

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::publisher::{Publisher, Subscription};
use crate::error::Result;

enum BridgeState<T> {
    Unsubscribed(Arc<Publisher<T>>),
    Subscribed(Subscription<T>),
    Done,
}

/// A [`Publisher`] viewed as a `Stream`.
///
/// Subscribes on first poll, never before. Items and errors are passed through
/// unchanged. Dropping the stream cancels the publisher's producer.
pub struct PublisherStream<T> {
    state: BridgeState<T>,
}

/// Convert a publisher into a stream
pub fn into_stream<T>(publisher: impl Into<Arc<Publisher<T>>>) -> PublisherStream<T> {
    PublisherStream {
        state: BridgeState::Unsubscribed(publisher.into()),
    }
}

/// Convert a stream into a publisher.
///
/// The stream is polled only after subscription, one item at a time, and is
/// dropped as soon as the subscriber goes away.
pub fn into_publisher<S, T>(source: S) -> Publisher<T>
where
    S: Stream<Item = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    Publisher::new(move |emitter| async move {
        let mut source = Box::pin(source);
        while let Some(item) = source.next().await {
            if !emitter.send(item).await {
                break;
            }
        }
    })
}

impl<T: Send + 'static> Stream for PublisherStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                BridgeState::Unsubscribed(publisher) => match publisher.subscribe() {
                    Ok(subscription) => this.state = BridgeState::Subscribed(subscription),
                    Err(e) => {
                        this.state = BridgeState::Done;
                        return Poll::Ready(Some(Err(e)));
                    }
                },
                BridgeState::Subscribed(subscription) => {
                    return match subscription.poll_next(cx) {
                        Poll::Ready(None) => {
                            this.state = BridgeState::Done;
                            Poll::Ready(None)
                        }
                        other => other,
                    };
                }
                BridgeState::Done => return Poll::Ready(None),
            }
        }
    }
}

impl<T> std::fmt::Debug for PublisherStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            BridgeState::Unsubscribed(_) => "unsubscribed",
            BridgeState::Subscribed(_) => "subscribed",
            BridgeState::Done => "done",
        };
        f.debug_struct("PublisherStream").field("state", &state).finish()
    }
}

//! Switch composition over fallible streams

use futures::Stream;
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Maps each outer value to an inner stream and forwards only the latest one.
///
/// A new outer value drops the previous inner stream, cancelling whatever it was
/// driving. Outer errors are forwarded as they arrive. The stream ends once the
/// outer stream and the current inner stream have both ended.
#[pin_project]
pub struct SwitchMap<S, F, U> {
    #[pin]
    outer: S,
    outer_done: bool,
    f: F,
    inner: Option<Pin<Box<U>>>,
}

impl<S, F, U> SwitchMap<S, F, U> {
    pub fn new(outer: S, f: F) -> Self {
        Self {
            outer,
            outer_done: false,
            f,
            inner: None,
        }
    }
}

impl<S, F, U, A, B, E> Stream for SwitchMap<S, F, U>
where
    S: Stream<Item = Result<A, E>>,
    F: FnMut(A) -> U,
    U: Stream<Item = Result<B, E>>,
{
    type Item = Result<B, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if !*this.outer_done {
                match this.outer.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(value))) => {
                        *this.inner = Some(Box::pin((this.f)(value)));
                        continue;
                    }
                    Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                    Poll::Ready(None) => *this.outer_done = true,
                    Poll::Pending => {}
                }
            }

            let Some(inner) = this.inner.as_mut() else {
                return if *this.outer_done {
                    Poll::Ready(None)
                } else {
                    Poll::Pending
                };
            };

            return match inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => Poll::Ready(Some(item)),
                Poll::Ready(None) => {
                    *this.inner = None;
                    if *this.outer_done {
                        Poll::Ready(None)
                    } else {
                        Poll::Pending
                    }
                }
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

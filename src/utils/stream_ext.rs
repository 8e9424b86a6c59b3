use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Future, Stream, StreamExt as FuturesStreamExt};
use pin_project_lite::pin_project;
use tokio::time::Sleep;

pin_project! {
    /// Stream for the [`throttle_buffer`](StreamExt::throttle_buffer) method.
    ///
    /// Items arriving faster than `interval` are collected into a
    /// buffer which is emitted at most once per interval. Used to
    /// batch response chunks so Telegram message edits stay under the
    /// API rate limit.
    #[must_use = "streams do nothing unless polled"]
    pub struct ThrottleBuffer<St, B>
        where St: Stream,
    {
        #[pin]
        stream: St,
        interval: Duration,
        buffer: Option<B>,
        #[pin]
        delay: Option<Sleep>,
        done: bool,
    }
}

impl<St, B> ThrottleBuffer<St, B>
where
    St: Stream,
{
    fn new(stream: St, interval: Duration) -> Self {
        Self {
            stream,
            interval,
            buffer: None,
            delay: None,
            done: false,
        }
    }
}

impl<St, B> Stream for ThrottleBuffer<St, B>
where
    St: Stream,
    B: Default + Extend<St::Item>,
{
    type Item = B;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Drain the inner stream until pending so it stays scheduled
        // while we are blocked by the throttle delay.
        if !*this.done {
            loop {
                match this.stream.as_mut().poll_next(cx) {
                    Poll::Ready(Some(item)) => {
                        this.buffer
                            .get_or_insert_with(Default::default)
                            .extend([item]);
                    }
                    Poll::Ready(None) => {
                        *this.done = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        if this.buffer.is_none() {
            return if *this.done {
                Poll::Ready(None)
            } else {
                Poll::Pending
            };
        }

        if let Some(delay) = this.delay.as_mut().as_pin_mut() {
            futures::ready!(delay.poll(cx));
        }

        // Re-arm the delay each time a buffer is emitted.
        this.delay.set(Some(tokio::time::sleep(*this.interval)));

        Poll::Ready(Some(
            this.buffer
                .take()
                .expect("buffer should not be `None` here"),
        ))
    }
}

pub trait StreamExt: FuturesStreamExt {
    fn throttle_buffer<B>(self, interval: Duration) -> ThrottleBuffer<Self, B>
    where
        Self: Sized,
        B: Default + Extend<Self::Item>;
}

impl<S> StreamExt for S
where
    S: FuturesStreamExt,
{
    fn throttle_buffer<B>(self, interval: Duration) -> ThrottleBuffer<Self, B>
    where
        Self: Sized,
        B: Default + Extend<Self::Item>,
    {
        ThrottleBuffer::new(self, interval)
    }
}

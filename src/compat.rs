//! Bridges into the async ecosystem.
use std::{
    fmt, mem,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use pin_project_lite::pin_project;

use crate::error::StreamError;
use crate::readable::Readable;
use crate::rt::Runtime;
use crate::signal::{ListenerId, Signal};

// ===== ReadStream =====

/// [`Stream`] adapter hosting a [`Runtime`] and draining a [`Readable`].
///
/// Each poll turns the runtime until it idles, then takes whatever got
/// buffered. When nothing is available the poll parks wakers on the
/// stream's signals, so the executor is woken by the next arrival, the
/// end, or a failure. A producer failure is yielded once as an `Err` item
/// after the remaining buffered data.
pub struct ReadStream {
    rt: Runtime,
    stream: Readable,
    error_handler: ListenerId,
    wakers: Vec<ListenerId>,
    done: bool,
}

impl ReadStream {
    /// Adopt `stream`, becoming the host that runs `rt`.
    pub fn new(rt: Runtime, stream: Readable) -> Self {
        // failures come out as poll results; the standing listener keeps
        // the error signal handled in the meantime
        let error_handler = stream.on(Signal::Error, |_| {});
        Self { rt, stream, error_handler, wakers: Vec::new(), done: false }
    }

    /// Drain the whole stream into one buffer.
    pub fn collect(self) -> Collect<Self> {
        Collect::new(self)
    }

    fn clear_wakers(&mut self) {
        for id in self.wakers.drain(..) {
            self.stream.off(id);
        }
    }

    fn arm(&mut self, cx: &Context<'_>) {
        for signal in [Signal::Readable, Signal::End, Signal::Error] {
            let waker = cx.waker().clone();
            self.wakers.push(self.stream.once(signal, move |_| waker.wake_by_ref()));
        }
    }
}

impl Stream for ReadStream {
    type Item = Result<Bytes, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.clear_wakers();

        if this.done {
            return Poll::Ready(None);
        }

        loop {
            this.rt.run();

            match this.stream.read(0) {
                Ok(Some(chunk)) => return Poll::Ready(Some(Ok(chunk))),
                Ok(None) => {
                    if let Some(err) = this.stream.failure() {
                        this.done = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                    if this.stream.is_ended() {
                        this.done = true;
                        // flush the deferred end signal for any listener
                        this.rt.run();
                        return Poll::Ready(None);
                    }
                    if this.rt.is_idle() {
                        this.arm(cx);
                        return Poll::Pending;
                    }
                    // the read scheduled work, keep turning
                }
                Err(err) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
            }
        }
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.clear_wakers();
        self.stream.off(self.error_handler);
    }
}

impl fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadStream")
            .field("stream", &self.stream)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

// ===== Collect =====

pin_project! {
    /// Future draining a fallible byte stream into one buffer.
    pub struct Collect<S> {
        #[pin]
        stream: S,
        buf: BytesMut,
    }
}

impl<S> Collect<S> {
    pub fn new(stream: S) -> Self {
        Self { stream, buf: BytesMut::new() }
    }
}

impl<S> Future for Collect<S>
where
    S: Stream<Item = Result<Bytes, StreamError>>,
{
    type Output = Result<Bytes, StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buf.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                Poll::Ready(None) => return Poll::Ready(Ok(mem::take(this.buf).freeze())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> fmt::Debug for Collect<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collect")
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

//! Transforming filter stream.
use std::{fmt, rc::Rc};

use bytes::Bytes;

use crate::duplex::Duplex;
use crate::error::{Failure, StreamError};
use crate::log;
use crate::options::Options;
use crate::readable::Readable;
use crate::rt::Handle;
use crate::signal::Signal;
use crate::sink::{Ack, Sink};
use crate::writable::Writable;

// ===== Transform =====

/// Chunk transformer sitting between a filter's write and read sides.
pub trait Transform {
    /// Consume one input chunk, emitting any number of output chunks
    /// through `out`.
    fn transform(&mut self, chunk: Bytes, out: Emit);

    /// Final step after the last input chunk, for flushing held state.
    /// Defaults to closing with no output.
    fn finish(&mut self, out: Emit) {
        out.done();
    }
}

/// Create a [`Transform`] from a closure. End of input flushes nothing.
pub fn transform_fn<F: FnMut(Bytes, Emit)>(f: F) -> TransformFn<F> {
    TransformFn { f }
}

/// [`Transform`] returned by [`transform_fn`].
pub struct TransformFn<F> {
    f: F,
}

impl<F: FnMut(Bytes, Emit)> Transform for TransformFn<F> {
    fn transform(&mut self, chunk: Bytes, out: Emit) {
        (self.f)(chunk, out)
    }
}

impl<F> fmt::Debug for TransformFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformFn").finish_non_exhaustive()
    }
}

// ===== Emit =====

/// Output handle for one transform step.
///
/// [`chunk`][Emit::chunk] may run any number of times, then
/// [`done`][Emit::done] or [`fail`][Emit::fail] closes the step and
/// settles the input chunk's acknowledgement. Dropping the handle with the
/// step still open reports a failure. Effects land on later scheduler
/// turns in the order they were requested, output before acknowledgement.
pub struct Emit {
    rt: Handle,
    out: Rc<dyn Fn(Bytes)>,
    done: Option<Box<dyn FnOnce(Result<(), Failure>)>>,
}

impl Emit {
    fn new(
        rt: Handle,
        out: Rc<dyn Fn(Bytes)>,
        done: impl FnOnce(Result<(), Failure>) + 'static,
    ) -> Self {
        Self { rt, out, done: Some(Box::new(done)) }
    }

    /// Queue one output chunk.
    pub fn chunk(&self, chunk: impl Into<Bytes>) {
        let out = self.out.clone();
        let chunk = chunk.into();
        self.rt.defer(move || out(chunk));
    }

    /// Close the step, acknowledging its input chunk.
    pub fn done(mut self) {
        self.resolve(Ok(()));
    }

    /// Report a transform failure, surfaced on the filter's write side.
    pub fn fail(mut self, failure: impl Into<Failure>) {
        self.resolve(Err(failure.into()));
    }

    fn resolve(&mut self, result: Result<(), Failure>) {
        if let Some(done) = self.done.take() {
            self.rt.defer(move || done(result));
        }
    }
}

impl Drop for Emit {
    fn drop(&mut self) {
        if self.done.is_some() {
            log::warning!("transform step dropped unresolved");
            self.resolve(Err(Failure::msg("transform step dropped unresolved")));
        }
    }
}

impl fmt::Debug for Emit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emit").finish_non_exhaustive()
    }
}

// ===== Filter =====

/// Duplex whose write side feeds a [`Transform`] and whose read side
/// buffers the transform's output.
///
/// Input accounting follows the write side: volume counts until the
/// transform closes the step, so the paused indication and `drain` track
/// unprocessed input. Output accumulates on the read side like any
/// readable buffer, whatever its size relative to the input. Once the
/// write side finishes, the read side ends after its buffer drains.
#[derive(Clone, Debug)]
pub struct Filter {
    duplex: Duplex,
}

struct Driver<T> {
    transform: T,
    output: Readable,
    rt: Handle,
}

impl<T: Transform> Sink for Driver<T> {
    fn accept(&mut self, chunk: Bytes, ack: Ack) {
        let out = feeding_emit(&self.rt, &self.output, ack);
        self.transform.transform(chunk, out);
    }

    fn end(&mut self, ack: Ack) {
        let out = feeding_emit(&self.rt, &self.output, ack);
        self.transform.finish(out);
    }
}

fn feeding_emit(rt: &Handle, output: &Readable, ack: Ack) -> Emit {
    let target = output.clone();
    Emit::new(
        rt.clone(),
        Rc::new(move |chunk| target.feed(chunk)),
        move |result| match result {
            Ok(()) => ack.ok(),
            Err(failure) => ack.fail(failure),
        },
    )
}

impl Filter {
    /// Both sides use `opts` for their water marks; the metric applies to
    /// the write side.
    pub fn new(rt: Handle, opts: Options, transform: impl Transform + 'static) -> Self {
        let output = Readable::new_fed(rt.clone(), opts);
        let driver = Driver { transform, output: output.clone(), rt: rt.clone() };
        let input = Writable::new(rt, opts, driver);

        let fed = output.clone();
        input.once(Signal::Finish, move |_| fed.feed_end());

        Self { duplex: Duplex::from_halves(output, input) }
    }

    /// Transformed output side.
    pub fn readable(&self) -> &Readable {
        self.duplex.readable()
    }

    /// Input side.
    pub fn writable(&self) -> &Writable {
        self.duplex.writable()
    }

    /// Take transformed output, as [`Readable::read`].
    pub fn read(&self, n: usize) -> Result<Option<Bytes>, StreamError> {
        self.duplex.readable().read(n)
    }

    /// Queue input, as [`Writable::write`].
    pub fn write(&self, chunk: impl Into<Bytes>) -> Result<bool, StreamError> {
        self.duplex.writable().write(chunk)
    }

    /// Queue input with a completion callback, as [`Writable::write_with`].
    pub fn write_with(
        &self,
        chunk: impl Into<Bytes>,
        cb: impl FnOnce(Result<(), StreamError>) + 'static,
    ) -> Result<bool, StreamError> {
        self.duplex.writable().write_with(chunk, cb)
    }

    /// Refuse further input and flush the transform, as [`Writable::end`].
    pub fn end(&self) -> Result<(), StreamError> {
        self.duplex.writable().end()
    }

    /// End after one final input chunk.
    pub fn end_with(&self, chunk: impl Into<Bytes>) -> Result<(), StreamError> {
        self.duplex.writable().end_with(chunk)
    }

    /// Release both sides.
    pub fn destroy(&self) {
        self.duplex.destroy();
    }
}

//! Accept capability and stock consumers.
use std::{cell::RefCell, fmt, rc::Rc};

use bytes::{Bytes, BytesMut};

use crate::error::Failure;
use crate::log;
use crate::rt::Handle;

// ===== Sink =====

/// Consumer capability.
///
/// A writable stream holding a sink hands chunks over with
/// [`accept`][Sink::accept], one at a time. The next chunk goes out only
/// after the previous [`Ack`] resolves. Once every write is acknowledged
/// after an end request, [`end`][Sink::end] runs so the sink can flush held
/// output before the stream finishes.
pub trait Sink {
    /// Consume one chunk, acknowledging through `ack` when done.
    fn accept(&mut self, chunk: Bytes, ack: Ack);

    /// Flush before the stream finishes. Defaults to acknowledging
    /// immediately.
    fn end(&mut self, ack: Ack) {
        ack.ok();
    }
}

pub(crate) enum AckOutcome {
    Ok,
    Failed(Failure),
}

// ===== Ack =====

/// Single use handle acknowledging one dispatched chunk or the final flush.
///
/// [`ok`][Ack::ok] or [`fail`][Ack::fail] consumes the handle. Dropping it
/// unresolved reports a failure instead of stalling the stream. Delivery
/// happens on a later scheduler turn, never inside the resolving call.
pub struct Ack {
    rt: Handle,
    complete: Option<Box<dyn FnOnce(AckOutcome)>>,
}

impl Ack {
    pub(crate) fn new(rt: Handle, complete: impl FnOnce(AckOutcome) + 'static) -> Self {
        Self { rt, complete: Some(Box::new(complete)) }
    }

    /// Acknowledge, releasing the write's share of the buffered volume.
    pub fn ok(mut self) {
        self.resolve(AckOutcome::Ok);
    }

    /// Report a consumer failure.
    pub fn fail(mut self, failure: impl Into<Failure>) {
        self.resolve(AckOutcome::Failed(failure.into()));
    }

    fn resolve(&mut self, outcome: AckOutcome) {
        if let Some(complete) = self.complete.take() {
            self.rt.defer(move || complete(outcome));
        }
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if self.complete.is_some() {
            log::warning!("write dropped unacknowledged");
            self.resolve(AckOutcome::Failed(Failure::msg("write dropped unacknowledged")));
        }
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack").finish_non_exhaustive()
    }
}

// ===== SinkFn =====

/// Create a [`Sink`] from a closure receiving each chunk and its
/// acknowledge handle.
pub fn sink_fn<F: FnMut(Bytes, Ack)>(f: F) -> SinkFn<F> {
    SinkFn { f }
}

/// [`Sink`] returned by [`sink_fn`].
pub struct SinkFn<F> {
    f: F,
}

impl<F: FnMut(Bytes, Ack)> Sink for SinkFn<F> {
    fn accept(&mut self, chunk: Bytes, ack: Ack) {
        (self.f)(chunk, ack)
    }
}

impl<F> fmt::Debug for SinkFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkFn").finish_non_exhaustive()
    }
}

// ===== MemorySink =====

/// Sink collecting chunks in memory, acknowledging immediately.
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Rc<RefCell<Vec<Bytes>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view over the collected chunks. Stays valid after the sink
    /// itself moves into a stream.
    pub fn data(&self) -> MemoryData {
        MemoryData { chunks: self.data.clone() }
    }
}

impl Sink for MemorySink {
    fn accept(&mut self, chunk: Bytes, ack: Ack) {
        self.data.borrow_mut().push(chunk);
        ack.ok();
    }
}

/// View over the chunks a [`MemorySink`] collected.
#[derive(Debug, Clone)]
pub struct MemoryData {
    chunks: Rc<RefCell<Vec<Bytes>>>,
}

impl MemoryData {
    /// All collected bytes as one buffer.
    pub fn concat(&self) -> Bytes {
        let chunks = self.chunks.borrow();
        let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks.iter() {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }

    pub fn chunks(&self) -> Vec<Bytes> {
        self.chunks.borrow().clone()
    }

    pub fn count(&self) -> usize {
        self.chunks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.borrow().is_empty()
    }
}

// ===== NullSink =====

/// Sink discarding everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl NullSink {
    pub fn new() -> Self {
        Self
    }
}

impl Sink for NullSink {
    fn accept(&mut self, _chunk: Bytes, ack: Ack) {
        ack.ok();
    }
}

#[cfg(test)]
mod test {
    use crate::rt::Runtime;

    use super::*;

    fn ack_into(rt: &Runtime, out: &Rc<RefCell<Vec<String>>>) -> Ack {
        let out = out.clone();
        Ack::new(rt.handle(), move |outcome| {
            let entry = match outcome {
                AckOutcome::Ok => "ok".into(),
                AckOutcome::Failed(failure) => format!("failed {failure}"),
            };
            out.borrow_mut().push(entry);
        })
    }

    #[test]
    fn resolves_on_a_later_turn() {
        let rt = Runtime::new();
        let out = Rc::new(RefCell::new(Vec::new()));

        ack_into(&rt, &out).ok();
        assert!(out.borrow().is_empty());

        rt.run();
        assert_eq!(*out.borrow(), ["ok"]);
    }

    #[test]
    fn dropped_unacknowledged_reports_failure() {
        let rt = Runtime::new();
        let out = Rc::new(RefCell::new(Vec::new()));

        drop(ack_into(&rt, &out));
        rt.run();
        assert_eq!(*out.borrow(), ["failed write dropped unacknowledged"]);
    }

    #[test]
    fn memory_sink_collects() {
        let rt = Runtime::new();
        let out = Rc::new(RefCell::new(Vec::new()));
        let mut sink = MemorySink::new();
        let data = sink.data();

        sink.accept(Bytes::from("abc"), ack_into(&rt, &out));
        sink.accept(Bytes::from("def"), ack_into(&rt, &out));
        rt.run();

        assert_eq!(*out.borrow(), ["ok", "ok"]);
        assert_eq!(data.count(), 2);
        assert_eq!(data.concat(), Bytes::from("abcdef"));
    }

    #[test]
    fn default_end_acknowledges() {
        let rt = Runtime::new();
        let out = Rc::new(RefCell::new(Vec::new()));
        let mut sink = NullSink::new();

        sink.accept(Bytes::from("x"), ack_into(&rt, &out));
        sink.end(ack_into(&rt, &out));
        rt.run();
        assert_eq!(*out.borrow(), ["ok", "ok"]);
    }
}

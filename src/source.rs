//! Pull capability and stock producers.
use std::fmt;

use bytes::Bytes;

use crate::error::Failure;
use crate::log;
use crate::rt::Handle;

// ===== Source =====

/// Producer capability.
///
/// A readable stream holding a source asks for data with
/// [`pull`][Source::pull] and keeps at most one request outstanding. The
/// request resolves through the given [`Pull`] handle, which delivers on a
/// later scheduler turn.
pub trait Source {
    /// Produce data for one request.
    fn pull(&mut self, pull: Pull);
}

pub(crate) enum PullOutcome {
    Chunk(Bytes),
    End,
    Failed(Failure),
}

// ===== Pull =====

/// Single use handle resolving one pull request.
///
/// Exactly one of [`chunk`][Pull::chunk], [`end`][Pull::end] or
/// [`fail`][Pull::fail] consumes the handle. Dropping it unresolved reports
/// a failure instead of stalling the stream. Delivery happens on a later
/// scheduler turn, never inside the resolving call.
pub struct Pull {
    size: usize,
    rt: Handle,
    complete: Option<Box<dyn FnOnce(PullOutcome)>>,
}

impl Pull {
    pub(crate) fn new(
        size: usize,
        rt: Handle,
        complete: impl FnOnce(PullOutcome) + 'static,
    ) -> Self {
        Self { size, rt, complete: Some(Box::new(complete)) }
    }

    /// Requested amount in the owning stream's metric. Advisory, the source
    /// may produce more or less.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Resolve with a chunk of data.
    pub fn chunk(mut self, chunk: impl Into<Bytes>) {
        self.resolve(PullOutcome::Chunk(chunk.into()));
    }

    /// Resolve reporting that the data is exhausted.
    pub fn end(mut self) {
        self.resolve(PullOutcome::End);
    }

    /// Resolve reporting a producer failure.
    pub fn fail(mut self, failure: impl Into<Failure>) {
        self.resolve(PullOutcome::Failed(failure.into()));
    }

    fn resolve(&mut self, outcome: PullOutcome) {
        if let Some(complete) = self.complete.take() {
            self.rt.defer(move || complete(outcome));
        }
    }
}

impl Drop for Pull {
    fn drop(&mut self) {
        if self.complete.is_some() {
            log::warning!("pull request dropped unresolved");
            self.resolve(PullOutcome::Failed(Failure::msg("pull request dropped unresolved")));
        }
    }
}

impl fmt::Debug for Pull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pull").field("size", &self.size).finish_non_exhaustive()
    }
}

// ===== SourceFn =====

/// Create a [`Source`] from a closure.
pub fn source_fn<F: FnMut(Pull)>(f: F) -> SourceFn<F> {
    SourceFn { f }
}

/// [`Source`] returned by [`source_fn`].
pub struct SourceFn<F> {
    f: F,
}

impl<F: FnMut(Pull)> Source for SourceFn<F> {
    fn pull(&mut self, pull: Pull) {
        (self.f)(pull)
    }
}

impl<F> fmt::Debug for SourceFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFn").finish_non_exhaustive()
    }
}

// ===== MemorySource =====

/// Source yielding slices of a fixed buffer, then the end of data.
#[derive(Debug)]
pub struct MemorySource {
    data: Bytes,
    chunk: Option<usize>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), chunk: None }
    }

    /// Cap each produced chunk at `size`, regardless of the requested
    /// amount.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk = Some(size.max(1));
        self
    }
}

impl Source for MemorySource {
    fn pull(&mut self, pull: Pull) {
        if self.data.is_empty() {
            return pull.end();
        }
        let mut take = pull.size().max(1);
        if let Some(cap) = self.chunk {
            take = take.min(cap);
        }
        pull.chunk(self.data.split_to(take.min(self.data.len())));
    }
}

// ===== IterSource =====

/// Source draining an iterator, one item per pull.
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I>
where
    I: Iterator,
    I::Item: Into<Bytes>,
{
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self { iter: iter.into_iter() }
    }
}

impl<I> Source for IterSource<I>
where
    I: Iterator,
    I::Item: Into<Bytes>,
{
    fn pull(&mut self, pull: Pull) {
        match self.iter.next() {
            Some(chunk) => pull.chunk(chunk),
            None => pull.end(),
        }
    }
}

impl<I> fmt::Debug for IterSource<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterSource").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, rc::Rc};

    use crate::rt::Runtime;

    use super::*;

    fn pull_into(rt: &Runtime, size: usize, out: &Rc<RefCell<Vec<String>>>) -> Pull {
        let out = out.clone();
        Pull::new(size, rt.handle(), move |outcome| {
            let entry = match outcome {
                PullOutcome::Chunk(chunk) => format!("chunk {}", String::from_utf8_lossy(&chunk)),
                PullOutcome::End => "end".into(),
                PullOutcome::Failed(failure) => format!("failed {failure}"),
            };
            out.borrow_mut().push(entry);
        })
    }

    #[test]
    fn resolves_on_a_later_turn() {
        let rt = Runtime::new();
        let out = Rc::new(RefCell::new(Vec::new()));

        pull_into(&rt, 4, &out).chunk("data");
        assert!(out.borrow().is_empty());

        rt.run();
        assert_eq!(*out.borrow(), ["chunk data"]);
    }

    #[test]
    fn dropped_unresolved_reports_failure() {
        let rt = Runtime::new();
        let out = Rc::new(RefCell::new(Vec::new()));

        drop(pull_into(&rt, 4, &out));
        rt.run();
        assert_eq!(*out.borrow(), ["failed pull request dropped unresolved"]);
    }

    #[test]
    fn memory_source_honors_request_size() {
        let rt = Runtime::new();
        let out = Rc::new(RefCell::new(Vec::new()));
        let mut source = MemorySource::new("abcdef");

        source.pull(pull_into(&rt, 4, &out));
        source.pull(pull_into(&rt, 4, &out));
        source.pull(pull_into(&rt, 4, &out));
        rt.run();
        assert_eq!(*out.borrow(), ["chunk abcd", "chunk ef", "end"]);
    }

    #[test]
    fn memory_source_chunk_cap() {
        let rt = Runtime::new();
        let out = Rc::new(RefCell::new(Vec::new()));
        let mut source = MemorySource::new("abcdef").chunk_size(2);

        source.pull(pull_into(&rt, 100, &out));
        rt.run();
        assert_eq!(*out.borrow(), ["chunk ab"]);
    }

    #[test]
    fn iter_source_drains_then_ends() {
        let rt = Runtime::new();
        let out = Rc::new(RefCell::new(Vec::new()));
        let mut source = IterSource::new(["one", "two"]);

        source.pull(pull_into(&rt, 1, &out));
        source.pull(pull_into(&rt, 1, &out));
        source.pull(pull_into(&rt, 1, &out));
        rt.run();
        assert_eq!(*out.borrow(), ["chunk one", "chunk two", "end"]);
    }
}

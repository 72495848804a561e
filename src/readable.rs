//! Pull mode readable stream.
use std::{cell::RefCell, fmt, rc::Rc};

use bytes::Bytes;

use crate::error::{Misuse, StreamError};
use crate::log;
use crate::options::Options;
use crate::pipe::PipeState;
use crate::queue::BufferQueue;
use crate::rt::Handle;
use crate::signal::{Event, ListenerId, Signal, Signals};
use crate::source::{Pull, PullOutcome, Source};

// ===== Readable =====

/// Buffering stream fed by a [`Source`].
///
/// Consumers take data with [`read`][Readable::read]. When the buffer runs
/// low the stream asks its source for more and announces the arrival
/// through the `readable` signal, so a consumer that saw `None` knows when
/// to come back. At most one pull request is outstanding at any time.
///
/// Handles are cheap clones sharing one stream.
#[derive(Clone)]
pub struct Readable {
    inner: Rc<RefCell<Inner>>,
    signals: Signals,
    rt: Handle,
    pipes: Rc<RefCell<PipeState>>,
}

struct Inner {
    queue: BufferQueue,
    opts: Options,
    source: Option<Box<dyn Source>>,
    reading: bool,
    ended: bool,
    end_emitted: bool,
    failed: Option<StreamError>,
    closed: bool,
    teardown: Option<Box<dyn FnOnce()>>,
}

impl Readable {
    pub fn new(rt: Handle, opts: Options, source: impl Source + 'static) -> Self {
        Self::build(rt, opts, Some(Box::new(source)))
    }

    /// Stream fed by its owner instead of a pull capability. Filters use
    /// this for their output side.
    pub(crate) fn new_fed(rt: Handle, opts: Options) -> Self {
        Self::build(rt, opts, None)
    }

    fn build(rt: Handle, opts: Options, source: Option<Box<dyn Source>>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                queue: BufferQueue::new(),
                opts,
                source,
                reading: false,
                ended: false,
                end_emitted: false,
                failed: None,
                closed: false,
                teardown: None,
            })),
            signals: Signals::new(),
            rt,
            pipes: Rc::new(RefCell::new(PipeState::default())),
        }
    }

    /// Take up to `n` buffered bytes, `0` meaning everything buffered.
    ///
    /// `Ok(None)` means nothing is available right now. If the source is
    /// exhausted and the buffer drained, the `end` signal is arranged on a
    /// later turn. Otherwise a refill request goes out when the buffer sits
    /// below the low water mark, and `readable` announces the next arrival.
    pub fn read(&self, n: usize) -> Result<Option<Bytes>, StreamError> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(Misuse::Closed.into());
        }

        if inner.queue.is_empty() && inner.ended && !inner.end_emitted {
            inner.end_emitted = true;
            drop(inner);
            let signals = self.signals.clone();
            self.rt.defer(move || signals.emit(&Event::End));
            return Ok(None);
        }

        let chunk = inner.queue.extract(n);

        if inner.wants_refill() {
            inner.reading = true;
            drop(inner);
            self.issue_pull();
        }

        Ok(chunk)
    }

    fn issue_pull(&self) {
        let (size, mut source) = {
            let mut inner = self.inner.borrow_mut();
            match inner.source.take() {
                Some(source) => (inner.opts.high_water.max(1), source),
                None => {
                    inner.reading = false;
                    return;
                }
            }
        };

        let this = self.clone();
        source.pull(Pull::new(size, self.rt.clone(), move |outcome| {
            this.on_pull(outcome);
        }));

        let mut inner = self.inner.borrow_mut();
        if !inner.closed {
            inner.source = Some(source);
        }
    }

    /// Runs on a scheduler turn after the source resolved a pull.
    fn on_pull(&self, outcome: PullOutcome) {
        match outcome {
            PullOutcome::Chunk(chunk) => {
                let repull = {
                    let mut inner = self.inner.borrow_mut();
                    inner.reading = false;
                    if inner.closed || chunk.is_empty() {
                        return;
                    }
                    inner.queue.push(chunk);
                    inner.wants_refill()
                };
                if repull {
                    self.inner.borrow_mut().reading = true;
                    self.issue_pull();
                }
                self.signals.emit(&Event::Readable);
            }
            PullOutcome::End => {
                let emit_end = {
                    let mut inner = self.inner.borrow_mut();
                    inner.reading = false;
                    if inner.closed {
                        return;
                    }
                    inner.ended = true;
                    inner.source = None;
                    inner.queue.is_empty() && !inner.end_emitted
                };
                if emit_end {
                    self.inner.borrow_mut().end_emitted = true;
                    self.signals.emit(&Event::End);
                }
            }
            PullOutcome::Failed(failure) => {
                let err = {
                    let mut inner = self.inner.borrow_mut();
                    inner.reading = false;
                    if inner.closed {
                        return;
                    }
                    inner.source = None;
                    let err = StreamError::Producer(failure);
                    inner.failed = Some(err.clone());
                    err
                };
                log::error!("readable: {err}");
                self.signals.emit(&Event::Error(err));
            }
        }
    }

    /// Push a chunk in from the owning filter. Empty chunks are dropped.
    pub(crate) fn feed(&self, chunk: Bytes) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed || inner.ended || chunk.is_empty() {
                return;
            }
            inner.queue.push(chunk);
        }
        self.signals.emit(&Event::Readable);
    }

    /// Mark the fed stream ended.
    pub(crate) fn feed_end(&self) {
        let emit_end = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed || inner.ended {
                return;
            }
            inner.ended = true;
            inner.queue.is_empty() && !inner.end_emitted
        };
        if emit_end {
            self.inner.borrow_mut().end_emitted = true;
            self.signals.emit(&Event::End);
        }
    }

    /// Release the stream immediately.
    ///
    /// Buffered data is discarded, the source is dropped and `close` is
    /// announced on a later turn. Repeated calls do nothing.
    pub fn destroy(&self) {
        let teardown = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.source = None;
            inner.queue.clear();
            inner.teardown.take()
        };
        log::debug!("readable: destroyed");
        if let Some(teardown) = teardown {
            teardown();
        }
        let signals = self.signals.clone();
        self.rt.defer(move || signals.emit(&Event::Close));
    }

    /// Attach `f` to every future emission of `signal`.
    pub fn on(&self, signal: Signal, f: impl FnMut(&Event) + 'static) -> ListenerId {
        self.signals.on(signal, f)
    }

    /// Attach `f` to only the next emission of `signal`.
    pub fn once(&self, signal: Signal, f: impl FnMut(&Event) + 'static) -> ListenerId {
        self.signals.once(signal, f)
    }

    /// Detach a listener. Returns whether it was still attached.
    pub fn off(&self, id: ListenerId) -> bool {
        self.signals.off(id)
    }

    pub fn listener_count(&self, signal: Signal) -> usize {
        self.signals.count(signal)
    }

    /// Bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Whether the source reported the end of its data.
    pub fn is_ended(&self) -> bool {
        self.inner.borrow().ended
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    pub(crate) fn end_done(&self) -> bool {
        self.inner.borrow().end_emitted
    }

    pub(crate) fn failure(&self) -> Option<StreamError> {
        self.inner.borrow().failed.clone()
    }

    pub(crate) fn signals(&self) -> &Signals {
        &self.signals
    }

    pub(crate) fn rt(&self) -> &Handle {
        &self.rt
    }

    pub(crate) fn pipe_state(&self) -> &Rc<RefCell<PipeState>> {
        &self.pipes
    }

    /// Hook run once on destroy, before `close` is scheduled.
    pub(crate) fn set_teardown(&self, f: impl FnOnce() + 'static) {
        self.inner.borrow_mut().teardown = Some(Box::new(f));
    }
}

impl Inner {
    fn wants_refill(&self) -> bool {
        !self.ended
            && !self.reading
            && self.failed.is_none()
            && self.source.is_some()
            // an empty buffer always refills, whatever the mark
            && self.queue.len() < self.opts.low_water.max(1)
    }
}

impl fmt::Debug for Readable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Readable")
            .field("buffered", &inner.queue.len())
            .field("ended", &inner.ended)
            .field("closed", &inner.closed)
            .finish_non_exhaustive()
    }
}

// ===== Flow =====

/// Continuous emission adapter over a [`Readable`].
///
/// While attached and not paused, buffered chunks drain through the `data`
/// signal as they arrive. Dropping the adapter detaches it and the stream
/// is back in pull mode.
pub struct Flow {
    stream: Readable,
    state: Rc<RefCell<FlowState>>,
    listener: ListenerId,
}

#[derive(Default)]
struct FlowState {
    paused: bool,
    detached: bool,
}

impl Readable {
    /// Switch to continuous emission through the `data` signal.
    pub fn flow(&self) -> Flow {
        let state = Rc::new(RefCell::new(FlowState::default()));

        let drive_stream = self.clone();
        let drive_state = state.clone();
        let listener = self.signals.on(Signal::Readable, move |_| {
            let stream = drive_stream.clone();
            let state = drive_state.clone();
            drive_stream.rt.defer(move || drive(&stream, &state));
        });

        let kick_stream = self.clone();
        let kick_state = state.clone();
        self.rt.defer(move || drive(&kick_stream, &kick_state));

        Flow { stream: self.clone(), state, listener }
    }
}

fn drive(stream: &Readable, state: &Rc<RefCell<FlowState>>) {
    loop {
        {
            let state = state.borrow();
            if state.paused || state.detached {
                return;
            }
        }
        match stream.read(0) {
            Ok(Some(chunk)) => stream.signals.emit(&Event::Data(chunk)),
            Ok(None) | Err(_) => return,
        }
    }
}

impl Flow {
    /// Hold emission until [`resume`][Flow::resume].
    pub fn pause(&self) {
        self.state.borrow_mut().paused = true;
    }

    /// Resume emission, draining anything buffered on a later turn.
    pub fn resume(&self) {
        {
            let mut state = self.state.borrow_mut();
            if !state.paused {
                return;
            }
            state.paused = false;
        }
        let stream = self.stream.clone();
        let state = self.state.clone();
        self.stream.rt.defer(move || drive(&stream, &state));
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        self.state.borrow_mut().detached = true;
        self.stream.signals.off(self.listener);
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("paused", &self.state.borrow().paused)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use crate::rt::Runtime;
    use crate::source::{source_fn, IterSource, MemorySource};

    use super::*;

    fn collect_signal(stream: &Readable, signal: Signal) -> Rc<RefCell<usize>> {
        let hits = Rc::new(RefCell::new(0));
        let h = hits.clone();
        stream.on(signal, move |_| *h.borrow_mut() += 1);
        hits
    }

    #[test]
    fn empty_read_requests_a_refill() {
        let rt = Runtime::new();
        let stream = Readable::new(rt.handle(), Options::default(), MemorySource::new("hello"));
        let readable = collect_signal(&stream, Signal::Readable);

        assert_eq!(stream.read(0).unwrap(), None);
        rt.run();

        assert_eq!(*readable.borrow(), 1);
        assert_eq!(stream.read(0).unwrap(), Some(Bytes::from("hello")));
    }

    #[test]
    fn overlapping_reads_share_one_pull() {
        let rt = Runtime::new();
        let pulls = Rc::new(RefCell::new(Vec::new()));
        let parked = pulls.clone();
        let stream = Readable::new(
            rt.handle(),
            Options::default(),
            source_fn(move |pull| parked.borrow_mut().push(pull)),
        );

        // both reads find the buffer empty, only the first may ask for more
        assert_eq!(stream.read(0).unwrap(), None);
        assert_eq!(stream.read(0).unwrap(), None);
        assert_eq!(pulls.borrow().len(), 1);

        pulls.borrow_mut().remove(0).chunk("late");
        rt.run();
        assert_eq!(stream.read(0).unwrap(), Some(Bytes::from("late")));
    }

    #[test]
    fn refill_loops_until_low_water() {
        let rt = Runtime::new();
        let stream = Readable::new(
            rt.handle(),
            Options::default().high_water(8).low_water(4),
            MemorySource::new("abcdefghij").chunk_size(3),
        );

        assert_eq!(stream.read(0).unwrap(), None);
        rt.run();

        // 3 then 3 buffers six bytes, at the mark, so the loop stops
        assert_eq!(stream.buffered_len(), 6);
        assert_eq!(stream.read(0).unwrap(), Some(Bytes::from("abcdef")));
    }

    #[test]
    fn default_marks_prime_in_one_pull() {
        let rt = Runtime::new();
        let stream = Readable::new(
            rt.handle(),
            Options::default(),
            MemorySource::new("fifteen bytes!!"),
        );
        let readable = collect_signal(&stream, Signal::Readable);
        let ended = collect_signal(&stream, Signal::End);

        assert_eq!(stream.read(7).unwrap(), None);
        rt.run();
        assert_eq!(*readable.borrow(), 1);
        assert_eq!(stream.buffered_len(), 15);

        assert_eq!(stream.read(7).unwrap(), Some(Bytes::from("fifteen")));
        assert_eq!(stream.read(8).unwrap(), Some(Bytes::from(" bytes!!")));

        assert_eq!(stream.read(1).unwrap(), None);
        rt.run();
        assert_eq!(*ended.borrow(), 1);
    }

    #[test]
    fn end_announced_after_the_drained_read() {
        let rt = Runtime::new();
        let stream = Readable::new(rt.handle(), Options::default(), IterSource::new(["ab", "cd"]));
        let ended = collect_signal(&stream, Signal::End);

        assert_eq!(stream.read(0).unwrap(), None);
        rt.run();

        assert_eq!(stream.read(0).unwrap(), Some(Bytes::from("abcd")));
        assert!(stream.is_ended());
        assert_eq!(*ended.borrow(), 0);

        assert_eq!(stream.read(0).unwrap(), None);
        rt.run();
        assert_eq!(*ended.borrow(), 1);

        // settled, later reads stay quiet
        assert_eq!(stream.read(0).unwrap(), None);
        rt.run();
        assert_eq!(*ended.borrow(), 1);
    }

    #[test]
    fn end_on_empty_buffer_is_announced_directly() {
        let rt = Runtime::new();
        let stream = Readable::new(rt.handle(), Options::default(), MemorySource::new(""));
        let ended = collect_signal(&stream, Signal::End);

        assert_eq!(stream.read(0).unwrap(), None);
        rt.run();
        assert_eq!(*ended.borrow(), 1);
    }

    #[test]
    fn sized_reads_slice_the_buffer() {
        let rt = Runtime::new();
        let stream = Readable::new(
            rt.handle(),
            Options::default(),
            IterSource::new(["aaaaa", "bbbbb", "ccccc"]),
        );

        assert_eq!(stream.read(7).unwrap(), None);
        rt.run();

        assert_eq!(stream.read(7).unwrap(), Some(Bytes::from("aaaaabb")));
        assert_eq!(stream.read(8).unwrap(), Some(Bytes::from("bbbccccc")));
        assert_eq!(stream.read(1).unwrap(), None);
    }

    #[test]
    fn producer_failure_keeps_buffered_data() {
        let rt = Runtime::new();
        let mut turn = 0;
        let stream = Readable::new(
            rt.handle(),
            Options::default(),
            source_fn(move |pull| {
                turn += 1;
                match turn {
                    1 => pull.chunk("early"),
                    _ => pull.fail("device gone"),
                }
            }),
        );
        let errors = collect_signal(&stream, Signal::Error);
        let ended = collect_signal(&stream, Signal::End);

        assert_eq!(stream.read(0).unwrap(), None);
        rt.run();
        assert_eq!(*errors.borrow(), 1);

        assert_eq!(stream.read(0).unwrap(), Some(Bytes::from("early")));
        assert_eq!(stream.read(0).unwrap(), None);
        rt.run();
        assert_eq!(*ended.borrow(), 0);
    }

    #[test]
    fn destroy_discards_and_closes_once() {
        let rt = Runtime::new();
        let stream = Readable::new(rt.handle(), Options::default(), MemorySource::new("data"));
        let closed = collect_signal(&stream, Signal::Close);

        assert_eq!(stream.read(0).unwrap(), None);
        rt.run();
        assert_eq!(stream.buffered_len(), 4);

        stream.destroy();
        stream.destroy();
        assert_eq!(stream.buffered_len(), 0);
        assert!(stream.read(0).unwrap_err().is_misuse());

        rt.run();
        assert_eq!(*closed.borrow(), 1);
    }

    #[test]
    fn flow_emits_data_until_paused() {
        let rt = Runtime::new();
        let stream = Readable::new(
            rt.handle(),
            Options::default(),
            IterSource::new(["one", "two", "three"]),
        );

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        stream.on(Signal::Data, move |event| {
            if let Event::Data(chunk) = event {
                s.borrow_mut().extend_from_slice(chunk);
            }
        });
        let ended = collect_signal(&stream, Signal::End);

        let flow = stream.flow();
        rt.run();
        assert_eq!(*seen.borrow(), b"onetwothree");
        assert_eq!(*ended.borrow(), 1);

        drop(flow);
        assert_eq!(stream.listener_count(Signal::Readable), 0);
    }

    #[test]
    fn flow_pause_holds_resume_drains() {
        let rt = Runtime::new();
        let stream = Readable::new(
            rt.handle(),
            Options::default(),
            IterSource::new(["one", "two", "three"]),
        );

        let flow = stream.flow();
        flow.pause();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        stream.on(Signal::Data, move |event| {
            if let Event::Data(chunk) = event {
                s.borrow_mut().extend_from_slice(chunk);
            }
        });

        rt.run();
        assert!(seen.borrow().is_empty());
        assert!(flow.is_paused());

        flow.resume();
        rt.run();
        assert_eq!(*seen.borrow(), b"onetwothree");
    }
}

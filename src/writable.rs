//! Buffering writable stream.
use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

use bytes::Bytes;

use crate::error::{Failure, Misuse, StreamError};
use crate::log;
use crate::options::Options;
use crate::rt::Handle;
use crate::signal::{Event, ListenerId, Signal, Signals};
use crate::sink::{Ack, AckOutcome, Sink};

type WriteCb = Box<dyn FnOnce(Result<(), StreamError>)>;

// ===== Writable =====

/// Buffering stream draining into a [`Sink`].
///
/// Writes are handed to the sink one at a time, the next going out when
/// the previous acknowledgement arrives. Volume queued beyond the high
/// water mark turns writes into a paused indication; once the sink works
/// the buffer back below the low water mark, one `drain` signal says to
/// resume.
///
/// Handles are cheap clones sharing one stream.
#[derive(Clone)]
pub struct Writable {
    inner: Rc<RefCell<Inner>>,
    signals: Signals,
    rt: Handle,
}

struct Inner {
    opts: Options,
    sink: Option<Box<dyn Sink>>,
    queue: VecDeque<Pending>,
    length: usize,
    writing: bool,
    inflight: Option<Inflight>,
    need_drain: bool,
    ending: bool,
    end_sent: bool,
    finished: bool,
    failed: Option<StreamError>,
    closed: bool,
    teardown: Option<Box<dyn FnOnce()>>,
}

struct Pending {
    chunk: Bytes,
    len: usize,
    cb: Option<WriteCb>,
}

struct Inflight {
    len: usize,
    cb: Option<WriteCb>,
}

enum Step {
    Next(Bytes),
    End,
    Idle,
}

impl Writable {
    pub fn new(rt: Handle, opts: Options, sink: impl Sink + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                opts,
                sink: Some(Box::new(sink)),
                queue: VecDeque::new(),
                length: 0,
                writing: false,
                inflight: None,
                need_drain: false,
                ending: false,
                end_sent: false,
                finished: false,
                failed: None,
                closed: false,
                teardown: None,
            })),
            signals: Signals::new(),
            rt,
        }
    }

    /// Queue `chunk` for the sink.
    ///
    /// `Ok(true)` means the buffer can take more. `Ok(false)` is the
    /// paused indication: buffered volume reached the high water mark,
    /// hold further writes until the `drain` signal. The chunk is kept
    /// either way.
    pub fn write(&self, chunk: impl Into<Bytes>) -> Result<bool, StreamError> {
        self.write_inner(chunk.into(), None)
    }

    /// Like [`write`][Writable::write], additionally calling `cb` once the
    /// sink acknowledged the chunk, or with the failure that dropped it.
    ///
    /// `cb` runs on a later scheduler turn even when the sink acknowledges
    /// from inside its accept call.
    pub fn write_with(
        &self,
        chunk: impl Into<Bytes>,
        cb: impl FnOnce(Result<(), StreamError>) + 'static,
    ) -> Result<bool, StreamError> {
        self.write_inner(chunk.into(), Some(Box::new(cb)))
    }

    fn write_inner(&self, chunk: Bytes, cb: Option<WriteCb>) -> Result<bool, StreamError> {
        let (accepting, dispatch) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(Misuse::Closed.into());
            }
            if let Some(err) = &inner.failed {
                return Err(err.clone());
            }
            if inner.ending || inner.finished {
                return Err(Misuse::WriteAfterEnd.into());
            }

            let len = inner.opts.metric.measure(&chunk);
            inner.length += len;
            let accepting = inner.length <= inner.opts.high_water;
            if !accepting {
                inner.need_drain = true;
            }

            let dispatch = if inner.writing {
                inner.queue.push_back(Pending { chunk, len, cb });
                None
            } else {
                inner.writing = true;
                inner.inflight = Some(Inflight { len, cb });
                Some(chunk)
            };
            (accepting, dispatch)
        };

        if let Some(chunk) = dispatch {
            self.dispatch(chunk);
        }
        Ok(accepting)
    }

    fn dispatch(&self, chunk: Bytes) {
        let mut sink = {
            let mut inner = self.inner.borrow_mut();
            match inner.sink.take() {
                Some(sink) => sink,
                None => {
                    inner.writing = false;
                    inner.inflight = None;
                    return;
                }
            }
        };

        let this = self.clone();
        sink.accept(chunk, Ack::new(self.rt.clone(), move |outcome| this.on_ack(outcome)));

        let mut inner = self.inner.borrow_mut();
        if !inner.closed {
            inner.sink = Some(sink);
        }
    }

    fn on_ack(&self, outcome: AckOutcome) {
        match outcome {
            AckOutcome::Ok => self.on_write_done(),
            AckOutcome::Failed(failure) => self.fail(failure),
        }
    }

    /// Runs on a scheduler turn after the sink acknowledged one chunk.
    fn on_write_done(&self) {
        let (cb, step, drain) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }

            let mut cb = None;
            if let Some(inflight) = inner.inflight.take() {
                inner.length -= inflight.len;
                cb = inflight.cb;
            }

            let step = match inner.queue.pop_front() {
                Some(Pending { chunk, len, cb }) => {
                    inner.inflight = Some(Inflight { len, cb });
                    Step::Next(chunk)
                }
                None => {
                    inner.writing = false;
                    if inner.ending && inner.length == 0 && !inner.end_sent {
                        inner.end_sent = true;
                        Step::End
                    } else {
                        Step::Idle
                    }
                }
            };

            // the finish path supersedes drain
            let drain = inner.need_drain
                && !matches!(step, Step::End)
                && inner.length < inner.opts.low_water.max(1);
            (cb, step, drain)
        };

        if let Some(cb) = cb {
            cb(Ok(()));
        }
        if drain {
            self.schedule_drain();
        }
        match step {
            Step::Next(chunk) => self.dispatch(chunk),
            Step::End => self.dispatch_end(),
            Step::Idle => {}
        }
    }

    /// Defer the `drain` emission, re-checking the level on delivery so a
    /// write landing in between cancels it.
    fn schedule_drain(&self) {
        let this = self.clone();
        self.rt.defer(move || {
            let emit = {
                let mut inner = this.inner.borrow_mut();
                let emit = !inner.closed
                    && inner.need_drain
                    && inner.length < inner.opts.low_water.max(1);
                if emit {
                    inner.need_drain = false;
                }
                emit
            };
            if emit {
                this.signals.emit(&Event::Drain);
            }
        });
    }

    /// Refuse further writes and finish once the buffer fully drains.
    ///
    /// The `finish` signal fires after the sink acknowledged every accepted
    /// chunk and its final flush, always on a later scheduler turn.
    pub fn end(&self) -> Result<(), StreamError> {
        self.end_inner(None)
    }

    /// End after one final write.
    pub fn end_with(&self, chunk: impl Into<Bytes>) -> Result<(), StreamError> {
        self.end_inner(Some(chunk.into()))
    }

    fn end_inner(&self, chunk: Option<Bytes>) -> Result<(), StreamError> {
        {
            let inner = self.inner.borrow();
            if inner.closed {
                return Err(Misuse::Closed.into());
            }
            if let Some(err) = &inner.failed {
                return Err(err.clone());
            }
            if inner.ending || inner.finished {
                return Err(Misuse::DoubleEnd.into());
            }
        }

        if let Some(chunk) = chunk {
            self.write_inner(chunk, None)?;
        }

        let send_end = {
            let mut inner = self.inner.borrow_mut();
            inner.ending = true;
            let send = !inner.writing && inner.length == 0 && !inner.end_sent;
            if send {
                inner.end_sent = true;
            }
            send
        };
        if send_end {
            self.dispatch_end();
        }
        Ok(())
    }

    fn dispatch_end(&self) {
        let sink = self.inner.borrow_mut().sink.take();

        let Some(mut sink) = sink else {
            let this = self.clone();
            self.rt.defer(move || this.finish_now());
            return;
        };

        let this = self.clone();
        sink.end(Ack::new(self.rt.clone(), move |outcome| this.on_end_ack(outcome)));

        let mut inner = self.inner.borrow_mut();
        if !inner.closed {
            inner.sink = Some(sink);
        }
    }

    fn on_end_ack(&self, outcome: AckOutcome) {
        match outcome {
            AckOutcome::Ok => self.finish_now(),
            AckOutcome::Failed(failure) => self.fail(failure),
        }
    }

    fn finish_now(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed || inner.finished {
                return;
            }
            inner.finished = true;
            inner.sink = None;
        }
        log::debug!("writable: finished");
        self.signals.emit(&Event::Finish);
    }

    /// Consumer failure: drop buffered data, fail every pending write
    /// callback, reject everything after.
    fn fail(&self, failure: Failure) {
        let (cbs, err) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed || inner.failed.is_some() {
                return;
            }
            let err = StreamError::Consumer(failure);
            inner.failed = Some(err.clone());
            inner.sink = None;
            inner.writing = false;
            inner.need_drain = false;
            inner.length = 0;

            let mut cbs = Vec::new();
            if let Some(cb) = inner.inflight.take().and_then(|i| i.cb) {
                cbs.push(cb);
            }
            while let Some(pending) = inner.queue.pop_front() {
                if let Some(cb) = pending.cb {
                    cbs.push(cb);
                }
            }
            (cbs, err)
        };

        log::error!("writable: {err}");
        for cb in cbs {
            cb(Err(err.clone()));
        }
        self.signals.emit(&Event::Error(err));
    }

    /// Release the stream immediately.
    ///
    /// Pending write callbacks fire with [`Misuse::Closed`], the sink is
    /// dropped without its final flush and `close` is announced on a later
    /// turn. Repeated calls do nothing.
    pub fn destroy(&self) {
        let (cbs, teardown) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.sink = None;
            inner.writing = false;
            inner.length = 0;

            let mut cbs = Vec::new();
            if let Some(cb) = inner.inflight.take().and_then(|i| i.cb) {
                cbs.push(cb);
            }
            while let Some(pending) = inner.queue.pop_front() {
                if let Some(cb) = pending.cb {
                    cbs.push(cb);
                }
            }
            (cbs, inner.teardown.take())
        };

        log::debug!("writable: destroyed");
        for cb in cbs {
            cb(Err(Misuse::Closed.into()));
        }
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

    /// Whether a write would currently be accepted.
    pub fn is_writable(&self) -> bool {
        let inner = self.inner.borrow();
        !inner.closed && !inner.ending && !inner.finished && inner.failed.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.borrow().finished
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Buffered volume in the stream's metric.
    pub fn buffered_len(&self) -> usize {
        self.inner.borrow().length
    }

    pub(crate) fn signals(&self) -> &Signals {
        &self.signals
    }

    pub(crate) fn ptr_eq(&self, other: &Writable) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Hook run once on destroy, before `close` is scheduled.
    pub(crate) fn set_teardown(&self, f: impl FnOnce() + 'static) {
        self.inner.borrow_mut().teardown = Some(Box::new(f));
    }
}

impl fmt::Debug for Writable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Writable")
            .field("buffered", &inner.length)
            .field("ending", &inner.ending)
            .field("finished", &inner.finished)
            .field("closed", &inner.closed)
            .finish_non_exhaustive()
    }
}

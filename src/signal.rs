//! Signal dispatch.
//!
//! Every stream embeds a [`Signals`] core: a closed set of signal kinds,
//! each with an ordered listener list. No string keys, no inheritance.
use std::{cell::RefCell, fmt, rc::Rc};

use bytes::Bytes;

use crate::error::StreamError;

// ===== Signal =====

/// Lifecycle signal kinds a stream can emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Data arrived in the internal buffer.
    Readable,
    /// A chunk was handed out in continuous-emission mode.
    Data,
    /// No more data will ever be produced.
    End,
    /// A previously saturated write buffer emptied below the low water mark.
    Drain,
    /// Every accepted chunk has been handed to the consumer capability.
    Finish,
    /// A capability reported a failure.
    Error,
    /// The stream was destroyed.
    Close,
    /// A destination was attached.
    Pipe,
    /// A destination was detached.
    Unpipe,
}

impl Signal {
    pub(crate) const COUNT: usize = 9;

    const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Signal::Readable => "readable",
            Signal::Data => "data",
            Signal::End => "end",
            Signal::Drain => "drain",
            Signal::Finish => "finish",
            Signal::Error => "error",
            Signal::Close => "close",
            Signal::Pipe => "pipe",
            Signal::Unpipe => "unpipe",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ===== Event =====

/// A dispatched signal with its payload.
#[derive(Clone, Debug)]
pub enum Event {
    Readable,
    Data(Bytes),
    End,
    Drain,
    Finish,
    Error(StreamError),
    Close,
    Pipe,
    Unpipe,
}

impl Event {
    pub const fn signal(&self) -> Signal {
        match self {
            Event::Readable => Signal::Readable,
            Event::Data(_) => Signal::Data,
            Event::End => Signal::End,
            Event::Drain => Signal::Drain,
            Event::Finish => Signal::Finish,
            Event::Error(_) => Signal::Error,
            Event::Close => Signal::Close,
            Event::Pipe => Signal::Pipe,
            Event::Unpipe => Signal::Unpipe,
        }
    }
}

// ===== Listeners =====

/// Handle of a registered listener, for [`off`].
///
/// [`off`]: Signals::off
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId {
    signal: Signal,
    seq: u64,
}

impl ListenerId {
    pub const fn signal(&self) -> Signal {
        self.signal
    }
}

type ListenerFn = Rc<RefCell<dyn FnMut(&Event)>>;

struct Entry {
    seq: u64,
    once: bool,
    f: ListenerFn,
}

#[derive(Default)]
struct State {
    seq: u64,
    slots: [Vec<Entry>; Signal::COUNT],
}

/// Signal dispatch core shared by a stream and its handles.
#[derive(Clone, Default)]
pub(crate) struct Signals {
    state: Rc<RefCell<State>>,
}

impl Signals {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(&self, signal: Signal, f: impl FnMut(&Event) + 'static) -> ListenerId {
        self.register(signal, false, f)
    }

    /// Register a listener removed right before its first delivery.
    pub(crate) fn once(&self, signal: Signal, f: impl FnMut(&Event) + 'static) -> ListenerId {
        self.register(signal, true, f)
    }

    fn register(&self, signal: Signal, once: bool, f: impl FnMut(&Event) + 'static) -> ListenerId {
        let mut state = self.state.borrow_mut();
        state.seq += 1;
        let seq = state.seq;
        state.slots[signal.index()].push(Entry {
            seq,
            once,
            f: Rc::new(RefCell::new(f)),
        });
        ListenerId { signal, seq }
    }

    /// Remove a listener. Returns whether it was still registered.
    pub(crate) fn off(&self, id: ListenerId) -> bool {
        let mut state = self.state.borrow_mut();
        let slot = &mut state.slots[id.signal.index()];
        match slot.iter().position(|e| e.seq == id.seq) {
            Some(i) => {
                slot.remove(i);
                true
            }
            None => false,
        }
    }

    pub(crate) fn count(&self, signal: Signal) -> usize {
        self.state.borrow().slots[signal.index()].len()
    }

    /// Deliver `event` to every listener registered at the time of the call.
    ///
    /// Listeners added during delivery do not observe this event; listeners
    /// removed during delivery are skipped. Listeners may re-enter the
    /// stream that emitted.
    ///
    /// # Panics
    ///
    /// An `error` event with no registered listener is fatal.
    pub(crate) fn emit(&self, event: &Event) {
        let idx = event.signal().index();

        let snapshot: Vec<(u64, bool, ListenerFn)> = self.state.borrow().slots[idx]
            .iter()
            .map(|e| (e.seq, e.once, e.f.clone()))
            .collect();

        if snapshot.is_empty() {
            if let Event::Error(err) = event {
                panic!("unhandled stream error: {err}");
            }
            return;
        }

        for (seq, once, f) in snapshot {
            let live = {
                let mut state = self.state.borrow_mut();
                let slot = &mut state.slots[idx];
                match slot.iter().position(|e| e.seq == seq) {
                    Some(i) => {
                        if once {
                            slot.remove(i);
                        }
                        true
                    }
                    None => false,
                }
            };
            if live {
                (f.borrow_mut())(event);
            }
        }
    }
}

impl fmt::Debug for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        let registered: usize = state.slots.iter().map(Vec::len).sum();
        f.debug_struct("Signals").field("registered", &registered).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Misuse;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn dispatch_order() {
        let signals = Signals::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            signals.on(Signal::Readable, move |_| order.borrow_mut().push(i));
        }

        signals.emit(&Event::Readable);
        assert_eq!(*order.borrow(), [0, 1, 2]);
    }

    #[test]
    fn once_fires_once() {
        let signals = Signals::new();
        let hits = Rc::new(RefCell::new(0));

        let h = hits.clone();
        signals.once(Signal::Drain, move |_| *h.borrow_mut() += 1);

        assert_eq!(signals.count(Signal::Drain), 1);
        signals.emit(&Event::Drain);
        signals.emit(&Event::Drain);
        assert_eq!(*hits.borrow(), 1);
        assert_eq!(signals.count(Signal::Drain), 0);
    }

    #[test]
    fn once_removed_before_delivery() {
        // counting from within the listener must not see itself
        let signals = Signals::new();
        let seen = Rc::new(RefCell::new(usize::MAX));

        let s = seen.clone();
        let probe = signals.clone();
        signals.once(Signal::Error, move |_| {
            *s.borrow_mut() = probe.count(Signal::Error);
        });

        signals.emit(&Event::Error(Misuse::Closed.into()));
        assert_eq!(*seen.borrow(), 0);
    }

    #[test]
    fn off_during_dispatch_skips() {
        let signals = Signals::new();
        let hits = Rc::new(RefCell::new(0));

        let second = Rc::new(RefCell::new(None));

        let remover = signals.clone();
        let slot = second.clone();
        signals.on(Signal::End, move |_| {
            if let Some(id) = slot.borrow_mut().take() {
                assert!(remover.off(id));
            }
        });

        let h = hits.clone();
        let id = signals.on(Signal::End, move |_| *h.borrow_mut() += 1);
        *second.borrow_mut() = Some(id);

        signals.emit(&Event::End);
        assert_eq!(*hits.borrow(), 0);

        signals.emit(&Event::End);
        assert_eq!(*hits.borrow(), 0);
    }

    #[test]
    fn added_during_dispatch_waits() {
        let signals = Signals::new();
        let hits = Rc::new(RefCell::new(0));

        let registrar = signals.clone();
        let h = hits.clone();
        signals.once(Signal::Finish, move |_| {
            let h = h.clone();
            registrar.on(Signal::Finish, move |_| *h.borrow_mut() += 1);
        });

        signals.emit(&Event::Finish);
        assert_eq!(*hits.borrow(), 0);

        signals.emit(&Event::Finish);
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    #[should_panic(expected = "unhandled stream error")]
    fn unhandled_error_is_fatal() {
        let signals = Signals::new();
        signals.emit(&Event::Error(StreamError::Unroutable));
    }

    #[test]
    fn handled_error_is_delivered() {
        let signals = Signals::new();
        let seen = Rc::new(RefCell::new(false));

        let s = seen.clone();
        signals.on(Signal::Error, move |event| {
            assert!(matches!(event, Event::Error(StreamError::Unroutable)));
            *s.borrow_mut() = true;
        });

        signals.emit(&Event::Error(StreamError::Unroutable));
        assert!(*seen.borrow());
    }
}

//! Paired readable and writable halves.
use crate::options::Options;
use crate::readable::Readable;
use crate::rt::Handle;
use crate::sink::Sink;
use crate::source::Source;
use crate::writable::Writable;

/// Independent readable and writable halves sharing one lifecycle.
///
/// The halves buffer separately and signal separately; the only coupling
/// is teardown. Destroying either half, or the pair, releases both.
#[derive(Clone, Debug)]
pub struct Duplex {
    readable: Readable,
    writable: Writable,
}

impl Duplex {
    pub fn new(
        rt: Handle,
        read_opts: Options,
        source: impl Source + 'static,
        write_opts: Options,
        sink: impl Sink + 'static,
    ) -> Self {
        let readable = Readable::new(rt.clone(), read_opts, source);
        let writable = Writable::new(rt, write_opts, sink);
        Self::from_halves(readable, writable)
    }

    /// Tie two existing halves' lifecycles together.
    pub(crate) fn from_halves(readable: Readable, writable: Writable) -> Self {
        let partner = writable.clone();
        readable.set_teardown(move || partner.destroy());
        let partner = readable.clone();
        writable.set_teardown(move || partner.destroy());
        Self { readable, writable }
    }

    pub fn readable(&self) -> &Readable {
        &self.readable
    }

    pub fn writable(&self) -> &Writable {
        &self.writable
    }

    /// Release both halves.
    pub fn destroy(&self) {
        self.readable.destroy();
        self.writable.destroy();
    }
}

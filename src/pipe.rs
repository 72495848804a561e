//! Pipe coordination between a readable source and writable destinations.
use std::mem;

use crate::error::{Misuse, StreamError};
use crate::log;
use crate::readable::Readable;
use crate::signal::{Event, ListenerId, Signal, Signals};
use crate::writable::Writable;

// ===== PipeOpts =====

/// Per destination pipe behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeOpts {
    /// End the destination when the source ends. On by default.
    pub end: bool,
}

impl Default for PipeOpts {
    fn default() -> Self {
        Self { end: true }
    }
}

// ===== PipeState =====

/// Attached destinations of one readable, hung off the stream itself.
#[derive(Default)]
pub(crate) struct PipeState {
    links: Vec<Link>,
    src_listeners: Vec<ListenerId>,
    pending_drains: usize,
    did_end: bool,
}

struct Link {
    dest: Writable,
    opts: PipeOpts,
    listeners: Vec<ListenerId>,
    drain_listener: Option<ListenerId>,
    detaching: bool,
}

// ===== attach / detach =====

impl Readable {
    /// Attach `dest`, forwarding chunks as they become available and
    /// ending the destination when this stream ends.
    ///
    /// The `pipe` signal fires on the destination before this returns.
    /// Attaching the same destination again forwards each chunk once per
    /// attachment.
    pub fn pipe(&self, dest: &Writable) -> Result<(), StreamError> {
        self.pipe_opts(dest, PipeOpts::default())
    }

    /// [`pipe`][Readable::pipe] with explicit behavior.
    pub fn pipe_opts(&self, dest: &Writable, opts: PipeOpts) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(Misuse::Closed.into());
        }
        if !dest.is_writable() {
            return Err(StreamError::Unroutable);
        }

        let mut listeners = Vec::new();
        {
            let src = self.clone();
            let d = dest.clone();
            listeners.push(dest.signals().once(Signal::Error, move |event| {
                if let Event::Error(err) = event {
                    on_stream_error(&src, d.signals(), err);
                }
            }));
        }
        {
            let src = self.clone();
            let d = dest.clone();
            listeners.push(dest.signals().once(Signal::Finish, move |_| {
                let _ = src.unpipe(&d);
            }));
        }
        {
            let src = self.clone();
            let d = dest.clone();
            listeners.push(dest.signals().once(Signal::Close, move |_| {
                let _ = src.unpipe(&d);
            }));
        }

        let first = {
            let mut pipes = self.pipe_state().borrow_mut();
            let first = pipes.src_listeners.is_empty();
            pipes.links.push(Link {
                dest: dest.clone(),
                opts,
                listeners,
                drain_listener: None,
                detaching: false,
            });
            first
        };

        if first {
            let src = self.clone();
            let on_readable = self.on(Signal::Readable, move |_| schedule_drive(&src));
            let src = self.clone();
            let on_end = self.once(Signal::End, move |_| on_src_end(&src));
            let src = self.clone();
            let on_close = self.once(Signal::Close, move |_| on_src_end(&src));
            let src = self.clone();
            let on_error = self.once(Signal::Error, move |event| {
                if let Event::Error(err) = event {
                    on_stream_error(&src, src.signals(), err);
                }
            });
            self.pipe_state()
                .borrow_mut()
                .src_listeners
                .extend([on_readable, on_end, on_close, on_error]);
        }

        log::debug!("pipe: destination attached");
        dest.signals().emit(&Event::Pipe);

        if self.end_done() {
            // the end signal already fired, catch this attachment up
            let src = self.clone();
            self.rt().defer(move || on_src_end(&src));
        }
        schedule_drive(self);
        Ok(())
    }

    /// Detach `dest`. The `unpipe` signal fires on the destination while
    /// the attachment still exists, then forwarding stops.
    pub fn unpipe(&self, dest: &Writable) -> Result<(), StreamError> {
        {
            let mut pipes = self.pipe_state().borrow_mut();
            let Some(link) = pipes
                .links
                .iter_mut()
                .find(|l| l.dest.ptr_eq(dest) && !l.detaching)
            else {
                return Err(Misuse::NotPiped.into());
            };
            link.detaching = true;
        }

        dest.signals().emit(&Event::Unpipe);

        let (link, last, resume) = {
            let mut pipes = self.pipe_state().borrow_mut();
            let Some(idx) = pipes
                .links
                .iter()
                .position(|l| l.dest.ptr_eq(dest) && l.detaching)
            else {
                return Ok(());
            };
            let link = pipes.links.remove(idx);
            let mut resume = false;
            if link.drain_listener.is_some() {
                pipes.pending_drains -= 1;
                resume = pipes.pending_drains == 0 && !pipes.links.is_empty();
            }
            (link, pipes.links.is_empty(), resume)
        };

        detach_link(&link);

        if last {
            let ids = mem::take(&mut self.pipe_state().borrow_mut().src_listeners);
            for id in ids {
                self.signals().off(id);
            }
        }
        if resume {
            schedule_drive(self);
        }
        log::debug!("pipe: destination detached");
        Ok(())
    }

    /// Detach every destination.
    pub fn unpipe_all(&self) {
        loop {
            let dest = {
                let pipes = self.pipe_state().borrow();
                match pipes.links.iter().find(|l| !l.detaching) {
                    Some(link) => link.dest.clone(),
                    None => break,
                }
            };
            let _ = self.unpipe(&dest);
        }
    }
}

// ===== forwarding =====

fn schedule_drive(src: &Readable) {
    let this = src.clone();
    src.rt().defer(move || drive(&this));
}

/// Move buffered chunks to every destination until the source runs dry or
/// any destination reports the paused indication.
fn drive(src: &Readable) {
    loop {
        {
            let pipes = src.pipe_state().borrow();
            if pipes.links.is_empty() || pipes.pending_drains > 0 {
                return;
            }
        }

        let chunk = match src.read(0) {
            Ok(Some(chunk)) => chunk,
            Ok(None) | Err(_) => return,
        };

        let dests: Vec<Writable> = src
            .pipe_state()
            .borrow()
            .links
            .iter()
            .map(|l| l.dest.clone())
            .collect();

        let mut paused = Vec::new();
        let mut dead = Vec::new();
        for dest in dests {
            match dest.write(chunk.clone()) {
                Ok(true) => {}
                Ok(false) => paused.push(dest),
                Err(_err) => {
                    log::warning!("pipe: dropping destination: {_err}");
                    dead.push(dest);
                }
            }
        }

        for dest in dead {
            let _ = src.unpipe(&dest);
        }

        if paused.is_empty() {
            continue;
        }

        // hold the whole pipe until every paused destination drained, unless
        // an unpipe handler detached them all while the dead were dropped
        let mut armed = false;
        {
            let mut pipes = src.pipe_state().borrow_mut();
            for dest in paused {
                let Some(link) = pipes
                    .links
                    .iter_mut()
                    .find(|l| l.dest.ptr_eq(&dest) && l.drain_listener.is_none() && !l.detaching)
                else {
                    continue;
                };
                let s = src.clone();
                let d = dest.clone();
                link.drain_listener = Some(dest.signals().once(Signal::Drain, move |_| {
                    on_dest_drain(&s, &d);
                }));
                pipes.pending_drains += 1;
                armed = true;
            }
        }
        if armed {
            return;
        }
    }
}

fn on_dest_drain(src: &Readable, dest: &Writable) {
    let resume = {
        let mut pipes = src.pipe_state().borrow_mut();
        let Some(link) = pipes
            .links
            .iter_mut()
            .find(|l| l.dest.ptr_eq(dest) && l.drain_listener.is_some())
        else {
            return;
        };
        link.drain_listener = None;
        pipes.pending_drains -= 1;
        pipes.pending_drains == 0
    };
    if resume {
        drive(src);
    }
}

/// End propagation, once per attachment round, whether the source ended
/// or was destroyed outright.
fn on_src_end(src: &Readable) {
    let dests: Vec<Writable> = {
        let mut pipes = src.pipe_state().borrow_mut();
        if pipes.did_end {
            return;
        }
        pipes.did_end = true;
        pipes
            .links
            .iter()
            .filter(|l| l.opts.end)
            .map(|l| l.dest.clone())
            .collect()
    };

    teardown_pipes(src);

    for dest in dests {
        if let Err(_err) = dest.end() {
            log::debug!("pipe: destination refused end: {_err}");
        }
    }
}

/// A stream in the pipe errored: detach everything, then escalate if the
/// erroring stream has no error listener of its own left.
fn on_stream_error(src: &Readable, signals: &Signals, err: &StreamError) {
    log::warning!("pipe: detaching on error: {err}");
    teardown_pipes(src);
    if signals.count(Signal::Error) == 0 {
        panic!("unhandled stream error: {err}");
    }
}

fn teardown_pipes(src: &Readable) {
    let (links, src_listeners) = {
        let mut pipes = src.pipe_state().borrow_mut();
        pipes.pending_drains = 0;
        pipes.did_end = false;
        (mem::take(&mut pipes.links), mem::take(&mut pipes.src_listeners))
    };

    for id in src_listeners {
        src.signals().off(id);
    }
    for link in &links {
        detach_link(link);
    }
}

fn detach_link(link: &Link) {
    for id in &link.listeners {
        link.dest.signals().off(*id);
    }
    if let Some(id) = link.drain_listener {
        link.dest.signals().off(id);
    }
}

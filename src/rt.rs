//! Deferred task scheduling.
//!
//! One logical thread drives every stream operation. Concurrency is
//! expressed solely through tasks deferred to a later turn of the
//! [`Runtime`], never through parallel execution.
use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

type Task = Box<dyn FnOnce()>;

type Queue = Rc<RefCell<VecDeque<Task>>>;

// ===== Runtime =====

/// The deferred task queue and the loop that turns it.
///
/// Streams hold a [`Handle`] which can only schedule. Running tasks is the
/// host's job, through [`turn`] or [`run`].
///
/// [`turn`]: Runtime::turn
/// [`run`]: Runtime::run
pub struct Runtime {
    queue: Queue,
}

impl Runtime {
    pub fn new() -> Self {
        Self { queue: Rc::new(RefCell::new(VecDeque::new())) }
    }

    pub fn handle(&self) -> Handle {
        Handle { queue: Rc::clone(&self.queue) }
    }

    /// Runs every task scheduled before this call, in scheduling order.
    ///
    /// Tasks scheduled while the turn is running wait for the next turn.
    /// Returns how many tasks ran.
    pub fn turn(&self) -> usize {
        let count = self.queue.borrow().len();
        for _ in 0..count {
            let task = self.queue.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
        count
    }

    /// Turns until the queue is empty. Returns how many tasks ran in total.
    ///
    /// A task chain that keeps rescheduling itself keeps this running; that
    /// is the cooperative contract, not a guard the runtime provides.
    pub fn run(&self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.turn();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("pending", &self.queue.borrow().len())
            .finish()
    }
}

// ===== Handle =====

/// Cloneable scheduling handle of a [`Runtime`].
///
/// The only operation is [`defer`]: a handle cannot run tasks, so nothing
/// scheduled through it can execute inside the call that scheduled it.
///
/// [`defer`]: Handle::defer
#[derive(Clone)]
pub struct Handle {
    queue: Queue,
}

impl Handle {
    /// Schedule `task` for a later turn.
    pub fn defer(&self, task: impl FnOnce() + 'static) {
        self.queue.borrow_mut().push_back(Box::new(task));
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("pending", &self.queue.borrow().len())
            .finish()
    }
}

//! Evented Byte Stream Toolkit
//!
//! Chunks of [`Bytes`][bytes::Bytes] move from a [`Source`] through
//! bounded buffers to a [`Sink`], with water marks deciding when to pull
//! more and when to push back. All progress happens on a single threaded
//! [`Runtime`], so every hand-off is observable turn by turn.
#![warn(missing_debug_implementations)]

mod log;

pub mod error;
pub mod options;
pub mod queue;
pub mod rt;
pub mod signal;
pub mod source;
pub mod sink;
pub mod compat;

mod readable;
mod writable;
mod duplex;
mod filter;
mod pipe;

pub use error::{Failure, Misuse, StreamError};
pub use options::{Metric, Options};
pub use queue::BufferQueue;
pub use rt::{Handle, Runtime};
pub use signal::{Event, ListenerId, Signal};
pub use source::{source_fn, IterSource, MemorySource, Pull, Source, SourceFn};
pub use sink::{sink_fn, Ack, MemoryData, MemorySink, NullSink, Sink, SinkFn};
pub use compat::{Collect, ReadStream};

pub use duplex::Duplex;
pub use filter::{transform_fn, Emit, Filter, Transform, TransformFn};
pub use pipe::PipeOpts;
pub use readable::{Flow, Readable};
pub use writable::Writable;

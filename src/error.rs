//! Stream error taxonomy.
use std::{error::Error, fmt, rc::Rc};

// ===== Failure =====

/// Failure reported through a capability handle.
///
/// Shares the underlying error, so the same report can surface through the
/// `error` signal, queued write callbacks, and returned [`Result`]s at once.
#[derive(Clone)]
pub struct Failure {
    inner: Rc<dyn Error + 'static>,
}

impl Failure {
    pub fn new<E: Error + 'static>(err: E) -> Self {
        Self { inner: Rc::new(err) }
    }

    pub fn msg(msg: impl Into<String>) -> Self {
        Self { inner: Rc::new(Message(msg.into())) }
    }

    /// Returns the underlying error.
    pub fn get(&self) -> &(dyn Error + 'static) {
        &*self.inner
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl From<&str> for Failure {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for Failure {
    fn from(value: String) -> Self {
        Self::msg(value)
    }
}

struct Message(String);

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for Message {}

// ===== StreamError =====

/// Error surfaced by a stream operation or the `error` signal.
#[derive(thiserror::Error, Debug, Clone)]
pub enum StreamError {
    /// The pull capability reported a failure.
    #[error("producer failure: {0}")]
    Producer(Failure),
    /// The accept or transform capability reported a failure.
    #[error("consumer failure: {0}")]
    Consumer(Failure),
    /// The caller broke the stream contract.
    #[error(transparent)]
    Misuse(#[from] Misuse),
    /// Piping with no destination able to accept data.
    #[error("no live destination")]
    Unroutable,
}

impl StreamError {
    /// Whether the error is a contract violation by the caller, as opposed
    /// to a capability failure.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::Misuse(_))
    }
}

/// Contract violation by the caller.
///
/// Fails the offending call locally, already buffered data is unaffected.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misuse {
    /// Write on a stream that is ending or finished.
    #[error("write after end")]
    WriteAfterEnd,
    /// Repeated `end` call.
    #[error("stream already ended")]
    DoubleEnd,
    /// Unpipe of a destination that is not attached.
    #[error("destination is not piped")]
    NotPiped,
    /// Operation on a destroyed stream.
    #[error("stream is closed")]
    Closed,
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct Custom;

    impl fmt::Display for Custom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("custom source error")
        }
    }

    impl Error for Custom {}

    #[test]
    fn display() {
        let err = StreamError::Producer(Failure::msg("disk on fire"));
        assert_eq!(err.to_string(), "producer failure: disk on fire");

        let err = StreamError::Consumer(Failure::new(Custom));
        assert_eq!(err.to_string(), "consumer failure: custom source error");

        let err = StreamError::from(Misuse::WriteAfterEnd);
        assert_eq!(err.to_string(), "write after end");
        assert!(err.is_misuse());

        assert_eq!(StreamError::Unroutable.to_string(), "no live destination");
        assert!(!StreamError::Unroutable.is_misuse());
    }

    #[test]
    fn failure_shares_inner() {
        let failure = Failure::from("shared");
        let a = StreamError::Producer(failure.clone());
        let b = a.clone();
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(failure.get().to_string(), "shared");
    }
}

use bytes::Bytes;

/// How buffered volume is counted against the water marks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Metric {
    /// Sum of chunk lengths in bytes.
    #[default]
    Bytes,
    /// One unit per chunk regardless of its length.
    Chunks,
}

impl Metric {
    #[inline]
    pub(crate) fn measure(&self, chunk: &Bytes) -> usize {
        match self {
            Metric::Bytes => chunk.len(),
            Metric::Chunks => 1,
        }
    }
}

/// Buffering thresholds for one side of a stream.
///
/// `high_water` is the level at which writes start reporting a paused
/// indication and reads stop requesting more input. `low_water` is the
/// level the buffer must fall below before a drain fires or refilling
/// resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub high_water: usize,
    pub low_water: usize,
    pub metric: Metric,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            high_water: 16 * 1024,
            low_water: 1024,
            metric: Metric::Bytes,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn high_water(mut self, value: usize) -> Self {
        self.high_water = value;
        self
    }

    pub fn low_water(mut self, value: usize) -> Self {
        self.low_water = value;
        self
    }

    pub fn metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }
}

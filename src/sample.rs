//! Sample stream data model (spec §3, §6).
//!
//! A sample stream is a finite, lazy, forward-only sequence of
//! [`SampleChunk`]. Samples within one chunk are uniformly spaced; chunks
//! may differ in length but not in implied sample rate within a stream.
//! Samples are monotonic in time; chunks do not overlap.

/// One contiguous run of uniformly-spaced voltage samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleChunk {
    /// Absolute time of `samples[0]`, in seconds.
    pub start_time: f64,
    /// Spacing between consecutive samples, in seconds. Must be > 0.
    pub sample_period: f64,
    /// The sample values themselves.
    pub samples: Vec<f64>,
}

impl SampleChunk {
    pub fn new(start_time: f64, sample_period: f64, samples: Vec<f64>) -> Self {
        debug_assert!(sample_period > 0.0, "sample_period must be positive");
        Self {
            start_time,
            sample_period,
            samples,
        }
    }

    /// Absolute time of the sample at `index` within this chunk.
    pub fn time_at(&self, index: usize) -> f64 {
        self.start_time + self.sample_period * index as f64
    }

    /// Time immediately following the last sample in this chunk.
    pub fn end_time(&self) -> f64 {
        self.start_time + self.sample_period * self.samples.len() as f64
    }
}

/// A lazy, forward-only producer of [`SampleChunk`]s.
///
/// Any `Iterator<Item = SampleChunk>` satisfies this contract; the alias
/// exists so decoder signatures read the way the spec describes them.
pub trait SampleStream: Iterator<Item = SampleChunk> {}
impl<T: Iterator<Item = SampleChunk>> SampleStream for T {}

/// Flatten a sample stream into a single `(time, value)` sequence.
///
/// Used by components (the logic-level detector, the edge detector) that
/// need to walk individual samples irrespective of chunk boundaries.
pub fn flatten_samples<I>(chunks: I) -> impl Iterator<Item = (f64, f64)>
where
    I: Iterator<Item = SampleChunk>,
{
    chunks.flat_map(|chunk| {
        let period = chunk.sample_period;
        let start = chunk.start_time;
        chunk
            .samples
            .into_iter()
            .enumerate()
            .map(move |(i, v)| (start + period * i as f64, v))
    })
}

/// Build a sample stream (as a single chunk) from a raw sample array (spec
/// §4.7, `samples_to_sample_stream`).
pub fn samples_to_sample_stream(raw: Vec<f64>, sample_period: f64, start_time: f64) -> SampleChunk {
    SampleChunk::new(start_time, sample_period, raw)
}

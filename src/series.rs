//! Shared sample buffer between the acquisition loop and its consumers.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// One reading from the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Device clock in milliseconds. Non-decreasing within a streaming session.
    pub timestamp_ms: u64,
    /// Physical value (volts or absorbance) after decoding.
    pub value: f64,
}

impl Sample {
    #[inline]
    pub fn new(timestamp_ms: u64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }

    /// Timestamp in seconds, the unit plots are usually drawn in.
    pub fn seconds(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }
}

#[derive(Debug, Default)]
struct Inner {
    samples: Vec<Sample>,
    generation: u64,
}

/// Append-only sample series. Cloning yields another handle to the same data.
///
/// Entries are never modified once appended; [`SeriesStore::reset`] is the
/// only way to shrink it, and each reset bumps a generation counter so
/// consumers holding a [`SeriesCursor`] notice.
#[derive(Debug, Clone, Default)]
pub struct SeriesStore {
    inner: Arc<RwLock<Inner>>,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, samples: &[Sample]) {
        if samples.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.samples.extend_from_slice(samples);
    }

    pub fn push(&self, sample: Sample) {
        self.append(std::slice::from_ref(&sample));
    }

    /// Truncate to empty in one step.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.samples.clear();
        inner.generation += 1;
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.read(|inner| inner.samples.clone())
    }

    pub fn len(&self) -> usize {
        self.read(|inner| inner.samples.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<Sample> {
        self.read(|inner| inner.samples.last().copied())
    }

    /// Number of resets so far.
    pub fn generation(&self) -> u64 {
        self.read(|inner| inner.generation)
    }

    /// Cursor positioned at the current end of the series.
    pub fn cursor(&self) -> SeriesCursor {
        self.read(|inner| SeriesCursor {
            consumed: inner.samples.len(),
            generation: inner.generation,
        })
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&inner)
    }
}

/// Consumer-side record of how much of a series has been handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeriesCursor {
    consumed: usize,
    generation: u64,
}

impl SeriesCursor {
    /// Cursor at the very beginning of a series.
    pub fn start() -> Self {
        Self::default()
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Samples appended since the last call. After a reset the cursor
    /// rewinds and returns everything appended since the reset.
    pub fn next_batch(&mut self, store: &SeriesStore) -> Vec<Sample> {
        store.read(|inner| {
            if inner.generation != self.generation || self.consumed > inner.samples.len() {
                self.generation = inner.generation;
                self.consumed = 0;
            }
            let batch = inner.samples[self.consumed..].to_vec();
            self.consumed = inner.samples.len();
            batch
        })
    }
}

//! Bounded, time-ordered sample queues with one lock per stream.
//!
//! Producers append; the query path copies short windows out. No lock is held
//! longer than a `VecDeque` push or a copy of the requested window.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::Timestamped;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of appending to a [`SampleBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Appended,
    /// Appended after evicting the oldest sample.
    Evicted,
    /// Rejected: older than the newest sample already queued.
    OutOfOrder,
}

impl PushOutcome {
    pub fn accepted(self) -> bool {
        !matches!(self, PushOutcome::OutOfOrder)
    }
}

pub struct SampleBuffer<T> {
    name: &'static str,
    capacity: usize,
    samples: Mutex<VecDeque<T>>,
}

impl<T: Timestamped + Clone> SampleBuffer<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append in O(1) amortised, evicting the oldest sample when full.
    ///
    /// Timestamps must be non-decreasing; an older sample is rejected so the
    /// queue never needs reordering.
    pub fn push(&self, sample: T) -> PushOutcome {
        let mut samples = lock(&self.samples);
        if let Some(newest) = samples.back() {
            if sample.timestamp() < newest.timestamp() {
                return PushOutcome::OutOfOrder;
            }
        }

        let mut outcome = PushOutcome::Appended;
        while samples.len() >= self.capacity {
            samples.pop_front();
            outcome = PushOutcome::Evicted;
        }
        samples.push_back(sample);
        outcome
    }

    /// Samples strictly newer than `timestamp`, ascending.
    pub fn snapshot_since(&self, timestamp: f64) -> Vec<T> {
        let samples = lock(&self.samples);
        let start = samples.partition_point(|s| s.timestamp() <= timestamp);
        samples.range(start..).cloned().collect()
    }

    /// Like [`snapshot_since`](Self::snapshot_since) but also returns the newest
    /// sample at or before `timestamp`, which brackets the window's first step.
    pub fn window_since(&self, timestamp: f64) -> (Option<T>, Vec<T>) {
        let samples = lock(&self.samples);
        let start = samples.partition_point(|s| s.timestamp() <= timestamp);
        let anchor = start.checked_sub(1).and_then(|i| samples.get(i)).cloned();
        (anchor, samples.range(start..).cloned().collect())
    }

    /// Samples in `(after, up_to]` plus the first one past `up_to`, with the
    /// anchor at or before `after`. Both ends are bracketed for interpolation.
    pub fn window_between(&self, after: f64, up_to: f64) -> (Option<T>, Vec<T>) {
        let samples = lock(&self.samples);
        let start = samples.partition_point(|s| s.timestamp() <= after);
        let end = (samples.partition_point(|s| s.timestamp() <= up_to) + 1)
            .min(samples.len())
            .max(start);
        let anchor = start.checked_sub(1).and_then(|i| samples.get(i)).cloned();
        (anchor, samples.range(start..end).cloned().collect())
    }

    /// Every queued sample with `timestamp <= up_to`, ascending.
    pub fn snapshot_until(&self, up_to: f64) -> Vec<T> {
        let samples = lock(&self.samples);
        let end = samples.partition_point(|s| s.timestamp() <= up_to);
        samples.range(..end).cloned().collect()
    }

    pub fn latest(&self) -> Option<T> {
        lock(&self.samples).back().cloned()
    }

    /// Drop samples older than `timestamp`, keeping the newest of them as an anchor.
    pub fn discard_before(&self, timestamp: f64) -> usize {
        let mut samples = lock(&self.samples);
        let older = samples.partition_point(|s| s.timestamp() < timestamp);
        let remove = older.saturating_sub(1);
        samples.drain(..remove);
        remove
    }

    pub fn clear(&self) {
        lock(&self.samples).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.samples).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.samples).is_empty()
    }
}

/// Single-slot cell holding only the most recent value.
pub struct LatestCell<T> {
    value: Mutex<Option<T>>,
}

impl<T: Clone> LatestCell<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    /// Overwrite, returning the previous value.
    pub fn set(&self, value: T) -> Option<T> {
        lock(&self.value).replace(value)
    }

    pub fn get(&self) -> Option<T> {
        lock(&self.value).clone()
    }

    pub fn clear(&self) {
        lock(&self.value).take();
    }
}

impl<T: Clone> Default for LatestCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

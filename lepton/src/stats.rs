/*!
Session statistics.

The read thread owns a working [`Stats`] and publishes copies of it into a
[`StatsCell`]; readers only ever see whole published copies.
*/

use crate::error::LeptonError;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Monotonic counters for one device session
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    /// Frames returned to the caller
    pub good_frames: u64,
    /// Frames dropped for being identical to the previous one
    pub duplicate_frames: u64,
    /// Link read failures
    pub transfer_fails: u64,
    /// Lines accepted in sequence
    pub good_lines: u64,
    /// Lines with an out of range ID or a bad CRC
    pub broken_lines: u64,
    /// Filler packets
    pub discard_lines: u64,
    /// In-range lines received out of sequence
    pub bad_sync_lines: u64,
    /// Link resets issued
    pub resets: u64,
    /// Telemetry rows that failed validation
    pub validation_fails: u64,
    /// Frames evicted from a full hand-off queue
    pub dropped_frames: u64,
    /// Most recent failure, if any
    #[serde(serialize_with = "serialize_fail")]
    pub last_fail: Option<Arc<LeptonError>>,
}

fn serialize_fail<S: Serializer>(fail: &Option<Arc<LeptonError>>, s: S) -> Result<S::Ok, S::Error> {
    match fail {
        Some(err) => s.serialize_some(&err.to_string()),
        None => s.serialize_none(),
    }
}

impl Stats {
    /// Record a failure
    pub fn record_fail(&mut self, err: LeptonError) {
        self.last_fail = Some(Arc::new(err));
    }

    /// Total lines seen, filler included
    pub fn total_lines(&self) -> u64 {
        self.good_lines + self.broken_lines + self.discard_lines + self.bad_sync_lines
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames ({} dup, {} dropped), {} good lines, {} discard, {} broken, {} bad sync, {} resets, {} transfer fails, {} validation fails",
            self.good_frames,
            self.duplicate_frames,
            self.dropped_frames,
            self.good_lines,
            self.discard_lines,
            self.broken_lines,
            self.bad_sync_lines,
            self.resets,
            self.transfer_fails,
            self.validation_fails,
        )?;
        if let Some(err) = &self.last_fail {
            write!(f, "; last failure: {}", err)?;
        }
        Ok(())
    }
}

/// Immutable copy of the counters taken at one publication point
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct StatsSnapshot(Stats);

impl Deref for StatsSnapshot {
    type Target = Stats;

    fn deref(&self) -> &Stats {
        &self.0
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Stats> for StatsSnapshot {
    fn from(stats: Stats) -> Self {
        Self(stats)
    }
}

/// Single-writer, multi-reader holder of the latest published stats.
///
/// The lock only ever guards a copy of a few integers and an `Arc` clone.
#[derive(Debug, Clone, Default)]
pub struct StatsCell {
    inner: Arc<Mutex<Stats>>,
}

impl StatsCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published counters
    pub fn publish(&self, stats: &Stats) {
        *self.inner.lock() = stats.clone();
    }

    /// Apply `f` to the published counters in place
    pub fn update(&self, f: impl FnOnce(&mut Stats)) {
        f(&mut self.inner.lock());
    }

    /// Copy of the last published counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot(self.inner.lock().clone())
    }
}

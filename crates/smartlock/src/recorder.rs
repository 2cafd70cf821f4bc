//! Knock pattern recording.
//!
//! A [`PatternRecorder`] turns a live sequence of taps into the stored interval
//! encoding: for tap times `t[0..=n]` the pattern is `t[i+1] - t[i]` for every
//! `i`, so `n + 1` taps yield `n` intervals.
//!
//! Tap times come from a monotonic clock started by [`PatternRecorder::start_recording`],
//! so intervals are never negative. Callers that already have timestamps (a
//! hardware event stream, a test) use [`PatternRecorder::record_tap_at`].
//!
//! The recorder holds no store handle; [`SmartLock::stop_and_save`](crate::SmartLock::stop_and_save)
//! validates through [`PatternRecorder::finish`] and then performs the write.

use std::time::Instant;

use tracing::debug;

use crate::error::{Error, Result};

/// Fewest taps that make a pattern
pub const MIN_TAPS: usize = 2;

/// A validated recording, ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPattern {
    /// Display label
    pub name: String,
    /// Milliseconds between consecutive taps
    pub intervals: Vec<u64>,
}

/// Tap buffer for one recording session
#[derive(Debug, Default)]
pub struct PatternRecorder {
    recording: bool,
    started: Option<Instant>,
    taps: Vec<u64>,
}

impl PatternRecorder {
    /// Create an idle recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the tap buffer and start recording.
    pub fn start_recording(&mut self) {
        self.taps.clear();
        self.started = Some(Instant::now());
        self.recording = true;
        debug!("Pattern recording started");
    }

    /// Record a tap at the current time.
    ///
    /// Returns `false` without recording when no session is active. One
    /// physical tap must be reported once: callers wiring both pointer and
    /// touch input must pick one source per device.
    pub fn record_tap(&mut self) -> bool {
        let Some(started) = self.started else {
            return false;
        };
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.record_tap_at(elapsed)
    }

    /// Record a tap at an explicit time in milliseconds.
    pub fn record_tap_at(&mut self, millis: u64) -> bool {
        if !self.recording {
            return false;
        }
        self.taps.push(millis);
        true
    }

    /// Whether a session is active
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Taps recorded in the current buffer
    #[must_use]
    pub fn tap_count(&self) -> usize {
        self.taps.len()
    }

    /// Stop recording and validate the buffer.
    ///
    /// Fails with a validation error when fewer than [`MIN_TAPS`] taps were
    /// recorded or `name` is blank. On failure the taps are kept so the caller
    /// can fix the name and finish again; on success the buffer is cleared.
    pub fn finish(&mut self, name: &str) -> Result<RecordedPattern> {
        self.recording = false;

        if self.taps.len() < MIN_TAPS {
            return Err(Error::validation("pattern too short, tap at least twice"));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("pattern name must not be empty"));
        }

        let intervals = intervals_from_taps(&self.taps);
        self.taps.clear();
        self.started = None;
        debug!(name, taps = intervals.len() + 1, "Pattern recording finished");

        Ok(RecordedPattern {
            name: name.to_string(),
            intervals,
        })
    }

    /// Stop recording and discard the buffer.
    pub fn cancel(&mut self) {
        self.recording = false;
        self.started = None;
        self.taps.clear();
        debug!("Pattern recording cancelled");
    }
}

/// Differences between consecutive tap times.
#[must_use]
pub fn intervals_from_taps(taps: &[u64]) -> Vec<u64> {
    taps.windows(2).map(|w| w[1].saturating_sub(w[0])).collect()
}

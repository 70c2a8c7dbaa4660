//! Per-buffer RMS history used for level metering.
//!
//! The capture thread is the only writer. Display threads read the history
//! without locking; each slot is an independent atomic, so a reader racing a
//! write may observe the previous or the next value of a slot but never a
//! torn one.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Number of buffers kept in the history.
pub const LEVEL_HISTORY_CAPACITY: usize = 20;
/// Gain applied to the RMS amplitude before truncating to an integer.
pub const LEVEL_DISPLAY_GAIN: f32 = 200.0;

/// Fixed-capacity FIFO of integer loudness values.
#[derive(Debug)]
pub struct LevelMeter {
    slots: [AtomicU32; LEVEL_HISTORY_CAPACITY],
    written: AtomicUsize,
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelMeter {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU32::new(0)),
            written: AtomicUsize::new(0),
        }
    }

    /// Computes the scaled RMS level of `samples` and appends it, evicting the
    /// oldest entry once the history is full.
    pub fn record(&self, samples: &[f32]) -> u32 {
        let level = display_level(samples);
        let index = self.written.load(Ordering::Relaxed);
        self.slots[index % LEVEL_HISTORY_CAPACITY].store(level, Ordering::Relaxed);
        self.written.store(index.wrapping_add(1), Ordering::Release);
        level
    }

    /// Returns the retained levels, oldest first.
    pub fn history(&self) -> Vec<u32> {
        let written = self.written.load(Ordering::Acquire);
        let len = written.min(LEVEL_HISTORY_CAPACITY);
        let start = written - len;
        (start..written)
            .map(|index| self.slots[index % LEVEL_HISTORY_CAPACITY].load(Ordering::Relaxed))
            .collect()
    }

    /// Most recently recorded level, if any.
    pub fn latest(&self) -> Option<u32> {
        let written = self.written.load(Ordering::Acquire);
        if written == 0 {
            return None;
        }
        Some(self.slots[(written - 1) % LEVEL_HISTORY_CAPACITY].load(Ordering::Relaxed))
    }

    /// Peak of the retained history, for a peak-hold style meter.
    pub fn peak(&self) -> u32 {
        self.history().into_iter().max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.written.load(Ordering::Acquire).min(LEVEL_HISTORY_CAPACITY)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Root-mean-square amplitude of a block of samples.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn display_level(samples: &[f32]) -> u32 {
    let scaled = compute_rms(samples) * LEVEL_DISPLAY_GAIN;
    if scaled.is_finite() {
        // float to int `as` casts saturate, so clipping input cannot overflow
        scaled as u32
    } else {
        0
    }
}

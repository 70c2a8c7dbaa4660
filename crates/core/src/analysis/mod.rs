use std::{collections::VecDeque, f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{BeatSyncError, Result};

const FLUX_HISTORY: usize = 43;
const FLUX_MULTIPLIER: f32 = 1.5;
const FLUX_FLOOR: f32 = 1e-3;
const MIN_ONSET_INTERVAL: f32 = 0.2;
const MAX_ONSET_HISTORY: usize = 16;

/// Outcome of analysing a single audio buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    pub is_onset: bool,
    pub bpm_estimate: f32,
}

/// Onset and tempo tracker driven once per captured buffer.
///
/// Implementations keep whatever adaptive state they need internally; callers
/// only see whether the buffer contained an onset and the running estimate.
pub trait TempoAnalyzer: Send {
    /// Consumes one buffer and reports whether a beat onset occurred in it.
    fn analyze(&mut self, buffer: &[f32]) -> bool;

    /// Running tempo estimate in beats per minute. `0.0` until known.
    fn current_bpm(&self) -> f32;

    /// Convenience wrapper returning both values as a [`BeatEvent`].
    fn process(&mut self, buffer: &[f32]) -> BeatEvent {
        let is_onset = self.analyze(buffer);
        BeatEvent {
            is_onset,
            bpm_estimate: self.current_bpm(),
        }
    }
}

/// Spectral-flux onset detector with an inter-onset-interval tempo estimate.
///
/// Frames of `window_size` samples are advanced by `hop_size`, Hann windowed
/// and transformed with `realfft`. Positive magnitude differences against the
/// previous frame are summed into a flux value which is compared against an
/// adaptive threshold built from the recent flux history.
pub struct SpectralFluxTracker {
    window_size: usize,
    hop_size: usize,
    sample_rate: u32,
    window: Vec<f32>,
    previous_magnitudes: Vec<f32>,
    flux_history: VecDeque<f32>,
    onset_times: VecDeque<f32>,
    processed_samples: u64,
    bpm: f32,
    plan: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl SpectralFluxTracker {
    /// Creates a tracker for the given analysis window, hop and sample rate.
    pub fn new(window_size: usize, hop_size: usize, sample_rate: u32) -> Result<Self> {
        if window_size < 2 {
            return Err(BeatSyncError::invalid(
                "analysis window must hold at least two samples",
            ));
        }
        if hop_size == 0 || hop_size > window_size {
            return Err(BeatSyncError::invalid(
                "hop size must be positive and no larger than the window",
            ));
        }
        if sample_rate == 0 {
            return Err(BeatSyncError::invalid("sample rate must be positive"));
        }

        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(window_size);
        let input = plan.make_input_vec();
        let spectrum = plan.make_output_vec();
        let scratch = plan.make_scratch_vec();

        Ok(Self {
            window_size,
            hop_size,
            sample_rate,
            window: vec![0.0; window_size],
            previous_magnitudes: vec![0.0; spectrum.len()],
            flux_history: VecDeque::with_capacity(FLUX_HISTORY),
            onset_times: VecDeque::with_capacity(MAX_ONSET_HISTORY),
            processed_samples: 0,
            bpm: 0.0,
            plan,
            input,
            spectrum,
            scratch,
        })
    }

    /// Tracker using the conventional `window = 2 * buffer`, `hop = buffer` layout.
    pub fn for_buffer_size(buffer_size: usize, sample_rate: u32) -> Result<Self> {
        Self::new(buffer_size.saturating_mul(2), buffer_size, sample_rate)
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Clears the adaptive state while preserving configuration.
    pub fn reset(&mut self) {
        self.window.fill(0.0);
        self.previous_magnitudes.fill(0.0);
        self.flux_history.clear();
        self.onset_times.clear();
        self.processed_samples = 0;
        self.bpm = 0.0;
    }

    fn push_samples(&mut self, buffer: &[f32]) {
        let take = buffer.len().min(self.window_size);
        self.window.copy_within(take.., 0);
        let tail = self.window_size - take;
        self.window[tail..].copy_from_slice(&buffer[buffer.len() - take..]);
        self.processed_samples += buffer.len() as u64;
    }

    fn spectral_flux(&mut self) -> f32 {
        let len = self.window_size;
        for (index, value) in self.window.iter().enumerate() {
            let sample = if value.is_finite() { *value } else { 0.0 };
            self.input[index] = sample * hann_value(index, len);
        }

        if let Err(err) =
            self.plan
                .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
        {
            tracing::debug!(error = %err, "FFT failed, treating buffer as silent");
            return 0.0;
        }

        let mut flux = 0.0;
        for (bin, previous) in self.spectrum.iter().zip(self.previous_magnitudes.iter_mut()) {
            let magnitude = bin.norm();
            flux += (magnitude - *previous).max(0.0);
            *previous = magnitude;
        }
        flux / self.spectrum.len() as f32
    }

    fn threshold(&self) -> f32 {
        if self.flux_history.is_empty() {
            return FLUX_FLOOR;
        }
        let mean = self.flux_history.iter().sum::<f32>() / self.flux_history.len() as f32;
        mean * FLUX_MULTIPLIER + FLUX_FLOOR
    }

    fn register_onset(&mut self, timestamp: f32) -> bool {
        let debounced = self
            .onset_times
            .back()
            .map(|last| timestamp - last >= MIN_ONSET_INTERVAL)
            .unwrap_or(true);
        if !debounced {
            return false;
        }

        self.onset_times.push_back(timestamp);
        if self.onset_times.len() > MAX_ONSET_HISTORY {
            self.onset_times.pop_front();
        }
        self.update_tempo_estimate();
        true
    }

    fn update_tempo_estimate(&mut self) {
        let mut intervals: Vec<f32> = self
            .onset_times
            .iter()
            .zip(self.onset_times.iter().skip(1))
            .map(|(a, b)| b - a)
            .filter(|interval| *interval > f32::EPSILON)
            .collect();

        if intervals.is_empty() {
            return;
        }

        intervals.sort_by(|a, b| a.total_cmp(b));
        let mid = intervals.len() / 2;
        let median = if intervals.len() % 2 == 0 {
            (intervals[mid - 1] + intervals[mid]) * 0.5
        } else {
            intervals[mid]
        };
        self.bpm = 60.0 / median;
    }
}

impl TempoAnalyzer for SpectralFluxTracker {
    fn analyze(&mut self, buffer: &[f32]) -> bool {
        if buffer.is_empty() {
            return false;
        }

        self.push_samples(buffer);
        let flux = self.spectral_flux();
        let threshold = self.threshold();

        self.flux_history.push_back(flux);
        if self.flux_history.len() > FLUX_HISTORY {
            self.flux_history.pop_front();
        }

        if flux <= threshold {
            return false;
        }

        let timestamp = self.processed_samples as f32 / self.sample_rate as f32;
        self.register_onset(timestamp)
    }

    fn current_bpm(&self) -> f32 {
        self.bpm
    }
}

impl fmt::Debug for SpectralFluxTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralFluxTracker")
            .field("window_size", &self.window_size)
            .field("hop_size", &self.hop_size)
            .field("sample_rate", &self.sample_rate)
            .field("processed_samples", &self.processed_samples)
            .field("onsets", &self.onset_times.len())
            .field("bpm", &self.bpm)
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

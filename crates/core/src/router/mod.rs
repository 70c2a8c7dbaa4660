//! Per-onset decision logic run inside the capture callback.
//!
//! The router owns the beat counters and reads the operator controls through
//! [`SharedControls`], the only state shared with the UI thread. Each onset
//! is validated, shown on the live readout and, in sync mode, forwarded to
//! the controller once every `beat_divider` onsets.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::analysis::{BeatEvent, TempoAnalyzer};
use crate::audio::CallbackFlow;
use crate::config::OscConfig;
use crate::display::{DisplayChannel, DisplaySink};
use crate::level::LevelMeter;
use crate::osc::{OscSender, SendOutcome};
use crate::{BeatSyncError, Result};

/// Exclusive lower bound for a tempo to be forwarded.
pub const MIN_FORWARD_BPM: i32 = 20;
/// Exclusive upper bound for a tempo to be forwarded.
pub const MAX_FORWARD_BPM: i32 = 200;
/// Tempo reported before the first accepted onset.
pub const DEFAULT_BPM: i32 = 128;
/// Onsets per bar for the cosmetic bar position.
pub const BAR_LENGTH: u64 = 4;

/// Operator controls, read by the capture thread and written by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    pub running: bool,
    pub sync_enabled: bool,
    pub beat_divider: u32,
}

/// Branch the router takes for the next onset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    Idle,
    Listening,
    Syncing,
}

impl ControlState {
    pub fn mode(&self) -> RouterMode {
        match (self.running, self.sync_enabled) {
            (false, _) => RouterMode::Idle,
            (true, false) => RouterMode::Listening,
            (true, true) => RouterMode::Syncing,
        }
    }
}

/// Cloneable handle to the controls guarded by a single mutex.
#[derive(Debug, Clone)]
pub struct SharedControls {
    inner: Arc<Mutex<ControlState>>,
}

impl SharedControls {
    /// Creates stopped controls. The session flips `running` on start.
    pub fn new(sync_enabled: bool, beat_divider: u32) -> Result<Self> {
        validate_divider(beat_divider)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(ControlState {
                running: false,
                sync_enabled,
                beat_divider,
            })),
        })
    }

    pub fn snapshot(&self) -> ControlState {
        *self.inner.lock()
    }

    /// Snapshot that gives up after `timeout` instead of waiting on a stuck writer.
    pub fn try_snapshot_for(&self, timeout: Duration) -> Option<ControlState> {
        self.inner.try_lock_for(timeout).map(|state| *state)
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub fn set_running(&self, running: bool) {
        self.inner.lock().running = running;
    }

    pub fn set_sync_enabled(&self, enabled: bool) {
        self.inner.lock().sync_enabled = enabled;
    }

    /// Flips sync mode and returns the new value.
    pub fn toggle_sync(&self) -> bool {
        let mut state = self.inner.lock();
        state.sync_enabled = !state.sync_enabled;
        state.sync_enabled
    }

    pub fn set_beat_divider(&self, beat_divider: u32) -> Result<()> {
        validate_divider(beat_divider)?;
        self.inner.lock().beat_divider = beat_divider;
        Ok(())
    }

    /// Applies several changes under one lock acquisition.
    pub fn update<R>(&self, f: impl FnOnce(&mut ControlState) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

fn validate_divider(beat_divider: u32) -> Result<()> {
    if beat_divider == 0 {
        return Err(BeatSyncError::invalid("beat divider must be positive"));
    }
    Ok(())
}

/// Duration of one buffer at the given sample rate.
pub fn buffer_period(buffer_size: usize, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(buffer_size as f64 / sample_rate.max(1) as f64)
}

/// OSC addresses the router writes to, bound to a shared sender.
#[derive(Debug, Clone)]
pub struct OscRoutes {
    sender: Arc<OscSender>,
    bpm_address: String,
    resync_address: String,
}

impl OscRoutes {
    pub fn new(sender: Arc<OscSender>, config: &OscConfig) -> Self {
        Self {
            sender,
            bpm_address: config.bpm_address.clone(),
            resync_address: config.resync_address.clone(),
        }
    }

    pub fn sender(&self) -> &Arc<OscSender> {
        &self.sender
    }

    /// Sends a tempo to the BPM parameter using the normalised mapping.
    pub fn send_bpm(&self, bpm: i32) -> SendOutcome {
        self.sender.send(&self.bpm_address, bpm, true)
    }

    /// Sends the fixed resync trigger.
    pub fn resync(&self) -> SendOutcome {
        self.sender.send(&self.resync_address, 1, false)
    }
}

/// What the router did with one analysed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The buffer contained no onset.
    NoOnset,
    /// Tempo out of range, not finite, or the session is stopped.
    Rejected,
    /// Sync is off; only the live readout was updated.
    LiveOnly { bpm: i32 },
    /// Sync is on but the divider skipped this onset.
    Held { bpm: i32 },
    /// The onset was forwarded to the controller and the sent readout.
    Forwarded { live: i32, sent: i32 },
}

/// State machine deciding which onsets reach the display and the controller.
pub struct BeatEventRouter {
    analyzer: Box<dyn TempoAnalyzer>,
    controls: SharedControls,
    display: Arc<dyn DisplaySink>,
    osc: OscRoutes,
    levels: Arc<LevelMeter>,
    lock_budget: Duration,
    last_controls: ControlState,
    lock_stalled: bool,
    beat_counter: u64,
    bar_position: u8,
    bpm_cache: i32,
}

impl BeatEventRouter {
    pub fn new(
        analyzer: Box<dyn TempoAnalyzer>,
        controls: SharedControls,
        display: Arc<dyn DisplaySink>,
        osc: OscRoutes,
        levels: Arc<LevelMeter>,
        lock_budget: Duration,
    ) -> Self {
        let last_controls = controls.snapshot();
        Self {
            analyzer,
            controls,
            display,
            osc,
            levels,
            lock_budget,
            last_controls,
            lock_stalled: false,
            beat_counter: 0,
            bar_position: 0,
            bpm_cache: DEFAULT_BPM,
        }
    }

    /// Onsets seen since construction. Drives the divider gate.
    pub fn beat_counter(&self) -> u64 {
        self.beat_counter
    }

    /// Position within the current four-beat bar, for blink cadence only.
    pub fn bar_position(&self) -> u8 {
        self.bar_position
    }

    /// Last tempo that passed the range check.
    pub fn bpm_cache(&self) -> i32 {
        self.bpm_cache
    }

    pub fn osc_routes(&self) -> &OscRoutes {
        &self.osc
    }

    /// Capture callback body: meters the buffer, analyses it and routes any
    /// onset. Returns [`CallbackFlow::Complete`] once the session stops.
    pub fn process_buffer(&mut self, buffer: &[f32]) -> CallbackFlow {
        self.levels.record(buffer);
        let event = self.analyzer.process(buffer);
        let controls = self.read_controls();

        if event.is_onset {
            self.route_with(event, controls);
        }

        if controls.running {
            CallbackFlow::Continue
        } else {
            CallbackFlow::Complete
        }
    }

    /// Routes a single analyser result using the current controls.
    pub fn route(&mut self, event: BeatEvent) -> RouteOutcome {
        let controls = self.read_controls();
        self.route_with(event, controls)
    }

    /// Sends the resync trigger. Leaves the beat counters untouched.
    pub fn resync(&self) -> SendOutcome {
        self.osc.resync()
    }

    /// Whether the last control read timed out and fell back to the cached state.
    pub fn lock_stalled(&self) -> bool {
        self.lock_stalled
    }

    fn read_controls(&mut self) -> ControlState {
        match self.controls.try_snapshot_for(self.lock_budget) {
            Some(controls) => {
                if self.lock_stalled {
                    self.lock_stalled = false;
                    tracing::debug!("control lock available again");
                }
                self.last_controls = controls;
                controls
            }
            None => {
                // warn once per stall; the capture thread must not flood the log
                if !self.lock_stalled {
                    self.lock_stalled = true;
                    tracing::warn!(
                        budget_us = self.lock_budget.as_micros() as u64,
                        "control lock busy for a whole buffer period, reusing last controls"
                    );
                }
                self.last_controls
            }
        }
    }

    fn route_with(&mut self, event: BeatEvent, controls: ControlState) -> RouteOutcome {
        if !event.is_onset {
            return RouteOutcome::NoOnset;
        }

        self.beat_counter = self.beat_counter.wrapping_add(1);
        let outcome = match accept_bpm(event.bpm_estimate) {
            Some(bpm) if controls.running => {
                self.bpm_cache = bpm;
                self.dispatch(bpm, controls)
            }
            _ => {
                tracing::trace!(estimate = event.bpm_estimate, "onset rejected");
                RouteOutcome::Rejected
            }
        };

        // Cosmetic only. The divider gate above reads the unreset counter.
        self.bar_position = (self.beat_counter % BAR_LENGTH) as u8;
        outcome
    }

    fn dispatch(&mut self, bpm: i32, controls: ControlState) -> RouteOutcome {
        if !controls.sync_enabled {
            self.display.update(bpm, DisplayChannel::Live, false);
            return RouteOutcome::LiveOnly { bpm };
        }

        self.display.update(bpm, DisplayChannel::Live, true);

        let divider = u64::from(controls.beat_divider.max(1));
        if divider == 1 {
            return self.forward(bpm, bpm);
        }
        if (self.beat_counter + 1) % divider == 0 {
            let divided = (bpm as u64 / divider) as i32;
            return self.forward(bpm, divided);
        }

        tracing::trace!(bpm, beat = self.beat_counter, divider, "onset held by divider");
        RouteOutcome::Held { bpm }
    }

    fn forward(&mut self, live: i32, sent: i32) -> RouteOutcome {
        let outcome = self.osc.send_bpm(sent);
        tracing::debug!(live, sent, ?outcome, "tempo forwarded");
        self.display.update(sent, DisplayChannel::Sent, true);
        self.display.advance_indicator();
        RouteOutcome::Forwarded { live, sent }
    }
}

impl std::fmt::Debug for BeatEventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeatEventRouter")
            .field("controls", &self.last_controls)
            .field("beat_counter", &self.beat_counter)
            .field("bar_position", &self.bar_position)
            .field("bpm_cache", &self.bpm_cache)
            .finish()
    }
}

/// Rounds an estimate to whole BPM and keeps it only inside `(20, 200)`.
pub fn accept_bpm(estimate: f32) -> Option<i32> {
    if !estimate.is_finite() {
        return None;
    }
    let rounded = estimate.round();
    if rounded > MIN_FORWARD_BPM as f32 && rounded < MAX_FORWARD_BPM as f32 {
        Some(rounded as i32)
    } else {
        None
    }
}

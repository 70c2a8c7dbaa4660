//! Sinks that render tempo updates for the operator.

use std::io::Write;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Number of positions of the beat indicator (one bar of four beats).
pub const INDICATOR_STEPS: u8 = 4;

/// Which readout a tempo update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayChannel {
    /// Tempo as detected from the input.
    Live,
    /// Tempo that was forwarded to the controller.
    Sent,
}

impl DisplayChannel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Sent => "sent",
        }
    }
}

/// Receives tempo updates from the capture thread.
///
/// Implementations are called from the real-time audio thread and must not
/// block for long.
pub trait DisplaySink: Send + Sync {
    fn update(&self, bpm: i32, channel: DisplayChannel, blink: bool);

    /// Moves the beat indicator one step forward.
    fn advance_indicator(&self) {}
}

/// Console renderer alternating a two-frame spinner on every update.
#[derive(Debug, Default)]
pub struct ConsoleSpinner {
    frame: Mutex<usize>,
}

const SPINNER: [char; 2] = ['▚', '▞'];

impl ConsoleSpinner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Formats one console line and advances the spinner.
    pub fn render_line(&self, bpm: i32, channel: DisplayChannel) -> String {
        let mut frame = self.frame.lock();
        let line = format!(
            "{}\t{:.1} BPM ({})",
            SPINNER[*frame],
            bpm as f32,
            channel.label()
        );
        *frame = (*frame + 1) % SPINNER.len();
        line
    }
}

impl DisplaySink for ConsoleSpinner {
    fn update(&self, bpm: i32, channel: DisplayChannel, _blink: bool) {
        let line = self.render_line(bpm, channel);
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

/// Latest values shown by a graphical front end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayState {
    pub live_bpm: Option<i32>,
    pub sent_bpm: Option<i32>,
    pub live_blink: bool,
    pub sent_blink: bool,
    pub indicator: u8,
    pub updates: u64,
}

/// Thread-safe display state that a GUI thread polls once per frame.
#[derive(Debug, Default)]
pub struct SharedDisplay {
    state: Mutex<DisplayState>,
}

impl SharedDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DisplayState {
        *self.state.lock()
    }
}

impl DisplaySink for SharedDisplay {
    fn update(&self, bpm: i32, channel: DisplayChannel, blink: bool) {
        let mut state = self.state.lock();
        match channel {
            DisplayChannel::Live => {
                state.live_bpm = Some(bpm);
                state.live_blink = blink;
            }
            DisplayChannel::Sent => {
                state.sent_bpm = Some(bpm);
                state.sent_blink = blink;
            }
        }
        state.updates += 1;
    }

    fn advance_indicator(&self) {
        let mut state = self.state.lock();
        state.indicator = (state.indicator + 1) % INDICATOR_STEPS;
    }
}

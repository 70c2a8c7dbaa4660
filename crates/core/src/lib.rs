//! Core library for the beat sync engine.
//!
//! Audio arrives one fixed-size buffer at a time on the capture thread. Each
//! buffer is metered, analysed for onsets and, when a beat is found, routed
//! to the operator display and to an OSC controller according to the sync
//! controls shared with the UI thread.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod display;
pub mod error;
pub mod level;
pub mod mapping;
pub mod osc;
pub mod router;
pub mod session;

pub use analysis::{BeatEvent, SpectralFluxTracker, TempoAnalyzer};
pub use audio::{
    list_input_devices, BufferCallback, CallbackFlow, CaptureConfig, CaptureDriver,
    CaptureStream, CpalDriver,
};
pub use config::{AppConfig, AudioConfig, OscConfig, SyncConfig};
pub use display::{ConsoleSpinner, DisplayChannel, DisplaySink, DisplayState, SharedDisplay};
pub use error::{BeatSyncError, Result};
pub use level::{LevelMeter, LEVEL_HISTORY_CAPACITY};
pub use mapping::{normalize_tempo, ValueMapping};
pub use osc::{OscEndpoint, OscSender, OscValue, SendOutcome};
pub use router::{
    BeatEventRouter, ControlState, OscRoutes, RouteOutcome, RouterMode, SharedControls,
};
pub use session::BeatSession;

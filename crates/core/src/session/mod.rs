//! Session lifecycle: owns the OSC socket and the capture stream.
//!
//! Resources are acquired in order (socket, then device) and released on
//! every exit path. A device that fails to open leaves no stream behind and
//! drops the socket before the error is returned.

use std::sync::Arc;

use crate::analysis::{SpectralFluxTracker, TempoAnalyzer};
use crate::audio::{CaptureConfig, CaptureDriver, CaptureStream};
use crate::config::AppConfig;
use crate::display::DisplaySink;
use crate::level::LevelMeter;
use crate::osc::{OscSender, SendOutcome};
use crate::router::{buffer_period, BeatEventRouter, OscRoutes, SharedControls};
use crate::Result;

/// A running beat-sync session.
pub struct BeatSession {
    controls: SharedControls,
    levels: Arc<LevelMeter>,
    osc: OscRoutes,
    stream: Option<Box<dyn CaptureStream>>,
}

impl BeatSession {
    /// Starts a session with the built-in spectral-flux tracker.
    pub fn start(
        config: &AppConfig,
        driver: &dyn CaptureDriver,
        display: Arc<dyn DisplaySink>,
    ) -> Result<Self> {
        let analyzer = SpectralFluxTracker::for_buffer_size(
            config.audio.buffer_size,
            config.audio.sample_rate,
        )?;
        Self::start_with_analyzer(config, driver, display, Box::new(analyzer))
    }

    /// Starts a session with a caller-provided tempo analyzer.
    pub fn start_with_analyzer(
        config: &AppConfig,
        driver: &dyn CaptureDriver,
        display: Arc<dyn DisplaySink>,
        analyzer: Box<dyn TempoAnalyzer>,
    ) -> Result<Self> {
        config.validate()?;

        let sender = Arc::new(OscSender::new(&config.osc.host, config.osc.port)?);
        let osc = OscRoutes::new(sender, &config.osc);
        let controls = SharedControls::new(config.sync.enabled, config.sync.beat_divider)?;
        let levels = Arc::new(LevelMeter::new());

        controls.set_running(true);
        let mut router = BeatEventRouter::new(
            analyzer,
            controls.clone(),
            display,
            osc.clone(),
            levels.clone(),
            buffer_period(config.audio.buffer_size, config.audio.sample_rate),
        );

        let capture = CaptureConfig::from(&config.audio);
        let stream = match driver.open(
            &capture,
            Box::new(move |buffer: &[f32]| router.process_buffer(buffer)),
        ) {
            Ok(stream) => stream,
            Err(err) => {
                controls.set_running(false);
                tracing::error!(
                    device = %capture.device_label(),
                    error = %err,
                    "session failed to start"
                );
                return Err(err);
            }
        };

        tracing::info!(
            device = %capture.device_label(),
            endpoint = %osc.sender().endpoint(),
            sync = config.sync.enabled,
            divider = config.sync.beat_divider,
            "session started"
        );

        Ok(Self {
            controls,
            levels,
            osc,
            stream: Some(stream),
        })
    }

    /// Handle for the UI thread to change sync, divider and running state.
    pub fn controls(&self) -> &SharedControls {
        &self.controls
    }

    pub fn levels(&self) -> &Arc<LevelMeter> {
        &self.levels
    }

    /// The OSC sender, for changing the destination while running.
    pub fn osc(&self) -> &Arc<OscSender> {
        self.osc.sender()
    }

    /// OSC routes bound to this session's sender, for use from other threads.
    pub fn routes(&self) -> &OscRoutes {
        &self.osc
    }

    /// Sends the resync trigger to the controller.
    pub fn resync(&self) -> SendOutcome {
        self.osc.resync()
    }

    pub fn is_running(&self) -> bool {
        self.controls.is_running()
            && self
                .stream
                .as_ref()
                .map(|stream| stream.is_active())
                .unwrap_or(false)
    }

    /// Stops routing and releases the capture stream. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        self.controls.set_running(false);
        if let Some(mut stream) = self.stream.take() {
            stream.close();
            tracing::info!("session stopped");
        }
    }
}

impl Drop for BeatSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BeatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeatSession")
            .field("controls", &self.controls.snapshot())
            .field("osc", &self.osc.sender().endpoint())
            .field("stream_open", &self.stream.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use rosc::OscType;

    use super::*;
    use crate::analysis::BeatEvent;
    use crate::audio::{BufferCallback, CallbackFlow};
    use crate::display::SharedDisplay;
    use crate::mapping::normalize_tempo;
    use crate::osc::tests::{receiver, recv_message};
    use crate::router::tests::{onset, ScriptedAnalyzer};
    use crate::BeatSyncError;

    /// Driver that hands the callback back to the test instead of a device.
    #[derive(Default)]
    struct ManualDriver {
        callback: Arc<Mutex<Option<BufferCallback>>>,
        closed: Arc<AtomicUsize>,
    }

    struct ManualStream {
        closed: Arc<AtomicUsize>,
        open: AtomicBool,
    }

    impl CaptureStream for ManualStream {
        fn close(&mut self) {
            if self.open.swap(false, Ordering::SeqCst) {
                self.closed.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_active(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    impl CaptureDriver for ManualDriver {
        fn open(
            &self,
            _config: &CaptureConfig,
            callback: BufferCallback,
        ) -> Result<Box<dyn CaptureStream>> {
            *self.callback.lock() = Some(callback);
            Ok(Box::new(ManualStream {
                closed: self.closed.clone(),
                open: AtomicBool::new(true),
            }))
        }
    }

    impl ManualDriver {
        fn feed(&self, buffer: &[f32]) -> CallbackFlow {
            let mut slot = self.callback.lock();
            let callback = slot.as_mut().expect("stream opened");
            callback(buffer)
        }
    }

    /// Driver whose device refuses to open after the callback was handed over.
    #[derive(Default)]
    struct FailingDriver {
        attempts: AtomicUsize,
    }

    impl CaptureDriver for FailingDriver {
        fn open(
            &self,
            config: &CaptureConfig,
            _callback: BufferCallback,
        ) -> Result<Box<dyn CaptureStream>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(BeatSyncError::device(
                config.device_label(),
                "no input device with this index",
            ))
        }
    }

    fn config_for(port: u16, sync: bool, divider: u32) -> AppConfig {
        let mut config = AppConfig::default();
        config.osc.port = port;
        config.sync.enabled = sync;
        config.sync.beat_divider = divider;
        config
    }

    #[test]
    fn feeds_buffers_through_the_router_to_osc() {
        let (socket, port) = receiver();
        let driver = ManualDriver::default();
        let display = Arc::new(SharedDisplay::new());
        let analyzer = ScriptedAnalyzer::new([BeatEvent::default(), onset(140.0)]);

        let session = BeatSession::start_with_analyzer(
            &config_for(port, true, 1),
            &driver,
            display.clone(),
            Box::new(analyzer),
        )
        .unwrap();

        assert_eq!(driver.feed(&[0.25; 128]), CallbackFlow::Continue);
        assert_eq!(driver.feed(&[0.25; 128]), CallbackFlow::Continue);

        let message = recv_message(&socket).expect("tempo datagram");
        assert_eq!(message.addr, AppConfig::default().osc.bpm_address);
        assert_eq!(
            message.args,
            vec![OscType::Float(normalize_tempo(140.0).unwrap())]
        );

        let state = display.snapshot();
        assert_eq!(state.live_bpm, Some(140));
        assert_eq!(state.sent_bpm, Some(140));
        assert_eq!(state.indicator, 1);
        assert_eq!(session.levels().history(), vec![50, 50]);
        assert!(session.is_running());
    }

    #[test]
    fn toggling_sync_from_another_thread_takes_effect() {
        let (socket, port) = receiver();
        let driver = ManualDriver::default();
        let display = Arc::new(SharedDisplay::new());
        let analyzer = ScriptedAnalyzer::new([onset(100.0), onset(100.0)]);

        let session = BeatSession::start_with_analyzer(
            &config_for(port, false, 1),
            &driver,
            display.clone(),
            Box::new(analyzer),
        )
        .unwrap();

        driver.feed(&[0.0; 128]);
        assert!(recv_message(&socket).is_none());
        assert_eq!(display.snapshot().sent_bpm, None);

        let controls = session.controls().clone();
        std::thread::spawn(move || controls.set_sync_enabled(true))
            .join()
            .unwrap();

        driver.feed(&[0.0; 128]);
        assert!(recv_message(&socket).is_some());
        assert_eq!(display.snapshot().sent_bpm, Some(100));
    }

    #[test]
    fn shutdown_completes_the_callback_and_closes_once() {
        let (_socket, port) = receiver();
        let driver = ManualDriver::default();
        let mut session = BeatSession::start_with_analyzer(
            &config_for(port, false, 1),
            &driver,
            Arc::new(SharedDisplay::new()),
            Box::new(ScriptedAnalyzer::new([])),
        )
        .unwrap();

        session.shutdown();
        session.shutdown();

        assert!(!session.is_running());
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
        assert_eq!(driver.feed(&[0.0; 128]), CallbackFlow::Complete);

        drop(session);
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn device_failure_reports_and_leaves_nothing_open() {
        let (socket, port) = receiver();
        let driver = FailingDriver::default();
        let display = Arc::new(SharedDisplay::new());
        let err = BeatSession::start_with_analyzer(
            &config_for(port, true, 1),
            &driver,
            display.clone(),
            Box::new(ScriptedAnalyzer::new([])),
        )
        .unwrap_err();

        // the socket was opened before the device was tried
        assert_eq!(driver.attempts.load(Ordering::SeqCst), 1);
        // router, sender and routes are gone: only the test holds the display
        assert_eq!(Arc::strong_count(&display), 1);
        assert_eq!(display.snapshot(), Default::default());
        assert!(recv_message(&socket).is_none());

        match err {
            BeatSyncError::Device { device, reason } => {
                assert_eq!(device, "default input");
                assert!(reason.contains("index"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn malformed_endpoint_fails_before_opening_the_device() {
        let driver = ManualDriver::default();
        let mut config = AppConfig::default();
        config.osc.host = String::new();

        let err = BeatSession::start_with_analyzer(
            &config,
            &driver,
            Arc::new(SharedDisplay::new()),
            Box::new(ScriptedAnalyzer::new([])),
        )
        .unwrap_err();

        assert!(matches!(err, BeatSyncError::Endpoint { .. }));
        assert!(driver.callback.lock().is_none());
        assert_eq!(driver.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_a_stopped_session_does_not_close_again() {
        let (_socket, port) = receiver();
        let driver = ManualDriver::default();
        let display = Arc::new(SharedDisplay::new());
        let mut session = BeatSession::start_with_analyzer(
            &config_for(port, false, 1),
            &driver,
            display.clone(),
            Box::new(ScriptedAnalyzer::new([])),
        )
        .unwrap();
        assert_eq!(Arc::strong_count(&display), 2);

        session.shutdown();
        drop(session);
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);

        // the stream still owns the callback; releasing it releases the router
        driver.callback.lock().take();
        assert_eq!(Arc::strong_count(&display), 1);
    }

    #[test]
    fn resync_is_available_from_the_session() {
        let (socket, port) = receiver();
        let driver = ManualDriver::default();
        let session = BeatSession::start_with_analyzer(
            &config_for(port, false, 1),
            &driver,
            Arc::new(SharedDisplay::new()),
            Box::new(ScriptedAnalyzer::new([])),
        )
        .unwrap();

        assert_eq!(session.resync(), SendOutcome::Sent);
        let message = recv_message(&socket).expect("resync datagram");
        assert_eq!(message.addr, AppConfig::default().osc.resync_address);
        assert_eq!(message.args, vec![OscType::Int(1)]);
    }
}

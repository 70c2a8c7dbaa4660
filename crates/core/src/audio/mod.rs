//! Audio capture drivers.
//!
//! A driver opens an input stream and invokes the provided callback once per
//! `buffer_size` mono samples on its own real-time thread. The callback's
//! [`CallbackFlow`] tells the driver whether to keep delivering buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, Device, SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange,
};

use crate::config::AudioConfig;
use crate::{BeatSyncError, Result};

/// Signal returned by the per-buffer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFlow {
    Continue,
    Complete,
}

/// Callback invoked with exactly `buffer_size` samples.
pub type BufferCallback = Box<dyn FnMut(&[f32]) -> CallbackFlow + Send + 'static>;

/// Parameters for opening a capture stream. `channels` is the preferred
/// device channel count; the driver downmixes whatever it negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_size: usize,
    pub device_index: Option<usize>,
}

impl From<&AudioConfig> for CaptureConfig {
    fn from(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: 1,
            buffer_size: config.buffer_size,
            device_index: config.device_index,
        }
    }
}

impl CaptureConfig {
    /// Human readable device label for error messages.
    pub fn device_label(&self) -> String {
        match self.device_index {
            Some(index) => format!("#{index}"),
            None => "default input".to_string(),
        }
    }
}

/// An open capture stream. Closing is idempotent.
pub trait CaptureStream {
    fn close(&mut self);

    fn is_active(&self) -> bool;
}

/// Opens capture streams.
pub trait CaptureDriver {
    fn open(&self, config: &CaptureConfig, callback: BufferCallback)
        -> Result<Box<dyn CaptureStream>>;
}

/// Accumulates host-sized chunks of interleaved audio into fixed mono blocks.
pub struct Reblocker {
    channels: usize,
    block: Vec<f32>,
    filled: usize,
    callback: BufferCallback,
    finished: Arc<AtomicBool>,
}

impl Reblocker {
    pub fn new(
        channels: usize,
        buffer_size: usize,
        callback: BufferCallback,
        finished: Arc<AtomicBool>,
    ) -> Self {
        Self {
            channels: channels.max(1),
            block: vec![0.0; buffer_size.max(1)],
            filled: 0,
            callback,
            finished,
        }
    }

    /// Feeds interleaved frames. Stops delivering once the callback completes.
    pub fn push_interleaved(&mut self, data: &[f32]) {
        for frame in data.chunks(self.channels) {
            if self.finished.load(Ordering::Acquire) {
                return;
            }
            let sum: f32 = frame.iter().sum();
            self.block[self.filled] = sum / frame.len() as f32;
            self.filled += 1;

            if self.filled == self.block.len() {
                self.filled = 0;
                if (self.callback)(&self.block) == CallbackFlow::Complete {
                    self.finished.store(true, Ordering::Release);
                }
            }
        }
    }
}

/// Driver backed by the default `cpal` host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDriver;

impl CpalDriver {
    pub fn new() -> Self {
        Self
    }

    fn select_device(&self, config: &CaptureConfig) -> Result<Device> {
        let host = cpal::default_host();
        let label = config.device_label();
        match config.device_index {
            Some(index) => host
                .input_devices()
                .map_err(|err| BeatSyncError::device(&label, err))?
                .nth(index)
                .ok_or_else(|| BeatSyncError::device(&label, "no input device with this index")),
            None => host
                .default_input_device()
                .ok_or_else(|| BeatSyncError::device(&label, "no default input device")),
        }
    }
}

/// Names of the host's input devices, in index order.
pub fn list_input_devices() -> Result<Vec<(usize, String)>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|err| BeatSyncError::msg(format!("failed to enumerate input devices: {err}")))?;
    Ok(devices
        .enumerate()
        .map(|(index, device)| {
            let name = device.name().unwrap_or_else(|_| "<unnamed>".to_string());
            (index, name)
        })
        .collect())
}

impl CaptureDriver for CpalDriver {
    fn open(
        &self,
        config: &CaptureConfig,
        callback: BufferCallback,
    ) -> Result<Box<dyn CaptureStream>> {
        let label = config.device_label();
        let device = self.select_device(config)?;
        let name = device.name().unwrap_or_else(|_| label.clone());
        let (stream_config, format) = negotiate(&device, config)
            .map_err(|reason| BeatSyncError::device(&name, reason))?;
        if stream_config.sample_rate.0 != config.sample_rate {
            tracing::warn!(
                device = %name,
                requested = config.sample_rate,
                negotiated = stream_config.sample_rate.0,
                "device does not support the requested sample rate, tempo estimates will be scaled"
            );
        }

        let finished = Arc::new(AtomicBool::new(false));
        let reblocker = Reblocker::new(
            usize::from(stream_config.channels),
            config.buffer_size,
            callback,
            finished.clone(),
        );

        let stream = match format {
            SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, reblocker),
            SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, reblocker),
            SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, reblocker),
            other => {
                return Err(BeatSyncError::device(
                    &name,
                    format!("unsupported sample format {other:?}"),
                ))
            }
        }
        .map_err(|err| BeatSyncError::device(&name, err))?;

        stream
            .play()
            .map_err(|err| BeatSyncError::device(&name, err))?;

        tracing::info!(
            device = %name,
            sample_rate = stream_config.sample_rate.0,
            channels = stream_config.channels,
            buffer_size = config.buffer_size,
            "audio capture started"
        );

        Ok(Box::new(CpalStream {
            stream: Some(stream),
            finished,
            name,
        }))
    }
}

/// Picks a stream config the device actually supports, falling back to the
/// device default when it reports no usable ranges.
fn negotiate(
    device: &Device,
    config: &CaptureConfig,
) -> std::result::Result<(StreamConfig, SampleFormat), String> {
    let ranges = device
        .supported_input_configs()
        .map(|ranges| ranges.collect::<Vec<_>>())
        .unwrap_or_default();
    if let Some(chosen) = choose_stream_config(ranges, config) {
        return Ok(chosen);
    }

    let fallback = device
        .default_input_config()
        .map_err(|err| err.to_string())?;
    let format = fallback.sample_format();
    let mut stream_config = fallback.config();
    stream_config.buffer_size = BufferSize::Default;
    Ok((stream_config, format))
}

/// Chooses among the supported ranges: a sample format we can convert, then
/// the sample rate closest to the requested one, then the channel count
/// closest to the preferred one. The host picks the period size; blocks of
/// exactly `buffer_size` are cut by [`Reblocker`].
pub(crate) fn choose_stream_config(
    ranges: impl IntoIterator<Item = SupportedStreamConfigRange>,
    config: &CaptureConfig,
) -> Option<(StreamConfig, SampleFormat)> {
    let chosen = ranges
        .into_iter()
        .filter(|range| range.channels() != 0 && is_convertible(range.sample_format()))
        .min_by(|l, r| {
            rate_distance(l, config.sample_rate)
                .cmp(&rate_distance(r, config.sample_rate))
                .then_with(|| channel_distance(l, config).cmp(&channel_distance(r, config)))
                .then_with(|| format_rank(l.sample_format()).cmp(&format_rank(r.sample_format())))
        })?;

    let sample_rate = config
        .sample_rate
        .clamp(chosen.min_sample_rate().0, chosen.max_sample_rate().0);
    Some((
        StreamConfig {
            channels: chosen.channels(),
            sample_rate: SampleRate(sample_rate),
            buffer_size: BufferSize::Default,
        },
        chosen.sample_format(),
    ))
}

fn rate_distance(range: &SupportedStreamConfigRange, sample_rate: u32) -> u32 {
    sample_rate
        .clamp(range.min_sample_rate().0, range.max_sample_rate().0)
        .abs_diff(sample_rate)
}

fn channel_distance(range: &SupportedStreamConfigRange, config: &CaptureConfig) -> u16 {
    range.channels().abs_diff(config.channels.max(1))
}

fn is_convertible(format: SampleFormat) -> bool {
    matches!(format, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16)
}

fn format_rank(format: SampleFormat) -> u8 {
    match format {
        SampleFormat::F32 => 0,
        SampleFormat::I16 => 1,
        _ => 2,
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut reblocker: Reblocker,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::Sample + cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let mut converted: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            converted.clear();
            converted.extend(data.iter().map(|sample| <f32 as cpal::Sample>::from_sample(*sample)));
            reblocker.push_interleaved(&converted);
        },
        |err| {
            tracing::error!(error = %err, "audio stream error");
        },
        None,
    )
}

struct CpalStream {
    stream: Option<cpal::Stream>,
    finished: Arc<AtomicBool>,
    name: String,
}

impl CaptureStream for CpalStream {
    fn close(&mut self) {
        self.finished.store(true, Ordering::Release);
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.pause() {
                tracing::debug!(device = %self.name, error = %err, "failed to pause stream");
            }
            drop(stream);
            tracing::info!(device = %self.name, "audio capture closed");
        }
    }

    fn is_active(&self) -> bool {
        self.stream.is_some() && !self.finished.load(Ordering::Acquire)
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.close();
    }
}

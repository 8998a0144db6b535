//! Host audio devices.
//!
//! The session talks to the microphone and speakers only through the traits
//! here, so that it can be driven by in-memory devices in tests. [`CpalDevices`]
//! binds them to the default `cpal` host.
//!
//! Device callbacks run on audio threads. The input callback only pushes into a
//! lock-free ring buffer; the output callback only locks the shared scheduler
//! for the duration of one render.

use crate::codec::PLAYBACK_SAMPLE_RATE;
use crate::playback::{self, SharedScheduler};
use cpal::{
    FromSample, Sample, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use tracing::{debug, error, info, warn};

/// Seconds of microphone audio buffered between polls.
const CAPTURE_BUFFER_SECS: usize = 2;
const DRAIN_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no input device available")]
    NoInputDevice,
    #[error("no output device available")]
    NoOutputDevice,
    #[error("failed to query device configuration: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),
    #[error("failed to enumerate device configurations: {0}")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),
    #[error("unsupported sample format: {0:?}")]
    UnsupportedFormat(cpal::SampleFormat),
    #[error("failed to build audio stream: {0}")]
    Build(#[from] cpal::BuildStreamError),
    #[error("failed to start audio stream: {0}")]
    Play(#[from] cpal::PlayStreamError),
    #[error("failed to pause audio stream: {0}")]
    Pause(#[from] cpal::PauseStreamError),
}

/// A granted microphone.
pub trait MicrophoneStream {
    /// Native rate of the samples handed out by [`drain_into`](Self::drain_into).
    fn sample_rate(&self) -> u32;

    /// Starts (or restarts) delivering audio, discarding anything stale.
    fn resume(&mut self) -> Result<(), DeviceError>;

    /// Appends every mono sample captured since the last call. Returns the count.
    fn drain_into(&mut self, out: &mut Vec<f32>) -> usize;

    /// Stops the device and gives it back to the system. Idempotent.
    fn release(&mut self) -> Result<(), DeviceError>;
}

/// An open speaker output rendering a [`PlaybackScheduler`](crate::playback::PlaybackScheduler).
pub trait OutputContext {
    fn sample_rate(&self) -> u32;

    fn scheduler(&self) -> SharedScheduler;

    /// Disconnects the scheduler from the device; nothing more is rendered.
    fn suspend(&mut self) -> Result<(), DeviceError>;

    /// Releases the output device. Idempotent.
    fn close(&mut self) -> Result<(), DeviceError>;
}

pub trait AudioDevices {
    fn acquire_microphone(&mut self) -> Result<Box<dyn MicrophoneStream>, DeviceError>;

    fn open_output(&mut self) -> Result<Box<dyn OutputContext>, DeviceError>;
}

/// Devices of the default `cpal` host.
pub struct CpalDevices {
    host: cpal::Host,
}

impl CpalDevices {
    pub fn new() -> Self {
        let host = cpal::default_host();
        debug!(host = ?host.id(), "Using audio host");
        Self { host }
    }
}

impl Default for CpalDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevices for CpalDevices {
    fn acquire_microphone(&mut self) -> Result<Box<dyn MicrophoneStream>, DeviceError> {
        let device = self
            .host
            .default_input_device()
            .ok_or(DeviceError::NoInputDevice)?;
        let supported = device.default_input_config()?;
        let config: cpal::StreamConfig = supported.config();
        let sample_rate = config.sample_rate.0;
        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".into()),
            sample_rate,
            channels = config.channels,
            format = ?supported.sample_format(),
            "Microphone acquired"
        );

        let ring = HeapRb::<f32>::new(sample_rate as usize * CAPTURE_BUFFER_SECS);
        let (producer, consumer) = ring.split();
        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, producer)?,
            cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, producer)?,
            cpal::SampleFormat::U16 => build_input::<u16>(&device, &config, producer)?,
            other => return Err(DeviceError::UnsupportedFormat(other)),
        };

        Ok(Box::new(CpalMicrophone {
            stream: Some(stream),
            consumer,
            sample_rate,
            scratch: vec![0.0; DRAIN_CHUNK],
        }))
    }

    fn open_output(&mut self) -> Result<Box<dyn OutputContext>, DeviceError> {
        let device = self
            .host
            .default_output_device()
            .ok_or(DeviceError::NoOutputDevice)?;

        // Render at the model's native rate when the device allows it.
        let native = device
            .supported_output_configs()?
            .find(|range| {
                range.min_sample_rate().0 <= PLAYBACK_SAMPLE_RATE
                    && range.max_sample_rate().0 >= PLAYBACK_SAMPLE_RATE
            })
            .map(|range| range.with_sample_rate(cpal::SampleRate(PLAYBACK_SAMPLE_RATE)));
        let supported = match native {
            Some(supported) => supported,
            None => device.default_output_config()?,
        };
        let config: cpal::StreamConfig = supported.config();
        let sample_rate = config.sample_rate.0;

        let scheduler = playback::shared(sample_rate);
        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, scheduler.clone())?,
            cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, scheduler.clone())?,
            cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, scheduler.clone())?,
            other => return Err(DeviceError::UnsupportedFormat(other)),
        };
        stream.play()?;
        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".into()),
            sample_rate,
            channels = config.channels,
            "Audio output opened"
        );

        Ok(Box::new(CpalOutput {
            stream: Some(stream),
            scheduler,
            sample_rate,
        }))
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: HeapProd<f32>,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            mono.clear();
            mono.extend(data.chunks_exact(channels).map(|frame| {
                frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / channels as f32
            }));
            let pushed = producer.push_slice(&mono);
            if pushed < mono.len() {
                debug!(dropped = mono.len() - pushed, "Capture buffer full");
            }
        },
        |err| error!(error = %err, "Audio input stream error"),
        None,
    )?;
    Ok(stream)
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    scheduler: SharedScheduler,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            mono.resize(data.len() / channels, 0.0);
            playback::lock(&scheduler).render(&mut mono);
            for (frame, sample) in data.chunks_exact_mut(channels).zip(&mono) {
                frame.fill(T::from_sample(*sample));
            }
        },
        |err| error!(error = %err, "Audio output stream error"),
        None,
    )?;
    Ok(stream)
}

struct CpalMicrophone {
    stream: Option<cpal::Stream>,
    consumer: HeapCons<f32>,
    sample_rate: u32,
    scratch: Vec<f32>,
}

impl MicrophoneStream for CpalMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        if self.stream.is_none() {
            warn!("Microphone already released; not resuming");
            return Ok(());
        }
        let discarded = self.drain_into(&mut Vec::new());
        if let Some(stream) = &self.stream {
            stream.play()?;
        }
        debug!(discarded, "Microphone streaming");
        Ok(())
    }

    fn drain_into(&mut self, out: &mut Vec<f32>) -> usize {
        let mut total = 0;
        loop {
            let read = self.consumer.pop_slice(&mut self.scratch);
            if read == 0 {
                break;
            }
            out.extend_from_slice(&self.scratch[..read]);
            total += read;
        }
        total
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        let paused = stream.pause();
        drop(stream);
        info!("Microphone released");
        paused.map_err(DeviceError::from)
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "Failed to release microphone");
        }
    }
}

struct CpalOutput {
    stream: Option<cpal::Stream>,
    scheduler: SharedScheduler,
    sample_rate: u32,
}

impl OutputContext for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn scheduler(&self) -> SharedScheduler {
        self.scheduler.clone()
    }

    fn suspend(&mut self) -> Result<(), DeviceError> {
        if let Some(stream) = &self.stream {
            stream.pause()?;
            debug!("Audio output suspended");
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.stream.take().is_some() {
            info!("Audio output closed");
        }
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

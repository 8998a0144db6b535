//! Microphone capture pipeline.
//!
//! Turns the microphone's native-rate mono samples into fixed 4096-sample
//! frames at 16 kHz, meters each frame's loudness, and forwards it to a
//! [`FrameSink`] unless the session is muted. The 16 kHz capture clock is
//! independent of the playback clock.

use crate::codec::{self, CAPTURE_SAMPLE_RATE, StreamResampler};
use gemini_live::Transport;
use tracing::{debug, info};

/// Samples per captured frame (~256ms at 16kHz).
pub const FRAME_SAMPLES: usize = 4096;
pub const DEFAULT_VOLUME_SCALE: f32 = 5000.0;
pub const DEFAULT_VOLUME_CEILING: f32 = 100.0;

/// One block of 16 kHz mono samples, consumed once by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        CAPTURE_SAMPLE_RATE
    }

    /// Little-endian PCM16 bytes for the wire.
    pub fn encode(&self) -> Vec<u8> {
        codec::encode(&self.samples)
    }

    pub fn mean_abs(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.abs()).sum::<f32>() / self.samples.len() as f32
    }
}

/// Loudness estimate for user feedback: `min(ceiling, mean|x| * scale)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeMeter {
    pub scale: f32,
    pub ceiling: f32,
}

impl VolumeMeter {
    pub fn measure(&self, frame: &AudioFrame) -> f32 {
        (frame.mean_abs() * self.scale).min(self.ceiling)
    }
}

impl Default for VolumeMeter {
    fn default() -> Self {
        Self {
            scale: DEFAULT_VOLUME_SCALE,
            ceiling: DEFAULT_VOLUME_CEILING,
        }
    }
}

/// Receives frames the pipeline decided to forward.
#[cfg_attr(test, mockall::automock)]
pub trait FrameSink {
    /// Returns whether the frame was accepted.
    fn send_frame(&mut self, frame: &AudioFrame) -> bool;
}

impl FrameSink for Transport {
    fn send_frame(&mut self, frame: &AudioFrame) -> bool {
        self.send_audio(&frame.encode())
    }
}

pub struct CapturePipeline {
    resampler: StreamResampler,
    pending: Vec<f32>,
    meter: VolumeMeter,
    muted: bool,
    volume: f32,
    running: bool,
    forwarded: u64,
}

impl CapturePipeline {
    /// Starts framing a microphone stream delivered at `device_rate`.
    pub fn start(device_rate: u32, meter: VolumeMeter) -> anyhow::Result<Self> {
        let resampler = StreamResampler::new(device_rate, CAPTURE_SAMPLE_RATE)?;
        info!(device_rate, frame_samples = FRAME_SAMPLES, "Capture pipeline started");
        Ok(Self {
            resampler,
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
            meter,
            muted: false,
            volume: 0.0,
            running: true,
            forwarded: 0,
        })
    }

    /// Feeds native-rate mono samples and returns every frame completed by them.
    pub fn push_samples(&mut self, mono: &[f32]) -> Vec<AudioFrame> {
        if !self.running {
            return Vec::new();
        }
        self.resampler.process(mono, &mut self.pending);
        let mut frames = Vec::with_capacity(self.pending.len() / FRAME_SAMPLES);
        while self.pending.len() >= FRAME_SAMPLES {
            frames.push(AudioFrame::new(self.pending.drain(..FRAME_SAMPLES).collect()));
        }
        frames
    }

    /// Meters one frame and forwards it unless muted. Returns whether it was forwarded.
    pub fn on_frame(&mut self, frame: &AudioFrame, sink: &mut dyn FrameSink) -> bool {
        if !self.running {
            return false;
        }
        self.volume = self.meter.measure(frame);
        if self.muted {
            return false;
        }
        let accepted = sink.send_frame(frame);
        if accepted {
            self.forwarded += 1;
        }
        accepted
    }

    /// Runs [`push_samples`](Self::push_samples) and [`on_frame`](Self::on_frame)
    /// for a batch of samples. Returns the number of frames forwarded.
    pub fn process(&mut self, mono: &[f32], sink: &mut dyn FrameSink) -> usize {
        let mut forwarded = 0;
        for frame in self.push_samples(mono) {
            if self.on_frame(&frame, sink) {
                forwarded += 1;
            }
        }
        forwarded
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn frames_forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Detaches from the stream and drops any partially assembled frame. Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.pending.clear();
        self.resampler.reset();
        self.volume = 0.0;
        debug!(forwarded = self.forwarded, "Capture pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn pipeline() -> CapturePipeline {
        CapturePipeline::start(CAPTURE_SAMPLE_RATE, VolumeMeter::default()).unwrap()
    }

    #[test]
    fn test_frames_are_fixed_size() {
        let mut capture = pipeline();

        assert!(capture.push_samples(&[0.0; 4000]).is_empty());
        let frames = capture.push_samples(&[0.0; 4300]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.samples().len() == FRAME_SAMPLES));
        assert_eq!(frames[0].sample_rate(), 16000);
    }

    #[test]
    fn test_volume_is_scaled_and_clamped() {
        let meter = VolumeMeter::default();
        assert_abs_diff_eq!(meter.measure(&AudioFrame::new(vec![0.01; 8])), 50.0, epsilon = 1e-3);
        assert_eq!(meter.measure(&AudioFrame::new(vec![-0.5; 8])), 100.0);
        assert_eq!(meter.measure(&AudioFrame::new(vec![])), 0.0);

        let custom = VolumeMeter {
            scale: 100.0,
            ceiling: 10.0,
        };
        assert_abs_diff_eq!(custom.measure(&AudioFrame::new(vec![0.05; 4])), 5.0, epsilon = 1e-4);
    }

    #[test]
    fn test_muted_frames_are_never_forwarded() {
        let mut capture = pipeline();
        let mut sink = MockFrameSink::new();

        sink.expect_send_frame().never();
        capture.set_muted(true);
        for _ in 0..3 {
            assert_eq!(capture.process(&[0.0; FRAME_SAMPLES], &mut sink), 0);
        }
        sink.checkpoint();

        sink.expect_send_frame().times(1).return_const(true);
        capture.set_muted(false);
        assert_eq!(capture.process(&[0.0; FRAME_SAMPLES], &mut sink), 1);
        assert_eq!(capture.frames_forwarded(), 1);
    }

    #[test]
    fn test_muted_frames_still_update_volume() {
        let mut capture = pipeline();
        let mut sink = MockFrameSink::new();
        sink.expect_send_frame().never();

        capture.set_muted(true);
        capture.process(&[0.01; FRAME_SAMPLES], &mut sink);
        assert_abs_diff_eq!(capture.volume(), 50.0, epsilon = 0.1);
    }

    #[test]
    fn test_rejected_frames_are_not_counted() {
        let mut capture = pipeline();
        let mut sink = MockFrameSink::new();
        sink.expect_send_frame().times(2).return_const(false);

        assert_eq!(capture.process(&[0.0; FRAME_SAMPLES * 2], &mut sink), 0);
        assert_eq!(capture.frames_forwarded(), 0);
    }

    #[test]
    fn test_forwarded_frame_reaches_transport_as_pcm() {
        let (mut transport, _inbound, mut remote) = gemini_live::transport::loopback();
        remote.acknowledge();
        let mut capture = pipeline();

        assert_eq!(capture.process(&[0.5; FRAME_SAMPLES], &mut transport), 1);
        let expected = gemini_live::protocol::realtime_audio(&codec::encode(&[0.5; FRAME_SAMPLES]));
        assert_eq!(remote.outbound.try_recv().unwrap(), expected);
    }

    #[test]
    fn test_stop_is_idempotent_and_final() {
        let mut capture = pipeline();
        capture.push_samples(&[0.0; 100]);

        capture.stop();
        capture.stop();
        assert!(!capture.is_running());
        assert!(capture.push_samples(&[0.0; FRAME_SAMPLES]).is_empty());

        let mut sink = MockFrameSink::new();
        sink.expect_send_frame().never();
        assert!(!capture.on_frame(&AudioFrame::new(vec![0.0; FRAME_SAMPLES]), &mut sink));
    }

    #[test]
    fn test_native_rate_is_resampled_to_capture_rate() {
        let mut capture = CapturePipeline::start(48000, VolumeMeter::default()).unwrap();
        // Two seconds of 48kHz input yield seven full 16kHz frames.
        let frames: usize = (0..200).map(|_| capture.push_samples(&[0.0; 480]).len()).sum();
        assert_eq!(frames, 7);
    }
}

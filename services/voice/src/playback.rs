//! Gapless, interruptible playback of model speech.
//!
//! Decoded buffers are placed back to back on the output clock. The clock is
//! the number of frames the output device has rendered, so scheduling stays
//! correct even when the device pulls audio in irregular bursts.

use crate::codec::AudioBuffer;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// A decoded buffer placed on the output clock.
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub id: u64,
    /// Scheduled start in seconds on the output clock.
    pub start_time: f64,
    start_frame: u64,
    buffer: AudioBuffer,
}

impl PlaybackUnit {
    pub fn start_frame(&self) -> u64 {
        self.start_frame
    }

    /// First frame after the unit.
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.len() as u64
    }

    pub fn duration(&self) -> f64 {
        self.buffer.duration()
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration()
    }
}

pub struct PlaybackScheduler {
    sample_rate: u32,
    rendered_frames: u64,
    next_start_time: f64,
    live: Vec<PlaybackUnit>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            rendered_frames: 0,
            next_start_time: 0.0,
            live: Vec::new(),
            next_id: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seconds rendered so far by the output device.
    pub fn current_time(&self) -> f64 {
        self.rendered_frames as f64 / self.sample_rate as f64
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn live_units(&self) -> &[PlaybackUnit] {
        &self.live
    }

    pub fn is_idle(&self) -> bool {
        self.live.is_empty()
    }

    /// Schedules `buffer` right after everything already queued, or now if the
    /// queue has drained. Returns the start time.
    pub fn enqueue(&mut self, buffer: AudioBuffer) -> f64 {
        let now = self.current_time();
        if self.next_start_time < now {
            self.next_start_time = now;
        }
        let start_time = self.next_start_time;
        // Frames are the authority for mixing; rounding keeps consecutive units
        // contiguous rather than overlapping by a fraction of a sample.
        let start_frame = (start_time * self.sample_rate as f64).round() as u64;
        let start_frame = start_frame.max(self.live.last().map_or(0, PlaybackUnit::end_frame));
        self.next_start_time += buffer.duration();

        let id = self.next_id;
        self.next_id += 1;
        debug!(
            id,
            start_time,
            duration = buffer.duration(),
            "Scheduled playback unit"
        );
        self.live.push(PlaybackUnit {
            id,
            start_time,
            start_frame,
            buffer,
        });
        start_time
    }

    /// Stops every scheduled unit and rewinds the queue. Returns how many were
    /// stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.live.len();
        self.live.clear();
        self.next_start_time = 0.0;
        if stopped > 0 {
            info!(stopped, "Playback interrupted");
        }
        stopped
    }

    /// Mixes the live units into `out` (mono) and advances the clock by
    /// `out.len()` frames. Finished units are dropped.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let window_start = self.rendered_frames;
        let window_end = window_start + out.len() as u64;

        for unit in &self.live {
            if unit.start_frame >= window_end || unit.end_frame() <= window_start {
                continue;
            }
            let from = unit.start_frame.max(window_start);
            let to = unit.end_frame().min(window_end);
            let src = &unit.buffer.samples()
                [(from - unit.start_frame) as usize..(to - unit.start_frame) as usize];
            let dst = &mut out[(from - window_start) as usize..(to - window_start) as usize];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
        }

        self.rendered_frames = window_end;
        self.live.retain(|unit| unit.end_frame() > window_end);
    }
}

/// Scheduler shared between the session and the output device callback.
pub type SharedScheduler = Arc<Mutex<PlaybackScheduler>>;

pub fn shared(sample_rate: u32) -> SharedScheduler {
    Arc::new(Mutex::new(PlaybackScheduler::new(sample_rate)))
}

/// Locks the scheduler, recovering it if an audio callback panicked mid-render.
pub fn lock(scheduler: &SharedScheduler) -> MutexGuard<'_, PlaybackScheduler> {
    scheduler
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, warn};

// Define standard sample rates for clarity and consistency
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000; // Gemini Live expects 16kHz mono input
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000; // Gemini Live speaks 24kHz mono output

const STREAM_CHUNK_FRAMES: usize = 512;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecodeError {
    #[error("audio chunk is empty")]
    Empty,
    #[error("audio chunk is truncated ({0} bytes is not a whole number of samples)")]
    Truncated(usize),
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("resampling failed: {0}")]
    Resample(String),
}

/// Mono floating-point samples at a known rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Maps one sample in `[-1, 1]` to 16-bit PCM.
///
/// The positive range scales by 32767 and the negative range by 32768 so that
/// both ends are reachable without overflow. Out-of-range input is clamped and
/// NaN encodes as silence.
pub fn encode_sample(sample: f32) -> i16 {
    let s = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Exact inverse of [`encode_sample`].
pub fn decode_sample(value: i16) -> f32 {
    if value < 0 {
        value as f32 / 32768.0
    } else {
        value as f32 / 32767.0
    }
}

/// Encodes samples as little-endian 16-bit PCM.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| encode_sample(s).to_le_bytes())
        .collect()
}

/// Reads the source sample rate from a chunk's MIME type.
///
/// Accepts `audio/pcm` and `audio/l16`, with an optional `rate=` parameter.
/// A missing MIME type or rate means the 24 kHz the model speaks at.
pub fn pcm_rate_from_mime(mime_type: Option<&str>) -> Result<u32, DecodeError> {
    let Some(mime) = mime_type else {
        return Ok(PLAYBACK_SAMPLE_RATE);
    };
    let mut params = mime.split(';').map(str::trim);
    let essence = params.next().unwrap_or_default().to_ascii_lowercase();
    if essence != "audio/pcm" && essence != "audio/l16" {
        return Err(DecodeError::UnsupportedFormat(mime.to_string()));
    }
    for param in params {
        if let Some(rate) = param.strip_prefix("rate=") {
            return rate
                .parse::<u32>()
                .ok()
                .filter(|r| *r > 0)
                .ok_or_else(|| DecodeError::UnsupportedFormat(mime.to_string()));
        }
    }
    Ok(PLAYBACK_SAMPLE_RATE)
}

/// Decodes one inbound PCM16 chunk into a playable buffer at `output_rate`.
///
/// The chunk is resampled on its own. For a stream of chunks use
/// [`PlaybackDecoder`], which keeps the resampler state between them.
/// A failure here concerns this chunk only; callers drop it and carry on.
pub fn decode(
    bytes: &[u8],
    mime_type: Option<&str>,
    output_rate: u32,
) -> Result<AudioBuffer, DecodeError> {
    let samples = pcm_samples(bytes)?;
    let source_rate = pcm_rate_from_mime(mime_type)?;
    let samples = resample(samples, source_rate, output_rate)?;
    Ok(AudioBuffer::new(samples, output_rate))
}

fn pcm_samples(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::Truncated(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| decode_sample(i16::from_le_bytes([c[0], c[1]])))
        .collect())
}

/// Resamples a whole buffer in one pass.
pub fn resample(samples: Vec<f32>, from: u32, to: u32) -> Result<Vec<f32>, DecodeError> {
    if from == to || samples.is_empty() {
        return Ok(samples);
    }
    let mut resampler = create_resampler(from as f64, to as f64, samples.len())
        .map_err(|e| DecodeError::Resample(e.to_string()))?;
    let mut out = resampler
        .process(&[samples], None)
        .map_err(|e| DecodeError::Resample(e.to_string()))?;
    Ok(out.pop().unwrap_or_default())
}

/// Averages interleaved frames down to mono.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Incremental resampler for a continuous mono stream.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    ratio: f64,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from: u32, to: u32) -> anyhow::Result<Self> {
        let resampler = if from == to {
            None
        } else {
            Some(create_resampler(from as f64, to as f64, STREAM_CHUNK_FRAMES)?)
        };
        Ok(Self {
            resampler,
            ratio: to as f64 / from as f64,
            pending: Vec::new(),
        })
    }

    /// Appends the resampled form of `input` to `out`. Input shorter than one
    /// resampler chunk is held back until more arrives.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let Some(resampler) = self.resampler.as_mut() else {
            out.extend_from_slice(input);
            return;
        };
        self.pending.extend_from_slice(input);
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(res) => out.extend_from_slice(&res[0]),
                Err(e) => warn!(error = %e, "Dropping audio chunk that failed to resample"),
            }
        }
    }

    /// Emits the held-back input and the resampler's delay line, then starts
    /// over as if newly created.
    pub fn flush(&mut self, out: &mut Vec<f32>) {
        let Some(resampler) = self.resampler.as_mut() else {
            return;
        };
        if !self.pending.is_empty() {
            let expected =
                (self.pending.len() as f64 * self.ratio).ceil() as usize + resampler.output_delay();
            let wave = [std::mem::take(&mut self.pending)];
            match resampler.process_partial(Some(&wave[..]), None) {
                Ok(mut res) => {
                    let mut tail = res.swap_remove(0);
                    // The rest is the zero padding of the last partial chunk.
                    tail.truncate(expected);
                    out.extend_from_slice(&tail);
                }
                Err(e) => warn!(error = %e, "Dropping audio tail that failed to resample"),
            }
        }
        resampler.reset();
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

/// Decodes the model's speech as one continuous stream at the output rate.
///
/// Unlike [`decode`], the resampler keeps its filter state from one chunk to
/// the next, so chunk boundaries do not produce audible discontinuities. A
/// chunk's tail may be held back until the next chunk or [`flush`](Self::flush).
pub struct PlaybackDecoder {
    source_rate: u32,
    output_rate: u32,
    resampler: StreamResampler,
}

impl PlaybackDecoder {
    pub fn new(output_rate: u32) -> Result<Self, DecodeError> {
        Self::with_source_rate(PLAYBACK_SAMPLE_RATE, output_rate)
    }

    fn with_source_rate(source_rate: u32, output_rate: u32) -> Result<Self, DecodeError> {
        let resampler = StreamResampler::new(source_rate, output_rate)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;
        Ok(Self {
            source_rate,
            output_rate,
            resampler,
        })
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Decodes one chunk and returns whatever output is ready, possibly none.
    pub fn decode(
        &mut self,
        bytes: &[u8],
        mime_type: Option<&str>,
    ) -> Result<AudioBuffer, DecodeError> {
        let samples = pcm_samples(bytes)?;
        let source_rate = pcm_rate_from_mime(mime_type)?;
        let mut out = Vec::new();
        if source_rate != self.source_rate {
            debug!(
                from = self.source_rate,
                to = source_rate,
                "Playback source rate changed"
            );
            self.resampler.flush(&mut out);
            *self = Self::with_source_rate(source_rate, self.output_rate)?;
        }
        self.resampler.process(&samples, &mut out);
        Ok(AudioBuffer::new(out, self.output_rate))
    }

    /// Returns the held-back end of the stream, e.g. when a turn completes.
    pub fn flush(&mut self) -> AudioBuffer {
        let mut out = Vec::new();
        self.resampler.flush(&mut out);
        AudioBuffer::new(out, self.output_rate)
    }

    /// Discards held-back audio, e.g. when the agent is interrupted.
    pub fn reset(&mut self) {
        self.resampler.reset();
    }
}

use rubato::{FftFixedIn, Resampler as RubatoResampler};

use crate::{AudioError, Result};

/// Chunk size fed to the FFT resampler. Small enough for low latency,
/// large enough to amortize the transform.
const RESAMPLER_CHUNK: usize = 256;

/// Stateful mono resampler buffering variable-size PCM16 input.
///
/// Samples that do not fill a whole FFT chunk are retained across calls;
/// [`StreamResampler::flush`] zero-pads and drains the tail so no audio is
/// lost when the source detaches.
pub struct StreamResampler {
    resampler: FftFixedIn<f32>,
    input_buffer: Vec<f32>,
    from_rate: u32,
    to_rate: u32,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let resampler = FftFixedIn::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            RESAMPLER_CHUNK,
            2, // sub-chunks for better quality
            1, // mono
        )
        .map_err(|e| AudioError::Resample(e.to_string()))?;

        Ok(Self {
            resampler,
            input_buffer: Vec::with_capacity(RESAMPLER_CHUNK * 2),
            from_rate,
            to_rate,
        })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Feed input samples; returns whatever full chunks produced.
    pub fn push(&mut self, samples: &[i16]) -> Vec<i16> {
        self.input_buffer
            .extend(samples.iter().map(|&s| s as f32 / 32768.0));

        let mut output = Vec::new();
        while self.input_buffer.len() >= RESAMPLER_CHUNK {
            let chunk: Vec<f32> = self.input_buffer.drain(..RESAMPLER_CHUNK).collect();
            match self.resampler.process(&[chunk], None) {
                Ok(resampled) => {
                    if let Some(channel) = resampled.first() {
                        output.extend(channel.iter().map(to_i16));
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "resampler chunk failed, dropping");
                }
            }
        }
        output
    }

    /// Zero-pad the retained tail to a chunk boundary and drain it.
    pub fn flush(&mut self) -> Vec<i16> {
        if self.input_buffer.is_empty() {
            return Vec::new();
        }
        self.input_buffer.resize(RESAMPLER_CHUNK, 0.0);
        let chunk: Vec<f32> = self.input_buffer.drain(..).collect();
        match self.resampler.process(&[chunk], None) {
            Ok(resampled) => resampled
                .first()
                .map(|channel| channel.iter().map(to_i16).collect())
                .unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "resampler flush failed");
                Vec::new()
            }
        }
    }
}

fn to_i16(sample: &f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

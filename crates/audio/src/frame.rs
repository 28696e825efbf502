use std::sync::Arc;
use std::time::Duration;

/// An immutable chunk of interleaved PCM16 audio.
///
/// Samples are shared behind an `Arc` so a frame can fan out to several
/// consumers without copying.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    data: Arc<[i16]>,
    sample_rate: u32,
    num_channels: u32,
    samples_per_channel: usize,
}

impl AudioFrame {
    /// Create a frame. The sample buffer length must equal
    /// `samples_per_channel * num_channels`.
    pub fn new(data: impl Into<Arc<[i16]>>, sample_rate: u32, num_channels: u32) -> Self {
        let data = data.into();
        assert!(num_channels > 0, "frame must have at least one channel");
        assert!(
            data.len() % num_channels as usize == 0,
            "sample count {} is not divisible by channel count {}",
            data.len(),
            num_channels
        );
        let samples_per_channel = data.len() / num_channels as usize;
        Self {
            data,
            sample_rate,
            num_channels,
            samples_per_channel,
        }
    }

    /// A frame of silence covering `duration`.
    pub fn silence(duration: Duration, sample_rate: u32, num_channels: u32) -> Self {
        let samples_per_channel = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
        let data = vec![0i16; samples_per_channel * num_channels as usize];
        Self::new(data, sample_rate, num_channels)
    }

    pub fn data(&self) -> &[i16] {
        &self.data
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn num_channels(&self) -> u32 {
        self.num_channels
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples_per_channel
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples_per_channel as f64 / self.sample_rate as f64)
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples_per_channel as u64 * 1000) / self.sample_rate as u64
    }

    /// Average the channels down to mono.
    pub fn to_mono(&self) -> AudioFrame {
        if self.num_channels == 1 {
            return self.clone();
        }
        let channels = self.num_channels as usize;
        let inv = 1.0 / channels as f32;
        let mono: Vec<i16> = self
            .data
            .chunks_exact(channels)
            .map(|chunk| {
                let sum: f32 = chunk.iter().map(|&s| s as f32).sum();
                (sum * inv) as i16
            })
            .collect();
        AudioFrame::new(mono, self.sample_rate, 1)
    }
}

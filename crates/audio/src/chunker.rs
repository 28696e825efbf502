use crate::AudioFrame;

/// Rewraps arbitrary-length sample slices into fixed-size frames.
///
/// The total sample count is preserved exactly: whatever does not fill a
/// whole frame stays buffered until more samples arrive or [`flush`] emits
/// the residual as a short final frame.
///
/// [`flush`]: FrameChunker::flush
pub struct FrameChunker {
    buffer: Vec<i16>,
    sample_rate: u32,
    num_channels: u32,
    samples_per_frame: usize,
}

impl FrameChunker {
    pub fn new(sample_rate: u32, num_channels: u32, samples_per_channel: usize) -> Self {
        assert!(samples_per_channel > 0, "frame size must be non-zero");
        Self {
            buffer: Vec::with_capacity(samples_per_channel * num_channels as usize * 2),
            sample_rate,
            num_channels,
            samples_per_frame: samples_per_channel * num_channels as usize,
        }
    }

    /// Chunker sized for `frame_ms` milliseconds per frame.
    pub fn with_frame_ms(sample_rate: u32, num_channels: u32, frame_ms: u32) -> Self {
        let samples_per_channel = (sample_rate as usize * frame_ms as usize) / 1000;
        Self::new(sample_rate, num_channels, samples_per_channel.max(1))
    }

    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.buffer.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.buffer.len() >= self.samples_per_frame {
            let data: Vec<i16> = self.buffer.drain(..self.samples_per_frame).collect();
            frames.push(AudioFrame::new(data, self.sample_rate, self.num_channels));
        }
        frames
    }

    /// Emit the residual partial frame, if any.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        // Trim to a whole number of interleaved sample groups.
        let whole = (self.buffer.len() / self.num_channels as usize) * self.num_channels as usize;
        if whole == 0 {
            self.buffer.clear();
            return None;
        }
        let data: Vec<i16> = self.buffer.drain(..whole).collect();
        self.buffer.clear();
        Some(AudioFrame::new(data, self.sample_rate, self.num_channels))
    }

    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }
}

/// Byte-stream shim: rewraps irregular PCM16LE payloads into fixed-size
/// frames. Used for synthesis providers that emit audio blobs of arbitrary
/// length.
pub struct PcmChunker {
    bytes: Vec<u8>,
    chunker: FrameChunker,
}

impl PcmChunker {
    pub fn new(sample_rate: u32, num_channels: u32, samples_per_channel: usize) -> Self {
        Self {
            bytes: Vec::new(),
            chunker: FrameChunker::new(sample_rate, num_channels, samples_per_channel),
        }
    }

    pub fn push(&mut self, payload: &[u8]) -> Vec<AudioFrame> {
        self.bytes.extend_from_slice(payload);
        let whole = self.bytes.len() / 2 * 2;
        let samples: Vec<i16> = self.bytes[..whole]
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.bytes.drain(..whole);
        self.chunker.push(&samples)
    }

    /// Emit the residual partial frame. A dangling odd byte is dropped.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if !self.bytes.is_empty() {
            tracing::warn!(
                residual_bytes = self.bytes.len(),
                "dropping incomplete trailing sample byte"
            );
            self.bytes.clear();
        }
        self.chunker.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_preserves_total_sample_count() {
        let mut chunker = FrameChunker::new(16_000, 1, 160);
        let mut total_out = 0usize;
        let pushes = [100usize, 333, 160, 7, 1200, 59];
        let total_in: usize = pushes.iter().sum();

        for n in pushes {
            let samples = vec![1i16; n];
            for frame in chunker.push(&samples) {
                assert_eq!(frame.samples_per_channel(), 160);
                total_out += frame.samples_per_channel();
            }
        }
        if let Some(frame) = chunker.flush() {
            total_out += frame.samples_per_channel();
        }
        assert_eq!(total_in, total_out);
    }

    #[test]
    fn byte_sequence_is_preserved() {
        let mut chunker = PcmChunker::new(24_000, 1, 4);
        let samples: Vec<i16> = (0..10).collect();
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let mut out = Vec::new();
        // Feed in awkward slices straddling sample boundaries.
        for piece in bytes.chunks(3) {
            for frame in chunker.push(piece) {
                out.extend_from_slice(frame.data());
            }
        }
        if let Some(frame) = chunker.flush() {
            out.extend_from_slice(frame.data());
        }
        assert_eq!(out, samples);
    }

    #[test]
    fn flush_emits_residual_short_frame() {
        let mut chunker = FrameChunker::new(16_000, 1, 160);
        assert!(chunker.push(&vec![0i16; 100]).is_empty());
        let residual = chunker.flush().unwrap();
        assert_eq!(residual.samples_per_channel(), 100);
        assert!(chunker.flush().is_none());
    }

    #[test]
    fn stereo_frames_keep_interleaving() {
        let mut chunker = FrameChunker::new(16_000, 2, 2);
        let frames = chunker.push(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data(), &[1, 2, 3, 4]);
        assert_eq!(frames[1].data(), &[5, 6, 7, 8]);
    }
}

//! Audio primitives for the parley runtime.
//!
//! The central piece is the [`FrameBus`]: a lazy, fan-out-capable stream of
//! fixed-size PCM frames whose backing source can be attached, detached and
//! re-attached without disturbing downstream readers.

mod bus;
mod chunker;
mod frame;
mod resampler;

pub use bus::{FrameBus, FrameBusConfig, FrameReader};
pub use chunker::{FrameChunker, PcmChunker};
pub use frame::AudioFrame;
pub use resampler::StreamResampler;

use futures::stream::BoxStream;

/// Standard ingress sample rate (microphone path).
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Standard egress sample rate (synthesis path).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Duration of one bus frame in milliseconds.
pub const FRAME_DURATION_MS: u32 = 10;

/// A lazy sequence of audio frames.
pub type FrameStream = BoxStream<'static, AudioFrame>;

/// A lazy sequence of audio frames whose source may fail mid-stream.
pub type FrameResultStream = BoxStream<'static, Result<AudioFrame>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AudioError {
    #[error("audio source error: {0}")]
    Source(String),
    #[error("resampling failed: {0}")]
    Resample(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

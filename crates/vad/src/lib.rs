//! Voice activity detection contract.
//!
//! A detector consumes the session's audio frames and emits speech
//! boundaries plus periodic inference results (~30 ms cadence). Concrete
//! detectors live outside the runtime; the core only depends on this trait.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parley_audio::FrameStream;

#[derive(Debug, Clone, thiserror::Error)]
pub enum VadError {
    #[error("detector not ready")]
    NotReady,
    #[error("inference error: {0}")]
    Inference(String),
}

pub type Result<T> = std::result::Result<T, VadError>;

#[derive(Debug, Clone)]
pub enum VadEvent {
    StartOfSpeech,
    /// One inference window's verdict while speech is (possibly) ongoing.
    InferenceDone {
        probability: f32,
        /// Consecutive speech observed so far in the current utterance.
        speech_duration: Duration,
    },
    EndOfSpeech,
}

pub type VadEventStream = BoxStream<'static, Result<VadEvent>>;

#[async_trait]
pub trait Vad: Send + Sync {
    fn label(&self) -> &'static str;

    /// Open a detection stream over the given audio.
    async fn stream(&self, audio: FrameStream) -> Result<VadEventStream>;
}

//! Streaming speech-to-text contract.
//!
//! Recognizers consume audio frames and emit [`SpeechEvent`]s: speech
//! boundaries, interim/preflight/final transcripts with ranked alternatives,
//! and usage reports. Recoverable failures are retried by the recognition
//! pipeline with [`interval_for_retry`] backoff; only non-recoverable errors
//! become user-visible.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parley_audio::FrameStream;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SttError {
    /// Transport-level failure; a fresh stream may succeed.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Provider-reported failure.
    #[error("provider error: {message}")]
    Provider { message: String, recoverable: bool },
    /// The provider closed the stream without a final event.
    #[error("recognition stream closed unexpectedly")]
    StreamClosed,
}

impl SttError {
    pub fn recoverable(&self) -> bool {
        match self {
            SttError::Connection(_) | SttError::StreamClosed => true,
            SttError::Provider { recoverable, .. } => *recoverable,
        }
    }
}

pub type Result<T> = std::result::Result<T, SttError>;

/// One recognition alternative.
#[derive(Debug, Clone)]
pub struct SpeechData {
    pub text: String,
    pub confidence: f32,
    pub language: Option<String>,
    pub speaker_id: Option<String>,
}

impl SpeechData {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: 1.0,
            language: None,
            speaker_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SpeechEvent {
    StartOfSpeech,
    /// Low-latency hypothesis; may be revised.
    InterimTranscript { alternatives: Vec<SpeechData> },
    /// High-confidence partial not yet finalized.
    PreflightTranscript { alternatives: Vec<SpeechData> },
    FinalTranscript { alternatives: Vec<SpeechData> },
    EndOfSpeech,
    RecognitionUsage { audio_duration: Duration },
}

impl SpeechEvent {
    /// Text of the top-ranked alternative, if this event carries one.
    pub fn primary_text(&self) -> Option<&str> {
        match self {
            SpeechEvent::InterimTranscript { alternatives }
            | SpeechEvent::PreflightTranscript { alternatives }
            | SpeechEvent::FinalTranscript { alternatives } => {
                alternatives.first().map(|alt| alt.text.as_str())
            }
            _ => None,
        }
    }
}

pub type SpeechEventStream = BoxStream<'static, Result<SpeechEvent>>;

#[async_trait]
pub trait Stt: Send + Sync {
    fn label(&self) -> &'static str;

    /// Sample rate this recognizer expects, if it differs from the bus.
    fn sample_rate(&self) -> Option<u32> {
        None
    }

    /// Open a recognition stream over the given audio.
    async fn stream(&self, audio: FrameStream) -> Result<SpeechEventStream>;
}

/// Default cap on consecutive stream-reopen attempts.
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Backoff before retry `attempt` (0-based): exponential with a small
/// time-derived jitter, capped at 10 s.
pub fn interval_for_retry(attempt: u32) -> Duration {
    let base_ms = 200u64.saturating_mul(1u64 << attempt.min(6));
    let capped = base_ms.min(10_000);
    let jitter = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % (capped / 4 + 1))
        .unwrap_or(0);
    Duration::from_millis(capped + jitter)
}

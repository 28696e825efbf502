//! Streaming text-to-speech contract.
//!
//! A synthesizer consumes a text stream and yields audio frames, optionally
//! interleaved with [`TimedString`] word timings. Timings let the runtime
//! report the exact prefix of a reply the listener actually heard when
//! playback is cut short.

use async_trait::async_trait;
use futures::stream::BoxStream;
use parley_audio::AudioFrame;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error)]
pub enum TtsError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("provider error: {message}")]
    Provider { message: String, recoverable: bool },
}

impl TtsError {
    pub fn recoverable(&self) -> bool {
        match self {
            TtsError::Connection(_) => true,
            TtsError::Provider { recoverable, .. } => *recoverable,
        }
    }
}

pub type Result<T> = std::result::Result<T, TtsError>;

/// A span of synthesized text with its position in the audio, in seconds
/// from segment start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedString {
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
}

impl TimedString {
    pub fn new(text: impl Into<String>, start_time: f64, end_time: f64) -> Self {
        Self {
            text: text.into(),
            start_time,
            end_time,
        }
    }
}

/// Synthesis output: audio frames with optional word timings interleaved.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    Audio(AudioFrame),
    Timing(TimedString),
}

pub type TtsStream = BoxStream<'static, Result<TtsEvent>>;

/// A lazy sequence of text pieces (for example, LLM token deltas).
pub type TextStream = BoxStream<'static, String>;

#[async_trait]
pub trait Tts: Send + Sync {
    fn label(&self) -> &'static str;

    fn sample_rate(&self) -> u32 {
        parley_audio::OUTPUT_SAMPLE_RATE
    }

    /// Synthesize a text stream into audio.
    async fn synthesize(&self, text: TextStream) -> Result<TtsStream>;
}

/// The exact text prefix heard after `played_secs` of audio, reconstructed
/// from word timings. A word counts once its end time has played out.
pub fn synchronized_prefix(words: &[TimedString], played_secs: f64) -> String {
    const EPSILON: f64 = 1e-6;
    words
        .iter()
        .take_while(|word| word.end_time <= played_secs + EPSILON)
        .map(|word| word.text.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_stops_at_unplayed_word() {
        let words = vec![
            TimedString::new("It's ", 0.0, 0.150),
            TimedString::new("sunny.", 0.150, 0.350),
        ];
        assert_eq!(synchronized_prefix(&words, 0.3), "It's ");
        assert_eq!(synchronized_prefix(&words, 0.35), "It's sunny.");
    }

    #[test]
    fn nothing_played_means_empty_prefix() {
        let words = vec![TimedString::new("hello", 0.1, 0.4)];
        assert_eq!(synchronized_prefix(&words, 0.0), "");
    }

    #[test]
    fn empty_timings_yield_empty_prefix() {
        assert_eq!(synchronized_prefix(&[], 10.0), "");
    }
}

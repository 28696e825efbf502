//! End-of-turn policy: deciding that the user has finished speaking.
//!
//! The recognition pipeline combines voice-activity boundaries with final
//! transcripts and, optionally, a semantic [`TurnDetector`]. This crate
//! holds the timing policy and the predictor contract; it has no opinion on
//! where the signals come from.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error)]
pub enum TurnError {
    #[error("model not loaded")]
    ModelNotLoaded,
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, TurnError>;

/// How end-of-turn is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetection {
    /// Never fire automatically; the application commits turns explicitly.
    Manual,
    /// Fire on end-of-speech plus an endpointing delay.
    #[default]
    Vad,
    /// Fire when the semantic predictor says the turn is complete.
    RealtimeLlm,
}

#[derive(Debug, Clone, Copy)]
pub struct TurnPrediction {
    pub probability: f32,
    pub threshold: f32,
}

impl TurnPrediction {
    pub fn is_complete(&self) -> bool {
        self.probability >= self.threshold
    }
}

/// Semantic end-of-turn predictor over the partial transcript.
#[async_trait]
pub trait TurnDetector: Send + Sync {
    fn label(&self) -> &'static str;

    async fn predict_end_of_turn(&self, transcript: &str) -> Result<TurnPrediction>;
}

/// Shrinks the endpointing delay when the transcript already reads finished.
pub const PUNCTUATION_REDUCE_FACTOR: f64 = 0.75;

/// A final transcript arriving within this window of end-of-speech is
/// treated as belonging to that utterance (timer runs from end-of-speech);
/// later finals restart the delay from their own arrival.
pub const LATE_TRANSCRIPT_TOLERANCE: Duration = Duration::from_millis(1500);

/// Summary handed to the scheduler when a user turn is committed.
#[derive(Debug, Clone)]
pub struct EndOfTurnInfo {
    pub new_transcript: String,
    /// Final transcript arrival relative to end-of-speech.
    pub transcription_delay: Duration,
    /// Total silence waited before committing.
    pub end_of_utterance_delay: Duration,
}

/// Endpointing silence to wait before committing a turn.
///
/// Starts from `min_delay`, shortened by [`PUNCTUATION_REDUCE_FACTOR`] when
/// the transcript ends in sentence punctuation, and never exceeds
/// `max_delay`.
pub fn endpointing_delay(min_delay: Duration, max_delay: Duration, transcript: &str) -> Duration {
    let mut delay = min_delay;
    if ends_with_sentence_punctuation(transcript) {
        delay = delay.mul_f64(PUNCTUATION_REDUCE_FACTOR);
    }
    delay.min(max_delay)
}

fn ends_with_sentence_punctuation(transcript: &str) -> bool {
    transcript
        .trim_end()
        .chars()
        .last()
        .map(|c| matches!(c, '.' | '!' | '?'))
        .unwrap_or(false)
}

/// Whitespace word count, used for the interruption-word threshold.
pub fn word_count(transcript: &str) -> usize {
    transcript.split_whitespace().count()
}

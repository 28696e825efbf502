use std::time::Duration;

use parley_turn::TurnDetection;

/// Time allowed for reply sub-tasks to unwind during an interruption.
pub const REPLY_TASK_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Baseline priority for agent utterances. Higher values preempt the queue;
/// only the normal level is scheduled by the runtime itself.
pub const SPEECH_PRIORITY_NORMAL: i32 = 0;

/// Session-wide behavior knobs.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Whether user speech may cut an agent utterance short.
    pub allow_interruptions: bool,
    /// Consecutive user speech required before a VAD-driven interruption.
    pub min_interruption_duration: Duration,
    /// Suppress transcript-driven interruption and turn commit when the new
    /// transcript has fewer words than this. Zero disables the gate.
    pub min_interruption_words: usize,
    /// Silence to wait after end of speech before committing the turn.
    pub min_endpointing_delay: Duration,
    /// Upper bound on end-of-turn latency.
    pub max_endpointing_delay: Duration,
    /// Recursion bound for tool-call → reply chains.
    pub max_tool_steps: u32,
    /// Start LLM/TTS on final-transcript arrival instead of waiting for
    /// endpointing. Applies to the top-level reply of a turn only.
    pub preemptive_synthesis: bool,
    pub turn_detection: TurnDetection,
    /// Silence (no user speech, no agent activity) before the user is
    /// reported away. `None` disables the timer.
    pub user_away_timeout: Option<Duration>,
    /// Bound on audio buffered inside the playback sink.
    pub playback_queue_size: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            allow_interruptions: true,
            min_interruption_duration: Duration::from_millis(500),
            min_interruption_words: 0,
            min_endpointing_delay: Duration::from_millis(500),
            max_endpointing_delay: Duration::from_secs(6),
            max_tool_steps: 3,
            preemptive_synthesis: false,
            turn_detection: TurnDetection::Vad,
            user_away_timeout: Some(Duration::from_secs(15)),
            playback_queue_size: Duration::from_secs(100),
        }
    }
}

//! Session event contracts.
//!
//! These are the formal DTOs the runtime publishes to applications. Using
//! shared typed events (rather than ad-hoc payloads) keeps producers and
//! consumers from drifting apart.
//!
//! Also provides the [`EventBus`] trait for decoupled event emission.

mod bus;

pub use bus::{BroadcastEventBus, EventBus, EventBusRef, InMemoryEventBus, NullEventBus};

use parley_chat::{ChatItem, FunctionCall, FunctionCallOutput};
use serde::{Deserialize, Serialize};

/// What the agent is doing, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Listening,
    Thinking,
    Speaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    Listening,
    Speaking,
    Away,
}

/// Which pipeline produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    Stt,
    Vad,
    Llm,
    Tts,
    Tool,
    Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub source: ErrorSource,
    pub recoverable: bool,
    pub message: String,
}

/// What caused an agent utterance to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechOrigin {
    /// Automatic reply to a committed user turn.
    UserTurn,
    /// Explicit `say` on the session.
    Say,
    /// Explicit `generate_reply` on the session.
    GenerateReply,
    /// Follow-up step after tool execution.
    ToolResponse,
}

/// One executed tool call and its recorded output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub call: FunctionCall,
    pub output: FunctionCallOutput,
}

/// Per-reply timing and token accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyMetrics {
    pub speech_id: String,
    /// First LLM token, milliseconds from reply start.
    pub time_to_first_token_ms: Option<u64>,
    /// First synthesized audio frame, milliseconds from reply start.
    pub time_to_first_frame_ms: Option<u64>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub interrupted: bool,
}

/// Recognition-side usage reported by the STT provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecognitionMetrics {
    pub audio_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricsEnvelope {
    Reply(ReplyMetrics),
    Recognition(RecognitionMetrics),
}

/// Everything a session reports to the application, in commit order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    UserInputTranscribed {
        transcript: String,
        is_final: bool,
        #[serde(default)]
        speaker_id: Option<String>,
    },
    UserStateChanged {
        state: UserState,
    },
    AgentStateChanged {
        state: AgentState,
    },
    ConversationItemAdded {
        item: ChatItem,
    },
    FunctionToolsExecuted {
        executions: Vec<ToolExecutionRecord>,
    },
    SpeechCreated {
        speech_id: String,
        user_initiated: bool,
        origin: SpeechOrigin,
    },
    MetricsCollected {
        metrics: MetricsEnvelope,
    },
    Error {
        error: ErrorEvent,
    },
}

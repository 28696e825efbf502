//! Streaming language model contract.
//!
//! A model consumes a chat-context snapshot plus a tool catalog and yields
//! [`ChatChunk`]s: incremental text content and tool-call argument deltas.
//! [`ToolCallAccumulator`] reassembles the deltas into complete calls.

mod accumulator;

pub use accumulator::{CompletedToolCall, ToolCallAccumulator};

use async_trait::async_trait;
use futures::stream::BoxStream;
use parley_chat::ChatContextView;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("provider error: {message}")]
    Provider { message: String, recoverable: bool },
}

impl LlmError {
    pub fn recoverable(&self) -> bool {
        match self {
            LlmError::Connection(_) => true,
            LlmError::Provider { recoverable, .. } => *recoverable,
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

/// How the model may use the supplied tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides; may use none.
    #[default]
    Auto,
    /// Model must call at least one tool.
    Required,
    /// Tool use disabled.
    None,
    /// Model must call this specific tool.
    Function { name: String },
}

/// Declaration of one callable tool, as advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the argument object.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub tool_choice: ToolChoice,
}

/// Incremental slice of one tool call. `call_id`/`name` arrive on the first
/// delta of a call; later deltas may carry only argument text.
#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    pub call_id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChoiceDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One streamed chunk of a completion.
#[derive(Debug, Clone)]
pub struct ChatChunk {
    /// Generation id; stable across all chunks of one completion.
    pub id: String,
    pub delta: Option<ChoiceDelta>,
    pub usage: Option<CompletionUsage>,
}

pub type ChatStream = BoxStream<'static, Result<ChatChunk>>;

#[async_trait]
pub trait Llm: Send + Sync {
    fn label(&self) -> &'static str;

    async fn chat(
        &self,
        ctx: ChatContextView,
        tools: Vec<ToolSpec>,
        options: ChatOptions,
    ) -> Result<ChatStream>;
}

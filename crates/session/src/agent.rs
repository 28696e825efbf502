use std::sync::Arc;

use async_trait::async_trait;
use parley_audio::FrameStream;
use parley_chat::{ChatContext, ChatContextView, ChatMessage};
use parley_llm::{ChatOptions, ChatStream, Llm, LlmError, ToolSpec};
use parley_stt::{SpeechEventStream, Stt, SttError};
use parley_tts::{TextStream, Tts, TtsError, TtsStream};
use parley_turn::TurnDetector;
use parley_vad::Vad;

use crate::session::AgentSession;
use crate::tools::FunctionTool;

/// Returned by `on_user_turn_completed` to suppress reply generation for
/// this turn.
#[derive(Debug, thiserror::Error)]
#[error("reply suppressed by agent hook")]
pub struct StopResponse;

/// Provider bundle and instructions for one agent persona.
pub struct Agent {
    instructions: String,
    tools: Vec<Arc<dyn FunctionTool>>,
    stt: Option<Arc<dyn Stt>>,
    llm: Option<Arc<dyn Llm>>,
    tts: Option<Arc<dyn Tts>>,
    vad: Option<Arc<dyn Vad>>,
    turn_detector: Option<Arc<dyn TurnDetector>>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn tools(&self) -> &[Arc<dyn FunctionTool>] {
        &self.tools
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn FunctionTool>> {
        self.tools.iter().find(|t| t.spec().name == name).cloned()
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn stt(&self) -> Option<Arc<dyn Stt>> {
        self.stt.clone()
    }

    pub fn llm(&self) -> Option<Arc<dyn Llm>> {
        self.llm.clone()
    }

    pub fn tts(&self) -> Option<Arc<dyn Tts>> {
        self.tts.clone()
    }

    pub fn vad(&self) -> Option<Arc<dyn Vad>> {
        self.vad.clone()
    }

    pub fn turn_detector(&self) -> Option<Arc<dyn TurnDetector>> {
        self.turn_detector.clone()
    }
}

#[derive(Default)]
pub struct AgentBuilder {
    instructions: String,
    tools: Vec<Arc<dyn FunctionTool>>,
    stt: Option<Arc<dyn Stt>>,
    llm: Option<Arc<dyn Llm>>,
    tts: Option<Arc<dyn Tts>>,
    vad: Option<Arc<dyn Vad>>,
    turn_detector: Option<Arc<dyn TurnDetector>>,
}

impl AgentBuilder {
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn tool(mut self, tool: Arc<dyn FunctionTool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn stt(mut self, stt: Arc<dyn Stt>) -> Self {
        self.stt = Some(stt);
        self
    }

    pub fn llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn tts(mut self, tts: Arc<dyn Tts>) -> Self {
        self.tts = Some(tts);
        self
    }

    pub fn vad(mut self, vad: Arc<dyn Vad>) -> Self {
        self.vad = Some(vad);
        self
    }

    pub fn turn_detector(mut self, detector: Arc<dyn TurnDetector>) -> Self {
        self.turn_detector = Some(detector);
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            instructions: self.instructions,
            tools: self.tools,
            stt: self.stt,
            llm: self.llm,
            tts: self.tts,
            vad: self.vad,
            turn_detector: self.turn_detector,
        }
    }
}

/// Behavior of an agent: lifecycle hooks plus overridable pipeline nodes.
///
/// The default node implementations delegate to the provider handles stored
/// on the [`Agent`]; implementors override individual nodes to splice in
/// custom behavior (rewriting text before synthesis, filtering transcripts,
/// and so on).
#[async_trait]
pub trait AgentCore: Send + Sync {
    fn agent(&self) -> &Agent;

    /// Runs when this agent becomes the session's active agent.
    async fn on_enter(&self, _session: AgentSession) {}

    /// Runs when this agent is replaced during a handoff.
    async fn on_exit(&self, _session: AgentSession) {}

    /// Runs after a user turn is committed, before the reply generates.
    /// May edit the context copy and the user message; returning
    /// `Err(StopResponse)` suppresses the reply. Never cancelled.
    async fn on_user_turn_completed(
        &self,
        _ctx: &mut ChatContext,
        _user_message: &mut ChatMessage,
    ) -> Result<(), StopResponse> {
        Ok(())
    }

    async fn stt_node(&self, audio: FrameStream) -> parley_stt::Result<SpeechEventStream> {
        let stt = self.agent().stt().ok_or_else(|| SttError::Provider {
            message: "agent has no speech-to-text provider".into(),
            recoverable: false,
        })?;
        stt.stream(audio).await
    }

    async fn llm_node(
        &self,
        ctx: ChatContextView,
        tools: Vec<ToolSpec>,
        options: ChatOptions,
    ) -> parley_llm::Result<ChatStream> {
        let llm = self.agent().llm().ok_or_else(|| LlmError::Provider {
            message: "agent has no language model provider".into(),
            recoverable: false,
        })?;
        llm.chat(ctx, tools, options).await
    }

    async fn tts_node(&self, text: TextStream) -> parley_tts::Result<TtsStream> {
        let tts = self.agent().tts().ok_or_else(|| TtsError::Provider {
            message: "agent has no text-to-speech provider".into(),
            recoverable: false,
        })?;
        tts.synthesize(text).await
    }

    /// Transform the text forwarded to transcript consumers. The default is
    /// a passthrough in LLM emission order.
    async fn transcription_node(&self, text: TextStream) -> TextStream {
        text
    }
}

/// A plain `Agent` is a complete implementation with default behavior.
#[async_trait]
impl AgentCore for Agent {
    fn agent(&self) -> &Agent {
        self
    }
}

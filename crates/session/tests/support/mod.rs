//! Scripted fake providers and capture transports for scenario tests.
//!
//! Providers play back a fixed timeline on the paused tokio clock, so
//! end-to-end tests run instantly and deterministically.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_audio::{AudioFrame, FrameStream};
use parley_chat::{ChatContextView, ChatMessage};
use parley_events::{InMemoryEventBus, SessionEvent};
use parley_llm::{
    ChatChunk, ChatOptions, ChatStream, ChoiceDelta, CompletionUsage, Llm, ToolCallDelta, ToolSpec,
};
use parley_session::{
    Agent, AgentCore, AgentSession, AudioOutput, FunctionTool, RunContext, TextOutput,
    TextSegmentAttributes, TextWriter, ToolReturn,
};
use parley_stt::{SpeechEvent, SpeechEventStream, Stt};
use parley_tts::{TimedString, Tts, TtsEvent, TtsStream};
use parley_vad::{Vad, VadEvent, VadEventStream};

pub fn frame_ms(ms: u64, sample_rate: u32) -> AudioFrame {
    let samples = (sample_rate as u64 * ms / 1000) as usize;
    AudioFrame::new(vec![0i16; samples], sample_rate, 1)
}

// -- Scripted recognition providers --
//
// Scripts are (delay-before-event, event) pairs. The stream stays open
// after the script runs out, like a live provider waiting for more audio.

pub struct ScriptedStt {
    script: Mutex<Option<Vec<(u64, SpeechEvent)>>>,
}

impl ScriptedStt {
    pub fn new(script: Vec<(u64, SpeechEvent)>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Some(script)),
        })
    }
}

#[async_trait]
impl Stt for ScriptedStt {
    fn label(&self) -> &'static str {
        "scripted-stt"
    }

    async fn stream(&self, _audio: FrameStream) -> parley_stt::Result<SpeechEventStream> {
        let script = self.script.lock().unwrap().take().unwrap_or_default();
        Ok(Box::pin(async_stream::stream! {
            for (delay_ms, event) in script {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                yield Ok(event);
            }
            std::future::pending::<()>().await;
        }))
    }
}

pub struct ScriptedVad {
    script: Mutex<Option<Vec<(u64, VadEvent)>>>,
}

impl ScriptedVad {
    pub fn new(script: Vec<(u64, VadEvent)>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Some(script)),
        })
    }
}

#[async_trait]
impl Vad for ScriptedVad {
    fn label(&self) -> &'static str {
        "scripted-vad"
    }

    async fn stream(&self, _audio: FrameStream) -> parley_vad::Result<VadEventStream> {
        let script = self.script.lock().unwrap().take().unwrap_or_default();
        Ok(Box::pin(async_stream::stream! {
            for (delay_ms, event) in script {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                yield Ok(event);
            }
            std::future::pending::<()>().await;
        }))
    }
}

// -- Scripted language model --

#[derive(Clone)]
pub enum LlmStep {
    Text(&'static str),
    ToolCall {
        name: &'static str,
        args: &'static str,
    },
}

pub struct FakeLlm {
    scripts: Mutex<VecDeque<Vec<LlmStep>>>,
    completions: AtomicUsize,
}

impl FakeLlm {
    pub fn new(scripts: Vec<Vec<LlmStep>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            completions: AtomicUsize::new(0),
        })
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Llm for FakeLlm {
    fn label(&self) -> &'static str {
        "fake-llm"
    }

    async fn chat(
        &self,
        _ctx: ChatContextView,
        _tools: Vec<ToolSpec>,
        _options: ChatOptions,
    ) -> parley_llm::Result<ChatStream> {
        let n = self.completions.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::pin(async_stream::stream! {
            let id = format!("gen_{n}");
            for (i, step) in script.into_iter().enumerate() {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let delta = match step {
                    LlmStep::Text(text) => ChoiceDelta {
                        content: Some(text.to_string()),
                        tool_calls: vec![],
                    },
                    LlmStep::ToolCall { name, args } => ChoiceDelta {
                        content: None,
                        tool_calls: vec![ToolCallDelta {
                            call_id: Some(format!("call_{n}_{i}")),
                            name: Some(name.to_string()),
                            arguments: args.to_string(),
                        }],
                    },
                };
                yield Ok(ChatChunk { id: id.clone(), delta: Some(delta), usage: None });
            }
            yield Ok(ChatChunk {
                id: id.clone(),
                delta: None,
                usage: Some(CompletionUsage { prompt_tokens: 12, completion_tokens: 7 }),
            });
        }))
    }
}

// -- Scripted synthesizer --

pub struct FakeTts {
    frames: usize,
    frame_ms: u64,
    timings: Mutex<Option<Vec<TimedString>>>,
}

impl FakeTts {
    pub fn new(frames: usize, frame_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            frames,
            frame_ms,
            timings: Mutex::new(None),
        })
    }

    pub fn with_timings(frames: usize, frame_ms: u64, timings: Vec<TimedString>) -> Arc<Self> {
        Arc::new(Self {
            frames,
            frame_ms,
            timings: Mutex::new(Some(timings)),
        })
    }
}

#[async_trait]
impl Tts for FakeTts {
    fn label(&self) -> &'static str {
        "fake-tts"
    }

    async fn synthesize(&self, mut text: parley_tts::TextStream) -> parley_tts::Result<TtsStream> {
        use futures::StreamExt;
        let frames = self.frames;
        let frame_ms = self.frame_ms;
        let timings = self.timings.lock().unwrap().clone();
        Ok(Box::pin(async_stream::stream! {
            // Consume the full text before producing audio.
            while text.next().await.is_some() {}
            if let Some(words) = timings {
                for word in words {
                    yield Ok(TtsEvent::Timing(word));
                }
            }
            for _ in 0..frames {
                yield Ok(TtsEvent::Audio(frame_ms_24k(frame_ms)));
            }
        }))
    }
}

fn frame_ms_24k(ms: u64) -> AudioFrame {
    frame_ms(ms, 24_000)
}

// -- Capture transports --

pub struct CaptureAudio {
    pub frames: Mutex<Vec<AudioFrame>>,
}

impl CaptureAudio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
        })
    }

    pub fn total_ms(&self) -> u64 {
        self.frames.lock().unwrap().iter().map(|f| f.duration_ms()).sum()
    }
}

#[async_trait]
impl AudioOutput for CaptureAudio {
    async fn write(&self, frame: AudioFrame) -> parley_audio::Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TextChunkRecord {
    pub segment_id: String,
    pub text: String,
    pub closed_final: bool,
}

pub struct CaptureTextOutput {
    pub records: Arc<Mutex<Vec<TextChunkRecord>>>,
}

impl CaptureTextOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn full_text(&self) -> String {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.text.as_str())
            .collect()
    }
}

#[async_trait]
impl TextOutput for CaptureTextOutput {
    async fn open(&self, attrs: TextSegmentAttributes) -> Box<dyn TextWriter> {
        Box::new(CaptureTextWriter {
            records: self.records.clone(),
            segment_id: attrs.segment_id,
        })
    }
}

struct CaptureTextWriter {
    records: Arc<Mutex<Vec<TextChunkRecord>>>,
    segment_id: String,
}

#[async_trait]
impl TextWriter for CaptureTextWriter {
    async fn write(&mut self, chunk: &str) {
        self.records.lock().unwrap().push(TextChunkRecord {
            segment_id: self.segment_id.clone(),
            text: chunk.to_string(),
            closed_final: false,
        });
    }

    async fn close(self: Box<Self>, is_final: bool) {
        if is_final {
            self.records.lock().unwrap().push(TextChunkRecord {
                segment_id: self.segment_id.clone(),
                text: String::new(),
                closed_final: true,
            });
        }
    }
}

// -- Tools --

pub struct StaticTool {
    pub name: &'static str,
    pub schema: serde_json::Value,
    pub output: serde_json::Value,
    pub reply_required: bool,
    pub handoff: Mutex<Option<Arc<dyn AgentCore>>>,
    pub invocations: AtomicUsize,
}

impl StaticTool {
    pub fn new(
        name: &'static str,
        schema: serde_json::Value,
        output: serde_json::Value,
        reply_required: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            schema,
            output,
            reply_required,
            handoff: Mutex::new(None),
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn with_handoff(
        name: &'static str,
        schema: serde_json::Value,
        agent: Arc<dyn AgentCore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            schema,
            output: serde_json::Value::Null,
            reply_required: false,
            handoff: Mutex::new(Some(agent)),
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FunctionTool for StaticTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.to_string(),
            description: format!("test tool {}", self.name),
            parameters: self.schema.clone(),
        }
    }

    async fn execute(
        &self,
        _args: serde_json::Value,
        _ctx: RunContext,
    ) -> Result<ToolReturn, parley_tools::ToolError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let handoff = self.handoff.lock().unwrap().take();
        Ok(ToolReturn {
            output: self.output.clone(),
            reply_required: self.reply_required,
            handoff,
        })
    }
}

// -- Agents --

pub struct EnterFlagAgent {
    inner: Agent,
    pub entered: Arc<AtomicBool>,
}

impl EnterFlagAgent {
    pub fn new(inner: Agent) -> (Arc<Self>, Arc<AtomicBool>) {
        let entered = Arc::new(AtomicBool::new(false));
        (
            Arc::new(Self {
                inner,
                entered: entered.clone(),
            }),
            entered,
        )
    }
}

#[async_trait]
impl AgentCore for EnterFlagAgent {
    fn agent(&self) -> &Agent {
        &self.inner
    }

    async fn on_enter(&self, _session: AgentSession) {
        self.entered.store(true, Ordering::SeqCst);
    }
}

// -- Event helpers --

/// Poll the captured events until `predicate` holds or virtual time runs out.
pub async fn wait_until<F>(bus: &Arc<InMemoryEventBus>, timeout_ms: u64, predicate: F) -> bool
where
    F: Fn(&[SessionEvent]) -> bool,
{
    let start = tokio::time::Instant::now();
    loop {
        if predicate(&bus.events()) {
            return true;
        }
        if start.elapsed() >= Duration::from_millis(timeout_ms) {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub fn assistant_messages(events: &[SessionEvent]) -> Vec<ChatMessage> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ConversationItemAdded { item } => item.as_message().cloned(),
            _ => None,
        })
        .filter(|m| matches!(m.role, parley_chat::ChatRole::Assistant))
        .collect()
}

pub fn user_messages(events: &[SessionEvent]) -> Vec<ChatMessage> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ConversationItemAdded { item } => item.as_message().cloned(),
            _ => None,
        })
        .filter(|m| matches!(m.role, parley_chat::ChatRole::User))
        .collect()
}

pub fn agent_states(events: &[SessionEvent]) -> Vec<parley_events::AgentState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::AgentStateChanged { state } => Some(*state),
            _ => None,
        })
        .collect()
}

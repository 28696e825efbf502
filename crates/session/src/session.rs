//! The session coordinator: owns the active agent, the chat history, the
//! audio endpoints and the user-facing event stream.

use std::sync::{Arc, Mutex};

use parley_audio::{FrameBus, FrameBusConfig, FrameResultStream};
use parley_chat::{ChatContext, ChatContextView, ChatItem};
use parley_events::{AgentState, EventBusRef, SessionEvent, UserState};
use parley_task::CancellationToken;

use crate::activity::AgentActivity;
use crate::agent::AgentCore;
use crate::io::{AudioOutput, TextOutput};
use crate::options::SessionOptions;
use crate::playback::PlaybackSink;
use crate::speech_handle::SpeechHandle;
use crate::transcript::TranscriptForwarder;
use crate::{Result, SessionError};

/// Cheap-to-clone handle to one agent session.
#[derive(Clone)]
pub struct AgentSession {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    options: SessionOptions,
    events: EventBusRef,
    chat: Mutex<ChatContext>,
    agent_state: Mutex<AgentState>,
    user_state: Mutex<UserState>,
    activity: tokio::sync::Mutex<Option<AgentActivity>>,
    audio_in: Arc<FrameBus>,
    audio_out: Mutex<Option<Arc<PlaybackSink>>>,
    text_out: Mutex<Option<(Arc<dyn TextOutput>, bool)>>,
    shutdown: CancellationToken,
}

impl AgentSession {
    pub fn new(options: SessionOptions, events: EventBusRef) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                options,
                events,
                chat: Mutex::new(ChatContext::new()),
                agent_state: Mutex::new(AgentState::Initializing),
                user_state: Mutex::new(UserState::Listening),
                activity: tokio::sync::Mutex::new(None),
                audio_in: Arc::new(FrameBus::new(FrameBusConfig::default())),
                audio_out: Mutex::new(None),
                text_out: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Start driving the conversation with `agent`.
    pub async fn start(&self, agent: Arc<dyn AgentCore>) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SessionError::Closed);
        }
        let mut slot = self.inner.activity.lock().await;
        if slot.is_some() {
            return Err(SessionError::Closed);
        }
        let activity = AgentActivity::new(
            agent,
            Arc::downgrade(&self.inner),
            self.inner.options.clone(),
        );
        activity.start();
        *slot = Some(activity);
        drop(slot);
        self.set_agent_state(AgentState::Listening);
        Ok(())
    }

    /// Replace the active agent: drain the current activity, run its exit
    /// hook, then start a fresh activity for `agent`.
    pub async fn update_agent(&self, agent: Arc<dyn AgentCore>) {
        let mut slot = self.inner.activity.lock().await;
        if let Some(current) = slot.take() {
            current.drain().await;
            current.shared.agent.on_exit(self.clone()).await;
            current.close();
        }
        let activity = AgentActivity::new(
            agent,
            Arc::downgrade(&self.inner),
            self.inner.options.clone(),
        );
        activity.start();
        *slot = Some(activity);
    }

    /// Wire participant microphone audio into recognition.
    pub fn set_audio_input(&self, source: FrameResultStream) {
        self.inner.audio_in.set_source(source);
    }

    pub fn detach_audio_input(&self) {
        self.inner.audio_in.detach_source();
    }

    /// Wire agent speech to an audio transport. Replacing the output stops
    /// the previous sink.
    pub fn set_audio_output(&self, output: Arc<dyn AudioOutput>) {
        let sink = Arc::new(PlaybackSink::new(
            output,
            self.inner.options.playback_queue_size,
        ));
        let previous = self
            .inner
            .audio_out
            .lock()
            .expect("audio output lock poisoned")
            .replace(sink);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    /// Wire transcript text to a transport. `delta_mode` streams increments
    /// through one writer per segment; otherwise each chunk rewrites the
    /// accumulated text through a fresh writer.
    pub fn set_text_output(&self, output: Arc<dyn TextOutput>, delta_mode: bool) {
        *self
            .inner
            .text_out
            .lock()
            .expect("text output lock poisoned") = Some((output, delta_mode));
    }

    /// Speak `text` verbatim through the normal speech queue.
    pub async fn say(&self, text: impl Into<String>) -> Result<SpeechHandle> {
        let slot = self.inner.activity.lock().await;
        let activity = slot.as_ref().ok_or(SessionError::NotStarted)?;
        activity.say(text.into())
    }

    /// Ask the agent to generate a reply now, optionally with one-off
    /// instructions.
    pub async fn generate_reply(&self, instructions: Option<String>) -> Result<SpeechHandle> {
        let slot = self.inner.activity.lock().await;
        let activity = slot.as_ref().ok_or(SessionError::NotStarted)?;
        activity.generate_reply(instructions)
    }

    /// Interrupt the current utterance and everything queued behind it.
    pub async fn interrupt(&self) -> Result<()> {
        let slot = self.inner.activity.lock().await;
        let activity = slot.as_ref().ok_or(SessionError::NotStarted)?;
        activity.interrupt_all();
        Ok(())
    }

    /// Commit the accumulated user transcript as a completed turn. The only
    /// commit path under manual turn detection.
    pub async fn commit_user_turn(&self) -> Result<()> {
        let activity = {
            let slot = self.inner.activity.lock().await;
            slot.as_ref().map(|a| AgentActivity {
                shared: a.shared.clone(),
            })
        };
        match activity {
            Some(activity) => {
                activity.commit_user_turn().await;
                Ok(())
            }
            None => Err(SessionError::NotStarted),
        }
    }

    /// Drop the accumulated (uncommitted) user transcript.
    pub async fn clear_user_turn(&self) -> Result<()> {
        let slot = self.inner.activity.lock().await;
        let activity = slot.as_ref().ok_or(SessionError::NotStarted)?;
        activity.clear_user_turn();
        Ok(())
    }

    pub fn agent_state(&self) -> AgentState {
        *self
            .inner
            .agent_state
            .lock()
            .expect("agent state lock poisoned")
    }

    pub fn user_state(&self) -> UserState {
        *self
            .inner
            .user_state
            .lock()
            .expect("user state lock poisoned")
    }

    /// Read-only snapshot of the conversation history.
    pub fn chat_view(&self) -> ChatContextView {
        self.inner.chat.lock().expect("chat lock poisoned").view()
    }

    /// Stop all pipelines. In-flight speech is interrupted, not drained.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let mut slot = self.inner.activity.lock().await;
        if let Some(activity) = slot.take() {
            activity.interrupt_all();
            activity.close();
        }
        drop(slot);
        self.inner.audio_in.detach_source();
        if let Some(sink) = self
            .inner
            .audio_out
            .lock()
            .expect("audio output lock poisoned")
            .take()
        {
            sink.stop();
        }
    }

    // -- crate-internal surface --

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.inner.events.emit(event);
    }

    pub(crate) fn chat_copy(&self) -> ChatContext {
        self.inner.chat.lock().expect("chat lock poisoned").copy()
    }

    /// Insert an item into the authoritative history and announce it.
    /// Items are announced in exactly the order they are committed.
    pub(crate) fn commit_item(&self, item: ChatItem) -> Result<()> {
        let mut chat = self.inner.chat.lock().expect("chat lock poisoned");
        chat.insert(item.clone())?;
        self.inner
            .events
            .emit(SessionEvent::ConversationItemAdded { item });
        Ok(())
    }

    pub(crate) fn set_agent_state(&self, state: AgentState) {
        let changed = {
            let mut current = self
                .inner
                .agent_state
                .lock()
                .expect("agent state lock poisoned");
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        };
        if changed {
            self.emit(SessionEvent::AgentStateChanged { state });
        }
    }

    pub(crate) fn set_user_state(&self, state: UserState) {
        let changed = {
            let mut current = self
                .inner
                .user_state
                .lock()
                .expect("user state lock poisoned");
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        };
        if changed {
            self.emit(SessionEvent::UserStateChanged { state });
        }
    }

    pub(crate) fn audio_bus(&self) -> Arc<FrameBus> {
        self.inner.audio_in.clone()
    }

    pub(crate) fn playback_sink(&self) -> Option<Arc<PlaybackSink>> {
        self.inner
            .audio_out
            .lock()
            .expect("audio output lock poisoned")
            .clone()
    }

    pub(crate) fn transcript_forwarder(&self) -> TranscriptForwarder {
        let config = self
            .inner
            .text_out
            .lock()
            .expect("text output lock poisoned")
            .clone();
        match config {
            Some((output, delta_mode)) => TranscriptForwarder::new(Some(output), delta_mode, None),
            None => TranscriptForwarder::new(None, true, None),
        }
    }
}

//! Per-agent turn engine: a priority queue of speech handles drained by a
//! single-consumer main loop, plus the recognition hooks that turn user
//! speech into scheduled replies.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parley_chat::{ChatItem, ChatMessage, ChatRole};
use parley_events::{
    ErrorEvent, MetricsEnvelope, RecognitionMetrics, SessionEvent, SpeechOrigin, UserState,
};
use parley_llm::ToolChoice;
use parley_task::{CancellationToken, SpawnedTask, WaitGroup};
use parley_turn::{word_count, EndOfTurnInfo};
use tokio::sync::Notify;

use crate::agent::AgentCore;
use crate::options::{SessionOptions, SPEECH_PRIORITY_NORMAL};
use crate::recognition::{AudioRecognition, RecognitionHooks};
use crate::reply::ReplyPlan;
use crate::session::{AgentSession, SessionInner};
use crate::speech_handle::SpeechHandle;
use crate::{Result, SessionError};

struct QueuedSpeech {
    priority: i32,
    seq: u64,
    handle: SpeechHandle,
}

impl PartialEq for QueuedSpeech {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedSpeech {}

impl PartialOrd for QueuedSpeech {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedSpeech {
    /// Max priority first, then earliest scheduling order.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct PreemptiveGeneration {
    transcript: String,
    user_message: ChatMessage,
    handle: SpeechHandle,
}

pub(crate) struct AgentActivity {
    pub(crate) shared: Arc<ActivityShared>,
}

pub(crate) struct ActivityShared {
    weak_self: Weak<ActivityShared>,
    pub(crate) agent: Arc<dyn AgentCore>,
    session: Weak<SessionInner>,
    pub(crate) options: SessionOptions,
    queue: Mutex<BinaryHeap<QueuedSpeech>>,
    queue_wake: Notify,
    current: Mutex<Option<SpeechHandle>>,
    draining: AtomicBool,
    pub(crate) tasks: WaitGroup,
    pub(crate) shutdown: CancellationToken,
    seq: AtomicU64,
    /// Serializes user-turn-completion runs; user code is never cancelled,
    /// a newer turn simply waits its turn.
    user_turn_lock: tokio::sync::Mutex<()>,
    recognition: Mutex<Option<Arc<AudioRecognition>>>,
    main: Mutex<Option<SpawnedTask<()>>>,
    preemptive: Mutex<Option<PreemptiveGeneration>>,
}

impl AgentActivity {
    pub(crate) fn new(
        agent: Arc<dyn AgentCore>,
        session: Weak<SessionInner>,
        options: SessionOptions,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak_self: &Weak<ActivityShared>| ActivityShared {
            weak_self: weak_self.clone(),
            agent,
            session,
            options,
            queue: Mutex::new(BinaryHeap::new()),
            queue_wake: Notify::new(),
            current: Mutex::new(None),
            draining: AtomicBool::new(false),
            tasks: WaitGroup::new(),
            shutdown: CancellationToken::new(),
            seq: AtomicU64::new(0),
            user_turn_lock: tokio::sync::Mutex::new(()),
            recognition: Mutex::new(None),
            main: Mutex::new(None),
            preemptive: Mutex::new(None),
        });
        Self { shared }
    }

    pub(crate) fn start(&self) {
        let shared = &self.shared;

        // Recognition runs when the agent can hear anything at all.
        if shared.agent.agent().stt().is_some() || shared.agent.agent().vad().is_some() {
            if let Some(session) = shared.session() {
                let recognition = AudioRecognition::start(
                    shared.clone() as Arc<dyn RecognitionHooks>,
                    shared.agent.clone(),
                    session.audio_bus(),
                    shared.options.clone(),
                    &shared.shutdown,
                );
                *shared.recognition.lock().expect("recognition slot poisoned") =
                    Some(Arc::new(recognition));
            }
        }

        // on_enter runs as a tracked speech task so draining waits for it.
        if let Some(session) = shared.session() {
            let guard = shared.tasks.add();
            let agent = shared.agent.clone();
            tokio::spawn(async move {
                let _guard = guard;
                agent.on_enter(session).await;
            });
        }

        let main = shared.spawn_main();
        *shared.main.lock().expect("main task slot poisoned") = Some(main);
    }

    pub(crate) async fn drain(&self) {
        self.shared.draining.store(true, Ordering::SeqCst);
        self.shared.queue_wake.notify_one();
        let main = self.shared.main.lock().expect("main task slot poisoned").take();
        if let Some(task) = main {
            task.join().await;
        }
    }

    pub(crate) fn close(&self) {
        self.shared.shutdown.cancel();
        if let Some(recognition) = self
            .shared
            .recognition
            .lock()
            .expect("recognition slot poisoned")
            .take()
        {
            recognition.close();
        }
    }

    pub(crate) async fn commit_user_turn(&self) {
        let recognition = {
            let slot = self.shared.recognition.lock().expect("recognition slot poisoned");
            slot.clone()
        };
        if let Some(recognition) = recognition {
            recognition.commit_user_turn().await;
        }
    }

    pub(crate) fn clear_user_turn(&self) {
        if let Some(recognition) = self
            .shared
            .recognition
            .lock()
            .expect("recognition slot poisoned")
            .as_ref()
        {
            recognition.clear_user_turn();
        }
    }

    pub(crate) fn interrupt_all(&self) {
        if let Some(current) = self.shared.current_speech() {
            current.interrupt();
        }
        let queue = self.shared.queue.lock().expect("speech queue lock poisoned");
        for queued in queue.iter() {
            queued.handle.interrupt();
        }
    }

    pub(crate) fn say(&self, text: String) -> Result<SpeechHandle> {
        self.shared
            .create_reply(ReplyPlan::Verbatim { text }, SpeechOrigin::Say, false)
    }

    pub(crate) fn generate_reply(&self, instructions: Option<String>) -> Result<SpeechHandle> {
        let session = self.shared.session().ok_or(SessionError::Closed)?;
        self.shared.create_reply(
            ReplyPlan::Llm {
                chat_ctx: session.chat_copy(),
                instructions,
                tool_choice: ToolChoice::Auto,
            },
            SpeechOrigin::GenerateReply,
            false,
        )
    }
}

impl ActivityShared {
    fn strong(&self) -> Option<Arc<ActivityShared>> {
        self.weak_self.upgrade()
    }

    pub(crate) fn session(&self) -> Option<AgentSession> {
        self.session.upgrade().map(AgentSession::from_inner)
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub(crate) fn current_speech(&self) -> Option<SpeechHandle> {
        self.current.lock().expect("current speech lock poisoned").clone()
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.lock().expect("speech queue lock poisoned").is_empty()
    }

    /// Queue a handle for playout. Draining activities accept only
    /// bypass-draining (tool follow-up) speeches.
    pub(crate) fn schedule_speech(
        &self,
        handle: SpeechHandle,
        priority: i32,
        bypass_draining: bool,
    ) -> Result<()> {
        if self.is_draining() && !bypass_draining {
            tracing::warn!(speech_id = %handle.id(), "speech rejected, activity is draining");
            return Err(SessionError::Draining);
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .expect("speech queue lock poisoned")
            .push(QueuedSpeech {
                priority,
                seq,
                handle,
            });
        self.queue_wake.notify_one();
        Ok(())
    }

    fn pop_speech(&self) -> Option<SpeechHandle> {
        self.queue
            .lock()
            .expect("speech queue lock poisoned")
            .pop()
            .map(|q| q.handle)
    }

    /// Plan a reply: spawn its task and queue its handle.
    pub(crate) fn create_reply(
        &self,
        plan: ReplyPlan,
        origin: SpeechOrigin,
        bypass_draining: bool,
    ) -> Result<SpeechHandle> {
        if self.is_draining() && !bypass_draining {
            return Err(SessionError::Draining);
        }
        let handle = SpeechHandle::new(self.options.allow_interruptions, origin);
        self.announce_speech(&handle);
        self.spawn_reply(handle.clone(), plan);
        self.schedule_speech(handle.clone(), SPEECH_PRIORITY_NORMAL, bypass_draining)?;
        Ok(handle)
    }

    /// Like `create_reply` but leaves the handle unscheduled; used by
    /// preemptive synthesis, which authorizes only once the turn commits.
    fn create_unscheduled_reply(&self, plan: ReplyPlan, origin: SpeechOrigin) -> SpeechHandle {
        let handle = SpeechHandle::new(self.options.allow_interruptions, origin);
        self.announce_speech(&handle);
        self.spawn_reply(handle.clone(), plan);
        handle
    }

    /// Spawn a tool-recursion step created by the reply pipeline.
    pub(crate) fn spawn_reply_step(&self, handle: SpeechHandle, plan: ReplyPlan) -> Result<()> {
        self.announce_speech(&handle);
        self.spawn_reply(handle.clone(), plan);
        self.schedule_speech(handle, SPEECH_PRIORITY_NORMAL, true)
    }

    fn announce_speech(&self, handle: &SpeechHandle) {
        if let Some(session) = self.session() {
            let user_initiated = matches!(
                handle.origin(),
                SpeechOrigin::Say | SpeechOrigin::GenerateReply
            );
            session.emit(SessionEvent::SpeechCreated {
                speech_id: handle.id().to_string(),
                user_initiated,
                origin: handle.origin(),
            });
        }
    }

    fn spawn_reply(&self, handle: SpeechHandle, plan: ReplyPlan) {
        let Some(activity) = self.strong() else {
            handle.mark_playout_done();
            return;
        };
        let guard = self.tasks.add();
        SpawnedTask::spawn_child(&self.shutdown, move |token| async move {
            let _guard = guard;
            crate::reply::run_reply(activity, handle, plan, token).await;
        });
    }

    fn spawn_main(&self) -> SpawnedTask<()> {
        let activity = self.strong().expect("activity is being constructed");
        SpawnedTask::spawn_child(&self.shutdown, move |token| async move {
            activity.main_loop(token).await;
        })
    }

    /// Single consumer of the speech queue: one utterance audible at a time,
    /// never advancing while the current handle's playout is unresolved.
    async fn main_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            while let Some(handle) = self.pop_speech() {
                if handle.interrupted() {
                    // Interrupted while queued; its reply task unwinds on
                    // its own, nothing to play.
                    continue;
                }
                *self.current.lock().expect("current speech lock poisoned") =
                    Some(handle.clone());
                handle.authorize();
                handle.wait_for_playout().await;
                *self.current.lock().expect("current speech lock poisoned") = None;
            }

            if self.is_draining() && self.queue_is_empty() && self.tasks.is_empty() {
                break;
            }
            if token.is_cancelled() {
                break;
            }

            if self.queue_is_empty() && self.tasks.is_empty() && !self.is_draining() {
                if let Some(session) = self.session() {
                    session.set_agent_state(parley_events::AgentState::Listening);
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.queue_wake.notified() => {}
                _ = self.tasks.changed() => {}
                // Watchdog poll: wake-ups lost to races are recovered here.
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
        tracing::debug!(draining = self.is_draining(), "activity main loop exited");
    }

    fn try_interrupt_current(&self, source: &'static str) {
        if let Some(current) = self.current_speech() {
            if current.allow_interruptions() && !current.is_done() && !current.interrupted() {
                tracing::debug!(speech_id = %current.id(), source, "interrupting agent speech");
                current.interrupt();
            }
        }
    }

    fn start_preemptive_generation(&self, transcript: String) {
        let Some(session) = self.session() else {
            return;
        };
        if transcript.is_empty() || self.is_draining() {
            return;
        }
        let mut slot = self.preemptive.lock().expect("preemptive slot poisoned");
        if let Some(previous) = slot.take() {
            previous.handle.interrupt();
        }

        let user_message = ChatMessage::new(ChatRole::User, transcript.clone());
        let mut ctx = session.chat_copy();
        if ctx
            .insert(ChatItem::Message(user_message.clone()))
            .is_err()
        {
            return;
        }
        let handle = self.create_unscheduled_reply(
            ReplyPlan::Llm {
                chat_ctx: ctx,
                instructions: None,
                tool_choice: ToolChoice::Auto,
            },
            SpeechOrigin::UserTurn,
        );
        tracing::debug!(speech_id = %handle.id(), "preemptive synthesis started");
        *slot = Some(PreemptiveGeneration {
            transcript,
            user_message,
            handle,
        });
    }

    /// The user-turn-completion sub-protocol, run as its own task.
    async fn user_turn_completed(self: Arc<Self>, info: EndOfTurnInfo) {
        let _serial = self.user_turn_lock.lock().await;
        let Some(session) = self.session() else {
            return;
        };

        if let Some(current) = self.current_speech() {
            if !current.is_done() {
                if !current.allow_interruptions() {
                    tracing::warn!(
                        speech_id = %current.id(),
                        "user turn completed during uninterruptible speech, skipping reply"
                    );
                    if let Some(p) = self.preemptive.lock().expect("preemptive slot poisoned").take() {
                        p.handle.interrupt();
                    }
                    return;
                }
                current.interrupt();
            }
        }

        let mut temp_ctx = session.chat_copy();
        let mut user_message = ChatMessage::new(ChatRole::User, info.new_transcript.clone());
        if self
            .agent
            .on_user_turn_completed(&mut temp_ctx, &mut user_message)
            .await
            .is_err()
        {
            tracing::debug!("reply suppressed by on_user_turn_completed");
            if let Some(p) = self.preemptive.lock().expect("preemptive slot poisoned").take() {
                p.handle.interrupt();
            }
            return;
        }

        // A matching preemptive generation is promoted instead of starting
        // a fresh one; anything stale is cancelled.
        let preemptive = self.preemptive.lock().expect("preemptive slot poisoned").take();
        if let Some(p) = preemptive {
            let untouched = user_message.text_content() == info.new_transcript;
            if untouched && p.transcript == info.new_transcript && !p.handle.interrupted() {
                if session
                    .commit_item(ChatItem::Message(p.user_message.clone()))
                    .is_ok()
                    && self
                        .schedule_speech(p.handle.clone(), SPEECH_PRIORITY_NORMAL, false)
                        .is_ok()
                {
                    tracing::debug!(speech_id = %p.handle.id(), "preemptive reply promoted");
                    return;
                }
            }
            p.handle.interrupt();
        }

        let user_item = ChatItem::Message(user_message);
        if let Err(e) = session.commit_item(user_item.clone()) {
            tracing::error!(error = %e, "failed to commit user turn");
            return;
        }
        let mut reply_ctx = temp_ctx;
        if let Err(e) = reply_ctx.insert(user_item) {
            tracing::error!(error = %e, "failed to stage user turn for reply");
            return;
        }

        if let Err(e) = self.create_reply(
            ReplyPlan::Llm {
                chat_ctx: reply_ctx,
                instructions: None,
                tool_choice: ToolChoice::Auto,
            },
            SpeechOrigin::UserTurn,
            false,
        ) {
            tracing::warn!(error = %e, "could not schedule reply for user turn");
        }
    }
}

#[async_trait]
impl RecognitionHooks for ActivityShared {
    async fn on_start_of_speech(&self) {
        // Interruption decisions ride on inference duration / transcripts.
    }

    async fn on_vad_inference_done(&self, _probability: f32, speech_duration: Duration) {
        if speech_duration < self.options.min_interruption_duration {
            return;
        }
        // With a word threshold configured, only transcripts can interrupt.
        if self.options.min_interruption_words > 0 {
            return;
        }
        self.try_interrupt_current("vad");
    }

    async fn on_end_of_speech(&self) {}

    async fn on_interim_transcript(&self, text: String, speaker_id: Option<String>) {
        if let Some(session) = self.session() {
            session.emit(SessionEvent::UserInputTranscribed {
                transcript: text,
                is_final: false,
                speaker_id,
            });
        }
    }

    async fn on_final_transcript(&self, text: String, speaker_id: Option<String>) {
        if let Some(session) = self.session() {
            session.emit(SessionEvent::UserInputTranscribed {
                transcript: text.clone(),
                is_final: true,
                speaker_id,
            });
        }
        if word_count(&text) >= self.options.min_interruption_words {
            self.try_interrupt_current("final_transcript");
        }
        if self.options.preemptive_synthesis && self.current_speech().is_none() {
            // The turn may span several finals; generate from everything
            // accumulated so far so the commit-time comparison can match.
            let full_transcript = self
                .recognition
                .lock()
                .expect("recognition slot poisoned")
                .as_ref()
                .map(|r| r.current_transcript());
            if let Some(transcript) = full_transcript {
                self.start_preemptive_generation(transcript);
            }
        }
    }

    async fn on_preflight_transcript(&self, _text: String) {}

    async fn on_end_of_turn(&self, info: EndOfTurnInfo) -> bool {
        // Draining: pretend the turn was handled so the transcript clears;
        // the next activity owns the conversation from here.
        if self.is_draining() {
            return true;
        }

        if let Some(current) = self.current_speech() {
            let words = word_count(&info.new_transcript);
            if self.options.min_interruption_words > 0
                && words < self.options.min_interruption_words
                && current.allow_interruptions()
                && !current.is_done()
            {
                tracing::debug!(words, "turn below interruption word threshold, not committing");
                return false;
            }
        }

        let Some(activity) = self.strong() else {
            return true;
        };
        let guard = self.tasks.add();
        // Deliberately not a cancellable task: user code is sacred.
        tokio::spawn(async move {
            let _guard = guard;
            activity.user_turn_completed(info).await;
        });
        true
    }

    async fn on_user_state_changed(&self, state: UserState) {
        if let Some(session) = self.session() {
            session.set_user_state(state);
        }
    }

    async fn on_recognition_error(&self, error: ErrorEvent) {
        if let Some(session) = self.session() {
            session.emit(SessionEvent::Error { error });
        }
    }

    async fn on_recognition_usage(&self, audio_duration: Duration) {
        if let Some(session) = self.session() {
            session.emit(SessionEvent::MetricsCollected {
                metrics: MetricsEnvelope::Recognition(RecognitionMetrics {
                    audio_duration_ms: audio_duration.as_millis() as u64,
                }),
            });
        }
    }
}

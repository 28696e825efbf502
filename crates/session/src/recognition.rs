//! Recognition pipeline: fuses voice-activity events, streaming speech
//! recognition and the optional semantic turn predictor into end-of-turn
//! decisions for the scheduler.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parley_audio::{FrameBus, FrameChunker, FrameStream, StreamResampler, FRAME_DURATION_MS};
use parley_events::{ErrorEvent, ErrorSource, UserState};
use parley_stt::{interval_for_retry, SpeechEvent, DEFAULT_MAX_RETRY};
use parley_task::{CancellationToken, SpawnedTask};
use parley_turn::{endpointing_delay, EndOfTurnInfo, TurnDetection, LATE_TRANSCRIPT_TOLERANCE};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::agent::AgentCore;
use crate::options::SessionOptions;

/// Callbacks the recognition pipeline drives on the scheduler.
#[async_trait]
pub(crate) trait RecognitionHooks: Send + Sync {
    async fn on_start_of_speech(&self);
    async fn on_vad_inference_done(&self, probability: f32, speech_duration: Duration);
    async fn on_end_of_speech(&self);
    async fn on_interim_transcript(&self, text: String, speaker_id: Option<String>);
    async fn on_final_transcript(&self, text: String, speaker_id: Option<String>);
    async fn on_preflight_transcript(&self, text: String);
    /// Returns true when the turn was committed (or deliberately discarded
    /// while draining); false leaves the transcript accumulating.
    async fn on_end_of_turn(&self, info: EndOfTurnInfo) -> bool;
    async fn on_user_state_changed(&self, state: UserState);
    async fn on_recognition_error(&self, error: ErrorEvent);
    async fn on_recognition_usage(&self, audio_duration: Duration);
}

struct TurnState {
    /// Final transcripts accumulated for the current (uncommitted) turn.
    transcript: String,
    last_final_at: Option<Instant>,
    end_of_speech_at: Option<Instant>,
    speaking: bool,
    /// When the pending end-of-turn commit fires.
    deadline: Option<Instant>,
    last_activity_at: Instant,
    user_state: UserState,
}

pub(crate) struct RecognitionShared {
    hooks: Arc<dyn RecognitionHooks>,
    agent: Arc<dyn AgentCore>,
    bus: Arc<FrameBus>,
    options: SessionOptions,
    state: Mutex<TurnState>,
    eot_wake: Notify,
}

/// Long-lived recognition tasks for one activity.
pub(crate) struct AudioRecognition {
    shared: Arc<RecognitionShared>,
    tasks: Vec<SpawnedTask<()>>,
}

impl AudioRecognition {
    pub(crate) fn start(
        hooks: Arc<dyn RecognitionHooks>,
        agent: Arc<dyn AgentCore>,
        bus: Arc<FrameBus>,
        options: SessionOptions,
        shutdown: &CancellationToken,
    ) -> Self {
        let shared = Arc::new(RecognitionShared {
            hooks,
            agent,
            bus,
            options,
            state: Mutex::new(TurnState {
                transcript: String::new(),
                last_final_at: None,
                end_of_speech_at: None,
                speaking: false,
                deadline: None,
                last_activity_at: Instant::now(),
                user_state: UserState::Listening,
            }),
            eot_wake: Notify::new(),
        });

        let mut tasks = Vec::new();
        if shared.agent.agent().stt().is_some() {
            let shared = shared.clone();
            tasks.push(SpawnedTask::spawn_child(shutdown, move |token| async move {
                stt_task(shared, token).await;
            }));
        }
        if shared.agent.agent().vad().is_some() {
            let shared = shared.clone();
            tasks.push(SpawnedTask::spawn_child(shutdown, move |token| async move {
                vad_task(shared, token).await;
            }));
        }
        {
            let shared = shared.clone();
            tasks.push(SpawnedTask::spawn_child(shutdown, move |token| async move {
                end_of_turn_task(shared, token).await;
            }));
        }
        if shared.options.user_away_timeout.is_some() {
            let shared = shared.clone();
            tasks.push(SpawnedTask::spawn_child(shutdown, move |token| async move {
                away_task(shared, token).await;
            }));
        }

        Self { shared, tasks }
    }

    /// Commit whatever transcript has accumulated, regardless of timers.
    /// This is the only commit path in manual turn detection.
    pub(crate) async fn commit_user_turn(&self) {
        commit_turn(&self.shared, true).await;
    }

    /// Drop the accumulated (uncommitted) transcript.
    pub(crate) fn clear_user_turn(&self) {
        let mut st = self.shared.state.lock().expect("turn state lock poisoned");
        st.transcript.clear();
        st.last_final_at = None;
        st.deadline = None;
    }

    pub(crate) fn current_transcript(&self) -> String {
        self.shared
            .state
            .lock()
            .expect("turn state lock poisoned")
            .transcript
            .clone()
    }

    pub(crate) fn close(&self) {
        for task in &self.tasks {
            task.cancel();
        }
    }
}

// -- STT path --

async fn stt_task(shared: Arc<RecognitionShared>, token: CancellationToken) {
    let mut attempt: u32 = 0;
    'reconnect: loop {
        if token.is_cancelled() {
            return;
        }
        let audio = stt_audio_stream(&shared);
        let open = tokio::select! {
            _ = token.cancelled() => return,
            open = shared.agent.stt_node(audio) => open,
        };
        let failure = match open {
            Ok(mut events) => loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    next = events.next() => match next {
                        Some(Ok(event)) => {
                            attempt = 0;
                            handle_speech_event(&shared, event).await;
                        }
                        Some(Err(e)) => break e,
                        None => break parley_stt::SttError::StreamClosed,
                    }
                }
            },
            Err(e) => e,
        };

        if !failure.recoverable() || attempt >= DEFAULT_MAX_RETRY {
            tracing::error!(error = %failure, attempts = attempt, "speech recognition failed");
            shared
                .hooks
                .on_recognition_error(ErrorEvent {
                    source: ErrorSource::Stt,
                    recoverable: false,
                    message: failure.to_string(),
                })
                .await;
            return;
        }

        // Recoverable: retry quietly, without surfacing an error event.
        let backoff = interval_for_retry(attempt);
        attempt += 1;
        tracing::warn!(
            error = %failure,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            "recognition stream failed, retrying"
        );
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(backoff) => continue 'reconnect,
        }
    }
}

/// Audio for the recognizer, resampled through a pipeline-private resampler
/// when the provider wants a different rate than the bus produces.
fn stt_audio_stream(shared: &Arc<RecognitionShared>) -> FrameStream {
    let stream = shared.bus.subscribe().into_frame_stream();
    let bus_rate = shared.bus.config().sample_rate;
    let want = shared
        .agent
        .agent()
        .stt()
        .and_then(|stt| stt.sample_rate())
        .filter(|&rate| rate != bus_rate);
    match want {
        Some(target) => resampled_stream(stream, target),
        None => stream,
    }
}

fn resampled_stream(mut stream: FrameStream, target_rate: u32) -> FrameStream {
    Box::pin(async_stream::stream! {
        let mut resampler: Option<StreamResampler> = None;
        let mut chunker = FrameChunker::with_frame_ms(target_rate, 1, FRAME_DURATION_MS);
        while let Some(frame) = stream.next().await {
            if frame.sample_rate() == target_rate {
                yield frame;
                continue;
            }
            let needs_new = resampler
                .as_ref()
                .map(|r| r.from_rate() != frame.sample_rate())
                .unwrap_or(true);
            if needs_new {
                match StreamResampler::new(frame.sample_rate(), target_rate) {
                    Ok(r) => resampler = Some(r),
                    Err(e) => {
                        tracing::error!(error = %e, "recognition resampler unavailable");
                        return;
                    }
                }
            }
            if let Some(r) = resampler.as_mut() {
                for out in chunker.push(&r.push(frame.data())) {
                    yield out;
                }
            }
        }
        if let Some(mut r) = resampler.take() {
            for out in chunker.push(&r.flush()) {
                yield out;
            }
        }
        if let Some(out) = chunker.flush() {
            yield out;
        }
    })
}

async fn handle_speech_event(shared: &Arc<RecognitionShared>, event: SpeechEvent) {
    let has_vad = shared.agent.agent().vad().is_some();
    match event {
        SpeechEvent::StartOfSpeech => {
            // With a VAD configured, speech boundaries come from it; the
            // recognizer's are ignored to avoid double signals.
            if !has_vad {
                speech_started(shared).await;
            }
        }
        SpeechEvent::EndOfSpeech => {
            if !has_vad {
                speech_ended(shared).await;
            }
        }
        SpeechEvent::InterimTranscript { alternatives } => {
            touch_activity(shared);
            if let Some(alt) = alternatives.first() {
                if !alt.text.is_empty() {
                    shared
                        .hooks
                        .on_interim_transcript(alt.text.clone(), alt.speaker_id.clone())
                        .await;
                }
            }
        }
        SpeechEvent::PreflightTranscript { alternatives } => {
            if let Some(alt) = alternatives.first() {
                if !alt.text.is_empty() {
                    shared.hooks.on_preflight_transcript(alt.text.clone()).await;
                }
            }
        }
        SpeechEvent::FinalTranscript { alternatives } => {
            let Some(alt) = alternatives.first() else {
                return;
            };
            if alt.text.is_empty() {
                return;
            }
            let speech_done = {
                let mut st = shared.state.lock().expect("turn state lock poisoned");
                if st.transcript.is_empty() {
                    st.transcript = alt.text.clone();
                } else {
                    st.transcript.push(' ');
                    st.transcript.push_str(&alt.text);
                }
                st.last_final_at = Some(Instant::now());
                st.last_activity_at = Instant::now();
                !st.speaking
            };
            shared
                .hooks
                .on_final_transcript(alt.text.clone(), alt.speaker_id.clone())
                .await;
            // While the user is still speaking the commit waits for
            // end-of-speech; a transcript landing after it (re)schedules.
            if speech_done && shared.options.turn_detection != TurnDetection::Manual {
                schedule_commit(shared).await;
            }
        }
        SpeechEvent::RecognitionUsage { audio_duration } => {
            shared.hooks.on_recognition_usage(audio_duration).await;
        }
    }
}

// -- VAD path --

async fn vad_task(shared: Arc<RecognitionShared>, token: CancellationToken) {
    let Some(vad) = shared.agent.agent().vad() else {
        return;
    };
    let audio = shared.bus.subscribe().into_frame_stream();
    let mut events = match vad.stream(audio).await {
        Ok(events) => events,
        Err(e) => {
            tracing::error!(error = %e, "voice activity detector failed to start");
            shared
                .hooks
                .on_recognition_error(ErrorEvent {
                    source: ErrorSource::Vad,
                    recoverable: false,
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            next = events.next() => match next {
                Some(Ok(event)) => handle_vad_event(&shared, event).await,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "voice activity detector error");
                }
                None => return,
            }
        }
    }
}

async fn handle_vad_event(shared: &Arc<RecognitionShared>, event: parley_vad::VadEvent) {
    match event {
        parley_vad::VadEvent::StartOfSpeech => speech_started(shared).await,
        parley_vad::VadEvent::InferenceDone {
            probability,
            speech_duration,
        } => {
            touch_activity(shared);
            shared
                .hooks
                .on_vad_inference_done(probability, speech_duration)
                .await;
        }
        parley_vad::VadEvent::EndOfSpeech => speech_ended(shared).await,
    }
}

async fn speech_started(shared: &Arc<RecognitionShared>) {
    {
        let mut st = shared.state.lock().expect("turn state lock poisoned");
        st.speaking = true;
        st.last_activity_at = Instant::now();
        // The user resumed; cancel any pending commit.
        st.deadline = None;
    }
    shared.eot_wake.notify_one();
    set_user_state(shared, UserState::Speaking).await;
    shared.hooks.on_start_of_speech().await;
}

async fn speech_ended(shared: &Arc<RecognitionShared>) {
    {
        let mut st = shared.state.lock().expect("turn state lock poisoned");
        st.speaking = false;
        st.end_of_speech_at = Some(Instant::now());
        st.last_activity_at = Instant::now();
    }
    set_user_state(shared, UserState::Listening).await;
    shared.hooks.on_end_of_speech().await;
    if shared.options.turn_detection != TurnDetection::Manual {
        schedule_commit(shared).await;
    }
}

// -- End-of-turn policy --

async fn schedule_commit(shared: &Arc<RecognitionShared>) {
    let (transcript, end_of_speech_at, last_final_at) = {
        let st = shared.state.lock().expect("turn state lock poisoned");
        (
            st.transcript.clone(),
            st.end_of_speech_at,
            st.last_final_at,
        )
    };
    if transcript.is_empty() {
        // Nothing transcribed yet; the final transcript will reschedule.
        return;
    }

    let mut delay = endpointing_delay(
        shared.options.min_endpointing_delay,
        shared.options.max_endpointing_delay,
        &transcript,
    );

    if shared.options.turn_detection == TurnDetection::RealtimeLlm {
        if let Some(detector) = shared.agent.agent().turn_detector() {
            match detector.predict_end_of_turn(&transcript).await {
                Ok(prediction) if !prediction.is_complete() => {
                    delay = shared.options.max_endpointing_delay;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "turn predictor failed, using timing only"),
            }
        }
    }

    // A final transcript close to end-of-speech anchors the timer at
    // end-of-speech (the shorter wait); a late straggler restarts it from
    // its own arrival.
    let anchor = match (end_of_speech_at, last_final_at) {
        (Some(eos), Some(fin)) => {
            if fin.saturating_duration_since(eos) <= LATE_TRANSCRIPT_TOLERANCE {
                eos
            } else {
                fin
            }
        }
        (Some(eos), None) => eos,
        (None, Some(fin)) => fin,
        (None, None) => return,
    };

    {
        let mut st = shared.state.lock().expect("turn state lock poisoned");
        st.deadline = Some(anchor + delay);
    }
    shared.eot_wake.notify_one();
}

async fn end_of_turn_task(shared: Arc<RecognitionShared>, token: CancellationToken) {
    loop {
        let deadline = {
            let st = shared.state.lock().expect("turn state lock poisoned");
            st.deadline
        };
        match deadline {
            None => {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = shared.eot_wake.notified() => {}
                }
            }
            Some(at) => {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = shared.eot_wake.notified() => {}
                    _ = tokio::time::sleep_until(at) => {
                        commit_turn(&shared, false).await;
                    }
                }
            }
        }
    }
}

async fn commit_turn(shared: &Arc<RecognitionShared>, forced: bool) {
    let info = {
        let mut st = shared.state.lock().expect("turn state lock poisoned");
        st.deadline = None;
        if st.speaking && !forced {
            return;
        }
        if st.transcript.is_empty() {
            return;
        }
        let now = Instant::now();
        let transcription_delay = match (st.end_of_speech_at, st.last_final_at) {
            (Some(eos), Some(fin)) => fin.saturating_duration_since(eos),
            _ => Duration::ZERO,
        };
        let end_of_utterance_delay = st
            .end_of_speech_at
            .or(st.last_final_at)
            .map(|from| now.saturating_duration_since(from))
            .unwrap_or(Duration::ZERO);
        EndOfTurnInfo {
            new_transcript: st.transcript.clone(),
            transcription_delay,
            end_of_utterance_delay,
        }
    };

    let committed = shared.hooks.on_end_of_turn(info).await;
    if committed {
        let mut st = shared.state.lock().expect("turn state lock poisoned");
        st.transcript.clear();
        st.last_final_at = None;
        st.end_of_speech_at = None;
    }
}

// -- User-state tracking --

fn touch_activity(shared: &Arc<RecognitionShared>) {
    let mut st = shared.state.lock().expect("turn state lock poisoned");
    st.last_activity_at = Instant::now();
}

async fn set_user_state(shared: &Arc<RecognitionShared>, state: UserState) {
    let changed = {
        let mut st = shared.state.lock().expect("turn state lock poisoned");
        if st.user_state == state {
            false
        } else {
            st.user_state = state;
            true
        }
    };
    if changed {
        shared.hooks.on_user_state_changed(state).await;
    }
}

async fn away_task(shared: Arc<RecognitionShared>, token: CancellationToken) {
    let Some(timeout) = shared.options.user_away_timeout else {
        return;
    };
    loop {
        let wake_at = {
            let st = shared.state.lock().expect("turn state lock poisoned");
            st.last_activity_at + timeout
        };
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep_until(wake_at) => {}
        }
        let idle = {
            let st = shared.state.lock().expect("turn state lock poisoned");
            !st.speaking && st.last_activity_at.elapsed() >= timeout
        };
        if idle {
            set_user_state(&shared, UserState::Away).await;
        }
    }
}

//! The reply pipeline: one invocation per agent turn step.
//!
//! LLM chunks tee into three sinks (synthesis audio, forwarded transcript
//! text, tool execution). Joins are interruption-aware: the speech handle's
//! flag is re-checked at every await point, and an interruption cancels the
//! provider streams, drains the playback sink, and records exactly the text
//! the listener heard.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parley_chat::{ChatContext, ChatItem, ChatMessage, ChatRole};
use parley_events::{
    AgentState, ErrorEvent, ErrorSource, MetricsEnvelope, ReplyMetrics, SessionEvent,
    ToolExecutionRecord,
};
use parley_llm::{ChatOptions, CompletionUsage, ToolCallAccumulator, ToolChoice};
use parley_task::{CancellationToken, SpawnedTask, WaitGroup};
use parley_tts::TtsEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::activity::ActivityShared;
use crate::agent::AgentCore;
use crate::options::REPLY_TASK_CANCEL_TIMEOUT;
use crate::playback::PlaybackSink;
use crate::session::AgentSession;
use crate::speech_handle::SpeechHandle;
use crate::tools::{ToolExecution, ToolExecutor};

/// What one reply step produces speech from.
pub(crate) enum ReplyPlan {
    /// A full model step over a context snapshot.
    Llm {
        chat_ctx: ChatContext,
        instructions: Option<String>,
        tool_choice: ToolChoice,
    },
    /// A fixed utterance (`session.say`); no model, no tools.
    Verbatim { text: String },
}

#[derive(Default)]
struct GenerationData {
    llm_id: Option<String>,
    /// Accumulated LLM text, in emission order.
    text: String,
    /// Text actually forwarded to transcript consumers.
    forwarded: String,
    usage: Option<CompletionUsage>,
    first_token_at: Option<Instant>,
    first_frame_at: Option<Instant>,
}

type Gen = Arc<Mutex<GenerationData>>;

/// Marks the handle's playout and generation futures resolved on every exit
/// path, including panics.
struct DoneGuard {
    handle: SpeechHandle,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.handle.mark_generation_done(self.handle.step_index());
        self.handle.mark_playout_done();
    }
}

pub(crate) async fn run_reply(
    activity: Arc<ActivityShared>,
    handle: SpeechHandle,
    plan: ReplyPlan,
    token: CancellationToken,
) {
    let _done = DoneGuard {
        handle: handle.clone(),
    };
    let Some(session) = activity.session() else {
        return;
    };
    if handle.interrupted() {
        return;
    }

    let started_at = Utc::now();
    let reply_start = Instant::now();
    let gen: Gen = Arc::new(Mutex::new(GenerationData::default()));

    session.set_agent_state(AgentState::Thinking);

    let (base_ctx, original_choice, verbatim) = match plan {
        ReplyPlan::Llm {
            chat_ctx,
            instructions,
            tool_choice,
        } => (Some((chat_ctx, instructions)), tool_choice, None),
        ReplyPlan::Verbatim { text } => (None, ToolChoice::None, Some(text)),
    };

    let sink = session.playback_sink();
    let audio_enabled = sink.is_some() && activity.agent.agent().tts().is_some();

    // Mechanical cancel for every provider stream of this reply.
    let abort = token.child_token();
    // `stages` tracks every sub-task for the structured cancellation join;
    // `text_stages` tracks only the text-producing ones (source, forward,
    // synthesis), whose completion marks the generation done.
    let stages = WaitGroup::new();
    let text_stages = WaitGroup::new();

    let (tts_tx, tts_rx) = mpsc::channel::<String>(256);
    let (fwd_tx, fwd_rx) = mpsc::channel::<String>(256);
    let (tool_tx, tool_rx) = mpsc::channel::<parley_chat::FunctionCall>(32);

    // -- Source stage: model stream or fixed text --
    match &verbatim {
        Some(text) => {
            let text = text.clone();
            let gen = gen.clone();
            let guard = (stages.add(), text_stages.add());
            let send_tts = audio_enabled;
            SpawnedTask::spawn_child(&abort, move |_t| async move {
                let _guard = guard;
                {
                    let mut g = gen.lock().expect("generation state poisoned");
                    g.first_token_at = Some(Instant::now());
                    g.text = text.clone();
                }
                if send_tts {
                    let _ = tts_tx.send(text.clone()).await;
                }
                let _ = fwd_tx.send(text).await;
                drop(tool_tx);
            });
        }
        None => {
            let (chat_ctx, instructions) = base_ctx
                .as_ref()
                .map(|(ctx, instr)| (ctx, instr.clone()))
                .expect("llm plan carries a context");
            let mut llm_ctx = chat_ctx.copy();
            if let Some(instructions) = instructions {
                let mut message = ChatMessage::new(ChatRole::System, instructions);
                message.created_at = started_at;
                let _ = llm_ctx.insert(ChatItem::Message(message));
            }
            let specs = activity.agent.agent().tool_specs();
            let options = ChatOptions {
                tool_choice: original_choice.clone(),
            };
            let open = tokio::select! {
                _ = token.cancelled() => return,
                open = activity.agent.llm_node(llm_ctx.view(), specs, options) => open,
            };
            let mut stream = match open {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "language model request failed");
                    session.emit(SessionEvent::Error {
                        error: ErrorEvent {
                            source: ErrorSource::Llm,
                            recoverable: e.recoverable(),
                            message: e.to_string(),
                        },
                    });
                    return;
                }
            };

            let gen = gen.clone();
            let session = session.clone();
            let guard = (stages.add(), text_stages.add());
            let send_tts = audio_enabled;
            SpawnedTask::spawn_child(&abort, move |t| async move {
                let _guard = guard;
                let mut accumulator = ToolCallAccumulator::new();
                loop {
                    tokio::select! {
                        _ = t.cancelled() => break,
                        next = stream.next() => match next {
                            Some(Ok(chunk)) => {
                                let delta = {
                                    let mut g = gen.lock().expect("generation state poisoned");
                                    if g.llm_id.is_none() {
                                        g.llm_id = Some(chunk.id.clone());
                                    }
                                    if let Some(usage) = chunk.usage {
                                        g.usage = Some(usage);
                                    }
                                    chunk.delta
                                };
                                let Some(delta) = delta else { continue };
                                if let Some(content) = delta.content {
                                    {
                                        let mut g = gen.lock().expect("generation state poisoned");
                                        if g.first_token_at.is_none() {
                                            g.first_token_at = Some(Instant::now());
                                        }
                                        g.text.push_str(&content);
                                    }
                                    if send_tts {
                                        let _ = tts_tx.send(content.clone()).await;
                                    }
                                    let _ = fwd_tx.send(content).await;
                                }
                                for delta in delta.tool_calls {
                                    if let Some(done) = accumulator.push(delta) {
                                        let call = parley_chat::FunctionCall::new(
                                            done.call_id,
                                            done.name,
                                            done.arguments,
                                        );
                                        let _ = tool_tx.send(call).await;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                tracing::error!(error = %e, "language model stream failed");
                                session.emit(SessionEvent::Error {
                                    error: ErrorEvent {
                                        source: ErrorSource::Llm,
                                        recoverable: e.recoverable(),
                                        message: e.to_string(),
                                    },
                                });
                                break;
                            }
                            None => break,
                        }
                    }
                }
                for done in accumulator.finish() {
                    let call =
                        parley_chat::FunctionCall::new(done.call_id, done.name, done.arguments);
                    let _ = tool_tx.send(call).await;
                }
            });
        }
    }

    // -- Transcript forwarding stage --
    {
        let agent = activity.agent.clone();
        let session = session.clone();
        let handle = handle.clone();
        let gen = gen.clone();
        let guard = (stages.add(), text_stages.add());
        SpawnedTask::spawn_child(&abort, move |t| async move {
            let _guard = guard;
            let mut rx = fwd_rx;
            let input: parley_tts::TextStream = Box::pin(async_stream::stream! {
                while let Some(chunk) = rx.recv().await {
                    yield chunk;
                }
            });
            let mut out = agent.transcription_node(input).await;
            // No text leaves before the scheduler grants playout rights.
            if handle
                .wait_if_not_interrupted(handle.wait_for_authorization())
                .await
                .is_err()
            {
                return;
            }
            let mut forwarder = session.transcript_forwarder();
            let mut first = true;
            loop {
                tokio::select! {
                    _ = t.cancelled() => break,
                    next = out.next() => match next {
                        Some(chunk) => {
                            if first && !audio_enabled {
                                session.set_agent_state(AgentState::Speaking);
                                first = false;
                            }
                            forwarder.write(&chunk).await;
                            gen.lock().expect("generation state poisoned").forwarded =
                                forwarder.accumulated().to_string();
                        }
                        None => break,
                    }
                }
            }
            let forwarded = forwarder.finish().await;
            gen.lock().expect("generation state poisoned").forwarded = forwarded;
        });
    }

    // -- Synthesis stage --
    if audio_enabled {
        let agent = activity.agent.clone();
        let session = session.clone();
        let handle = handle.clone();
        let gen = gen.clone();
        let sink = sink.clone().expect("audio_enabled implies a sink");
        let guard = (stages.add(), text_stages.add());
        SpawnedTask::spawn_child(&abort, move |t| async move {
            let _guard = guard;
            let mut rx = tts_rx;
            let input: parley_tts::TextStream = Box::pin(async_stream::stream! {
                while let Some(chunk) = rx.recv().await {
                    yield chunk;
                }
            });
            let mut audio = match agent.tts_node(input).await {
                Ok(audio) => audio,
                Err(e) => {
                    tracing::error!(error = %e, "speech synthesis failed, reply continues text-only");
                    session.emit(SessionEvent::Error {
                        error: ErrorEvent {
                            source: ErrorSource::Tts,
                            recoverable: e.recoverable(),
                            message: e.to_string(),
                        },
                    });
                    return;
                }
            };
            let mut authorized = false;
            loop {
                tokio::select! {
                    _ = t.cancelled() => break,
                    next = audio.next() => match next {
                        Some(Ok(TtsEvent::Audio(frame))) => {
                            if !authorized {
                                // Gate: no audio is captured until the
                                // scheduler authorizes this utterance.
                                if handle
                                    .wait_if_not_interrupted(handle.wait_for_authorization())
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                                authorized = true;
                            }
                            {
                                let mut g = gen.lock().expect("generation state poisoned");
                                if g.first_frame_at.is_none() {
                                    g.first_frame_at = Some(Instant::now());
                                }
                            }
                            session.set_agent_state(AgentState::Speaking);
                            sink.capture_frame(frame).await;
                        }
                        Some(Ok(TtsEvent::Timing(word))) => {
                            sink.push_timed_transcript(std::slice::from_ref(&word));
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "synthesis stream error");
                            session.emit(SessionEvent::Error {
                                error: ErrorEvent {
                                    source: ErrorSource::Tts,
                                    recoverable: e.recoverable(),
                                    message: e.to_string(),
                                },
                            });
                            break;
                        }
                        None => break,
                    }
                }
            }
        });
    } else {
        drop(tts_rx);
    }

    // -- Tool execution stage --
    let executor = ToolExecutor::new(
        session.clone(),
        handle.clone(),
        activity.agent.agent().tools(),
    );
    let _first_tool_started = executor.first_started();
    let tool_task: SpawnedTask<Vec<ToolExecution>> = {
        let guard = stages.add();
        SpawnedTask::spawn_child(&abort, move |t| async move {
            let _guard = guard;
            executor.run(tool_rx, t).await
        })
    };

    // -- Join: text stages first, then tools, then playout --
    if handle
        .wait_if_not_interrupted(text_stages.wait_idle())
        .await
        .is_err()
    {
        finish_interrupted(
            &session, &handle, &gen, &sink, audio_enabled, &abort, &stages, started_at,
            reply_start,
        )
        .await;
        return;
    }
    // The spoken output of this step is complete; tools awaiting it may
    // proceed even while their siblings still run.
    handle.mark_generation_done(handle.step_index());

    let executions = match handle.wait_if_not_interrupted(tool_task.join()).await {
        Ok(Some(executions)) => executions,
        Ok(None) => Vec::new(),
        Err(_) => {
            finish_interrupted(
                &session, &handle, &gen, &sink, audio_enabled, &abort, &stages, started_at,
                reply_start,
            )
            .await;
            return;
        }
    };

    let had_audio = gen
        .lock()
        .expect("generation state poisoned")
        .first_frame_at
        .is_some();
    if audio_enabled && had_audio {
        let playout = {
            let sink = sink.as_ref().expect("audio_enabled implies a sink");
            sink.flush();
            handle.wait_if_not_interrupted(sink.wait_for_playout()).await
        };
        if playout.is_err() {
            finish_interrupted(
                &session, &handle, &gen, &sink, audio_enabled, &abort, &stages, started_at,
                reply_start,
            )
            .await;
            return;
        }
    }

    // -- Non-interrupted completion --
    let (text, llm_id) = {
        let g = gen.lock().expect("generation state poisoned");
        (g.text.clone(), g.llm_id.clone())
    };
    let mut assistant_item = None;
    if !text.is_empty() {
        let item = assistant_message(llm_id, text, false, started_at);
        if session.commit_item(item.clone()).is_ok() {
            assistant_item = Some(item);
        }
    }
    emit_reply_metrics(&session, &handle, &gen, reply_start, false);

    handle_tool_outcomes(
        &activity,
        &session,
        &handle,
        base_ctx.map(|(ctx, _)| ctx),
        assistant_item,
        executions,
        original_choice,
        started_at,
    )
    .await;
}

/// The interruption critical path: abort providers, structured-join the
/// stages under a timeout, drain the sink, and record the truncated
/// transcript.
#[allow(clippy::too_many_arguments)]
async fn finish_interrupted(
    session: &AgentSession,
    handle: &SpeechHandle,
    gen: &Gen,
    sink: &Option<Arc<PlaybackSink>>,
    audio_enabled: bool,
    abort: &CancellationToken,
    stages: &WaitGroup,
    started_at: DateTime<Utc>,
    reply_start: Instant,
) {
    abort.cancel();
    if tokio::time::timeout(REPLY_TASK_CANCEL_TIMEOUT, stages.wait_idle())
        .await
        .is_err()
    {
        tracing::warn!(speech_id = %handle.id(), "reply stages did not stop in time, abandoning");
    }

    let (had_frames, accumulated, forwarded_text_only, llm_id) = {
        let g = gen.lock().expect("generation state poisoned");
        (
            g.first_frame_at.is_some(),
            g.text.clone(),
            g.forwarded.clone(),
            g.llm_id.clone(),
        )
    };

    let forwarded = if audio_enabled {
        match sink {
            Some(sink) => {
                sink.clear_buffer();
                let event = sink.wait_for_playout().await;
                if !had_frames {
                    // The user heard nothing at all.
                    String::new()
                } else if let Some(synchronized) = event.synchronized_transcript {
                    synchronized
                } else {
                    // Best-effort approximation without word timings.
                    accumulated
                }
            }
            None => String::new(),
        }
    } else {
        forwarded_text_only
    };

    if !forwarded.is_empty() {
        let item = assistant_message(llm_id, forwarded, true, started_at);
        let _ = session.commit_item(item);
    }
    emit_reply_metrics(session, handle, gen, reply_start, true);
}

fn assistant_message(
    llm_id: Option<String>,
    text: String,
    interrupted: bool,
    created_at: DateTime<Utc>,
) -> ChatItem {
    let mut message = ChatMessage::new(ChatRole::Assistant, text);
    if let Some(id) = llm_id {
        message.id = id;
    }
    message.interrupted = interrupted;
    message.created_at = created_at;
    ChatItem::Message(message)
}

fn emit_reply_metrics(
    session: &AgentSession,
    handle: &SpeechHandle,
    gen: &Gen,
    reply_start: Instant,
    interrupted: bool,
) {
    let g = gen.lock().expect("generation state poisoned");
    let elapsed_ms =
        |at: Option<Instant>| at.map(|t| t.saturating_duration_since(reply_start).as_millis() as u64);
    session.emit(SessionEvent::MetricsCollected {
        metrics: MetricsEnvelope::Reply(ReplyMetrics {
            speech_id: handle.id().to_string(),
            time_to_first_token_ms: elapsed_ms(g.first_token_at),
            time_to_first_frame_ms: elapsed_ms(g.first_frame_at),
            prompt_tokens: g.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            completion_tokens: g.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            interrupted,
        }),
    });
}

/// After a clean join: record tool calls/outputs in history and decide on a
/// recursive follow-up step or an agent handoff.
#[allow(clippy::too_many_arguments)]
async fn handle_tool_outcomes(
    activity: &Arc<ActivityShared>,
    session: &AgentSession,
    handle: &SpeechHandle,
    base_ctx: Option<ChatContext>,
    assistant_item: Option<ChatItem>,
    executions: Vec<ToolExecution>,
    original_choice: ToolChoice,
    started_at: DateTime<Utc>,
) {
    if executions.is_empty() {
        return;
    }

    let mut committed_items: Vec<ChatItem> = Vec::new();
    let mut records: Vec<ToolExecutionRecord> = Vec::new();
    let mut handoff: Option<Arc<dyn AgentCore>> = None;
    let mut reply_required = false;

    for execution in &executions {
        let mut call = execution.call.clone();
        call.created_at = started_at;
        let call_item = ChatItem::FunctionCall(call.clone());
        if session.commit_item(call_item.clone()).is_ok() {
            committed_items.push(call_item);
        }
        if let Some(output) = &execution.output {
            let mut output = output.clone();
            output.created_at = started_at;
            let output_item = ChatItem::FunctionCallOutput(output.clone());
            if session.commit_item(output_item.clone()).is_ok() {
                committed_items.push(output_item);
            }
            records.push(ToolExecutionRecord { call, output });
            if execution.reply_required {
                reply_required = true;
            }
        }
        if let Some(agent) = &execution.handoff {
            if handoff.is_some() {
                tracing::error!(
                    call_id = %execution.call.call_id,
                    "multiple agent handoffs returned in one reply step, ignoring extras"
                );
            } else {
                handoff = Some(agent.clone());
            }
        }
    }

    session.emit(SessionEvent::FunctionToolsExecuted {
        executions: records,
    });

    let handing_off = handoff.is_some();
    if let Some(new_agent) = handoff {
        let session = session.clone();
        // The swap drains this activity; it must outlive this reply task.
        tokio::spawn(async move {
            session.update_agent(new_agent).await;
        });
    }

    if !reply_required {
        return;
    }
    if handle.step_index() >= activity.options.max_tool_steps {
        tracing::warn!(
            step_index = handle.step_index(),
            max_tool_steps = activity.options.max_tool_steps,
            "tool outputs want a reply but the step bound is reached"
        );
        return;
    }
    let Some(mut ctx) = base_ctx else {
        // Verbatim speech has no model context to recurse over.
        return;
    };
    if let Some(item) = assistant_item {
        let _ = ctx.insert(item);
    }
    for item in committed_items {
        let _ = ctx.insert(item);
    }

    // Never `required` or a specific function here: that would loop.
    let tool_choice = if handing_off || activity.is_draining() || original_choice == ToolChoice::None
    {
        ToolChoice::None
    } else {
        ToolChoice::Auto
    };

    session.set_agent_state(AgentState::Thinking);
    let child = SpeechHandle::child(handle);
    if let Err(e) = activity.spawn_reply_step(
        child,
        ReplyPlan::Llm {
            chat_ctx: ctx,
            instructions: None,
            tool_choice,
        },
    ) {
        tracing::warn!(error = %e, "could not schedule tool follow-up reply");
    }
}

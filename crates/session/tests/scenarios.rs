//! End-to-end conversation scenarios over scripted providers.
//!
//! Everything runs on the paused tokio clock: provider scripts, endpointing
//! timers and playback pacing all advance through virtual time, so these
//! tests are fast and deterministic.

mod support;

use std::sync::Arc;
use std::time::Duration;

use parley_events::{AgentState, InMemoryEventBus, SessionEvent, SpeechOrigin};
use parley_session::{Agent, AgentSession, SessionOptions};
use parley_stt::{SpeechData, SpeechEvent};
use parley_tts::TimedString;
use parley_turn::TurnDetection;
use parley_vad::VadEvent;
use serde_json::json;
use support::*;

/// Route runtime logs through the test harness; `RUST_LOG` filters apply.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn options() -> SessionOptions {
    init_tracing();
    SessionOptions {
        user_away_timeout: None,
        ..SessionOptions::default()
    }
}

fn final_transcript(text: &str) -> SpeechEvent {
    SpeechEvent::FinalTranscript {
        alternatives: vec![SpeechData::new(text)],
    }
}

fn tool_output_events(events: &[SessionEvent]) -> Vec<parley_chat::FunctionCallOutput> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ConversationItemAdded {
                item: parley_chat::ChatItem::FunctionCallOutput(out),
            } => Some(out.clone()),
            _ => None,
        })
        .collect()
}

fn speech_origins(events: &[SessionEvent]) -> Vec<SpeechOrigin> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::SpeechCreated { origin, .. } => Some(*origin),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn user_question_gets_a_spoken_reply() {
    let bus = Arc::new(InMemoryEventBus::new());
    let stt = ScriptedStt::new(vec![(700, final_transcript("What's the weather?"))]);
    let vad = ScriptedVad::new(vec![
        (0, VadEvent::StartOfSpeech),
        (800, VadEvent::EndOfSpeech),
    ]);
    let llm = FakeLlm::new(vec![vec![LlmStep::Text("It's "), LlmStep::Text("sunny.")]]);
    let tts = FakeTts::new(40, 20);
    let audio = CaptureAudio::new();

    let agent = Arc::new(
        Agent::builder()
            .instructions("You are a weather assistant.")
            .stt(stt)
            .vad(vad)
            .llm(llm.clone())
            .tts(tts)
            .build(),
    );
    let session = AgentSession::new(options(), bus.clone());
    session.set_audio_output(audio.clone());
    session.start(agent).await.unwrap();

    assert!(
        wait_until(&bus, 60_000, |events| {
            let states = agent_states(events);
            !assistant_messages(events).is_empty()
                && states.contains(&AgentState::Speaking)
                && states.last() == Some(&AgentState::Listening)
        })
        .await,
        "conversation did not complete"
    );

    let events = bus.events();

    // The raw transcription event lands before the committed user item.
    let transcribed_idx = events
        .iter()
        .position(|e| matches!(e, SessionEvent::UserInputTranscribed { is_final: true, .. }))
        .expect("final transcription event");
    let user_idx = events
        .iter()
        .position(|e| {
            matches!(
                e,
                SessionEvent::ConversationItemAdded { item }
                    if item.as_message().map(|m| matches!(m.role, parley_chat::ChatRole::User)).unwrap_or(false)
            )
        })
        .expect("committed user item");
    assert!(transcribed_idx < user_idx);

    let users = user_messages(&events);
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].text_content(), "What's the weather?");

    let assistants = assistant_messages(&events);
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].text_content(), "It's sunny.");
    assert!(!assistants[0].interrupted);

    // thinking → speaking → listening, in that order.
    let states = agent_states(&events);
    let thinking = states.iter().position(|s| *s == AgentState::Thinking).unwrap();
    let speaking = states.iter().position(|s| *s == AgentState::Speaking).unwrap();
    let listening_after = states
        .iter()
        .rposition(|s| *s == AgentState::Listening)
        .unwrap();
    assert!(thinking < speaking && speaking < listening_after);

    // All 40 frames of 20ms played out.
    assert_eq!(audio.total_ms(), 800);

    let reply_metrics = events.iter().any(|e| {
        matches!(
            e,
            SessionEvent::MetricsCollected {
                metrics: parley_events::MetricsEnvelope::Reply(m)
            } if !m.interrupted
        )
    });
    assert!(reply_metrics);
}

#[tokio::test(start_paused = true)]
async fn barge_in_truncates_reply_at_word_boundary() {
    let bus = Arc::new(InMemoryEventBus::new());
    let stt = ScriptedStt::new(vec![(700, final_transcript("What's the weather?"))]);
    // The user starts talking again ~300ms into the reply's playback.
    let vad = ScriptedVad::new(vec![
        (0, VadEvent::StartOfSpeech),
        (800, VadEvent::EndOfSpeech),
        (675, VadEvent::StartOfSpeech),
        (
            10,
            VadEvent::InferenceDone {
                probability: 0.93,
                speech_duration: Duration::from_millis(600),
            },
        ),
    ]);
    let llm = FakeLlm::new(vec![vec![LlmStep::Text("It's "), LlmStep::Text("sunny.")]]);
    let tts = FakeTts::with_timings(
        40,
        20,
        vec![
            TimedString::new("It's ", 0.0, 0.150),
            TimedString::new("sunny.", 0.150, 0.350),
        ],
    );
    let audio = CaptureAudio::new();

    let agent = Arc::new(
        Agent::builder()
            .stt(stt)
            .vad(vad)
            .llm(llm)
            .tts(tts)
            .build(),
    );
    let session = AgentSession::new(options(), bus.clone());
    session.set_audio_output(audio.clone());
    session.start(agent).await.unwrap();

    assert!(
        wait_until(&bus, 60_000, |events| {
            assistant_messages(events).iter().any(|m| m.interrupted)
        })
        .await,
        "interrupted reply never recorded"
    );

    let events = bus.events();
    let assistants = assistant_messages(&events);
    assert_eq!(assistants.len(), 1);
    // Word timings pin the truncation to what was actually heard.
    assert_eq!(assistants[0].text_content(), "It's ");
    assert!(assistants[0].interrupted);

    // Roughly 300ms of audio reached the transport before the clear.
    let played = audio.total_ms();
    assert!(
        (200..=500).contains(&played),
        "played {played}ms, expected ~300ms"
    );

    let interrupted_metrics = events.iter().any(|e| {
        matches!(
            e,
            SessionEvent::MetricsCollected {
                metrics: parley_events::MetricsEnvelope::Reply(m)
            } if m.interrupted
        )
    });
    assert!(interrupted_metrics);
}

#[tokio::test(start_paused = true)]
async fn tool_call_triggers_recursive_reply() {
    let bus = Arc::new(InMemoryEventBus::new());
    let llm = FakeLlm::new(vec![
        vec![LlmStep::ToolCall {
            name: "get_weather",
            args: r#"{"location":"Paris"}"#,
        }],
        vec![LlmStep::Text("It's 22°C in Paris.")],
    ]);
    let tool = StaticTool::new(
        "get_weather",
        json!({
            "type": "object",
            "properties": { "location": { "type": "string" } },
            "required": ["location"]
        }),
        json!("22°C"),
        true,
    );

    let agent = Arc::new(Agent::builder().llm(llm.clone()).tool(tool.clone()).build());
    let session = AgentSession::new(options(), bus.clone());
    session.start(agent).await.unwrap();
    session.generate_reply(None).await.unwrap();

    assert!(
        wait_until(&bus, 60_000, |events| {
            !assistant_messages(events).is_empty()
        })
        .await,
        "follow-up reply never arrived"
    );

    let events = bus.events();
    assert_eq!(tool.invocations(), 1);
    assert_eq!(llm.completions(), 2);

    let outputs = tool_output_events(&events);
    assert_eq!(outputs.len(), 1);
    assert!(!outputs[0].is_error);
    assert_eq!(outputs[0].output, "\"22°C\"");

    // The recursive step is announced as a tool-response speech.
    assert!(speech_origins(&events).contains(&SpeechOrigin::ToolResponse));

    // The tool-only first step adds no (empty) assistant message.
    let assistants = assistant_messages(&events);
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].text_content(), "It's 22°C in Paris.");

    // History holds the call before its output.
    let view = session.chat_view();
    let call_idx = view
        .items()
        .iter()
        .position(|i| matches!(i, parley_chat::ChatItem::FunctionCall(_)))
        .unwrap();
    let output_idx = view
        .items()
        .iter()
        .position(|i| matches!(i, parley_chat::ChatItem::FunctionCallOutput(_)))
        .unwrap();
    assert!(call_idx < output_idx);
}

#[tokio::test(start_paused = true)]
async fn invalid_tool_arguments_never_reach_the_tool() {
    let bus = Arc::new(InMemoryEventBus::new());
    let llm = FakeLlm::new(vec![
        vec![
            LlmStep::Text("Sure."),
            LlmStep::ToolCall {
                name: "echo",
                args: r#"{"msg":123}"#,
            },
        ],
        vec![LlmStep::Text("Let me try that differently.")],
    ]);
    let tool = StaticTool::new(
        "echo",
        json!({
            "type": "object",
            "properties": { "msg": { "type": "string" } },
            "required": ["msg"]
        }),
        json!("echoed"),
        true,
    );

    let agent = Arc::new(Agent::builder().llm(llm).tool(tool.clone()).build());
    let session = AgentSession::new(options(), bus.clone());
    session.start(agent).await.unwrap();
    session.generate_reply(None).await.unwrap();

    assert!(
        wait_until(&bus, 60_000, |events| !tool_output_events(events).is_empty()).await,
        "validation output never recorded"
    );

    // Tool function was never invoked; the failure is data, not a crash.
    assert_eq!(tool.invocations(), 0);

    let outputs = tool_output_events(&bus.events());
    assert!(outputs[0].is_error);
    assert!(outputs[0].output.contains("msg"));

    // The reply around the failed call still completed normally.
    assert!(
        wait_until(&bus, 60_000, |events| {
            assistant_messages(events)
                .iter()
                .any(|m| m.text_content() == "Sure.")
        })
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn handoff_drains_and_starts_the_next_agent() {
    let bus = Arc::new(InMemoryEventBus::new());

    let llm_b = FakeLlm::new(vec![vec![LlmStep::Text("Hello from the billing desk.")]]);
    let (agent_b, entered) =
        EnterFlagAgent::new(Agent::builder().instructions("billing").llm(llm_b).build());

    let llm_a = FakeLlm::new(vec![vec![LlmStep::ToolCall {
        name: "transfer_to_billing",
        args: "{}",
    }]]);
    let tool = StaticTool::with_handoff(
        "transfer_to_billing",
        json!({ "type": "object" }),
        agent_b.clone(),
    );
    let agent_a = Arc::new(Agent::builder().llm(llm_a).tool(tool).build());

    let session = AgentSession::new(options(), bus.clone());
    session.start(agent_a).await.unwrap();
    session.generate_reply(None).await.unwrap();

    // The old activity drains, then the new agent's enter hook runs.
    let start = tokio::time::Instant::now();
    while !entered.load(std::sync::atomic::Ordering::SeqCst) {
        assert!(
            start.elapsed() < Duration::from_secs(60),
            "handoff never completed"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The replacement agent is live and serves replies.
    session.generate_reply(None).await.unwrap();
    assert!(
        wait_until(&bus, 60_000, |events| {
            assistant_messages(events)
                .iter()
                .any(|m| m.text_content() == "Hello from the billing desk.")
        })
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn zero_tool_steps_runs_tools_without_recursion() {
    let bus = Arc::new(InMemoryEventBus::new());
    let llm = FakeLlm::new(vec![
        vec![LlmStep::ToolCall {
            name: "get_weather",
            args: r#"{"location":"Paris"}"#,
        }],
        vec![LlmStep::Text("never spoken")],
    ]);
    let tool = StaticTool::new(
        "get_weather",
        json!({ "type": "object" }),
        json!("22°C"),
        true,
    );

    let agent = Arc::new(Agent::builder().llm(llm.clone()).tool(tool.clone()).build());
    let mut opts = options();
    opts.max_tool_steps = 0;
    let session = AgentSession::new(opts, bus.clone());
    session.start(agent).await.unwrap();
    session.generate_reply(None).await.unwrap();

    assert!(
        wait_until(&bus, 60_000, |events| {
            events
                .iter()
                .any(|e| matches!(e, SessionEvent::FunctionToolsExecuted { .. }))
        })
        .await
    );
    // Give any (incorrect) recursion time to surface.
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(tool.invocations(), 1);
    assert_eq!(llm.completions(), 1);
    assert!(assistant_messages(&bus.events()).is_empty());
    assert!(!speech_origins(&bus.events()).contains(&SpeechOrigin::ToolResponse));
}

#[tokio::test(start_paused = true)]
async fn manual_turn_detection_waits_for_commit() {
    let bus = Arc::new(InMemoryEventBus::new());
    let stt = ScriptedStt::new(vec![(100, final_transcript("Book the meeting room"))]);
    let llm = FakeLlm::new(vec![vec![LlmStep::Text("Done.")]]);

    let agent = Arc::new(Agent::builder().stt(stt).llm(llm).build());
    let mut opts = options();
    opts.turn_detection = TurnDetection::Manual;
    let session = AgentSession::new(opts, bus.clone());
    session.start(agent).await.unwrap();

    // Nothing commits on its own, no matter how long we wait.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(user_messages(&bus.events()).is_empty());

    session.commit_user_turn().await.unwrap();
    assert!(
        wait_until(&bus, 60_000, |events| {
            assistant_messages(events)
                .iter()
                .any(|m| m.text_content() == "Done.")
        })
        .await
    );
    let users = user_messages(&bus.events());
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].text_content(), "Book the meeting room");
}

#[tokio::test(start_paused = true)]
async fn uninterruptible_speech_skips_the_new_turn() {
    let bus = Arc::new(InMemoryEventBus::new());
    let stt = ScriptedStt::new(vec![
        (700, final_transcript("What's the weather?")),
        // A second utterance finishing mid-playback.
        (1300, final_transcript("Please stop now.")),
    ]);
    let vad = ScriptedVad::new(vec![
        (0, VadEvent::StartOfSpeech),
        (800, VadEvent::EndOfSpeech),
        (800, VadEvent::StartOfSpeech),
        (300, VadEvent::EndOfSpeech),
    ]);
    let llm = FakeLlm::new(vec![vec![LlmStep::Text("It's sunny.")]]);
    // 2s of audio keeps the agent speaking across the second turn.
    let tts = FakeTts::new(100, 20);
    let audio = CaptureAudio::new();

    let agent = Arc::new(
        Agent::builder()
            .stt(stt)
            .vad(vad)
            .llm(llm)
            .tts(tts)
            .build(),
    );
    let mut opts = options();
    opts.allow_interruptions = false;
    let session = AgentSession::new(opts, bus.clone());
    session.set_audio_output(audio.clone());
    session.start(agent).await.unwrap();

    assert!(
        wait_until(&bus, 60_000, |events| {
            !assistant_messages(events).is_empty()
                && agent_states(events).last() == Some(&AgentState::Listening)
        })
        .await
    );
    tokio::time::sleep(Duration::from_secs(2)).await;

    let events = bus.events();
    let assistants = assistant_messages(&events);
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].text_content(), "It's sunny.");
    assert!(!assistants[0].interrupted);

    // The barge-in turn was dropped: one user item, full playout.
    assert_eq!(user_messages(&events).len(), 1);
    assert_eq!(audio.total_ms(), 2000);
}

#[tokio::test(start_paused = true)]
async fn preemptive_synthesis_generates_before_the_turn_commits() {
    let bus = Arc::new(InMemoryEventBus::new());
    let stt = ScriptedStt::new(vec![(700, final_transcript("What's the weather?"))]);
    let vad = ScriptedVad::new(vec![
        (0, VadEvent::StartOfSpeech),
        (800, VadEvent::EndOfSpeech),
    ]);
    let llm = FakeLlm::new(vec![vec![LlmStep::Text("It's sunny.")]]);

    let agent = Arc::new(Agent::builder().stt(stt).vad(vad).llm(llm.clone()).build());
    let mut opts = options();
    opts.preemptive_synthesis = true;
    let session = AgentSession::new(opts, bus.clone());
    session.start(agent).await.unwrap();

    assert!(
        wait_until(&bus, 60_000, |events| {
            assistant_messages(events)
                .iter()
                .any(|m| m.text_content() == "It's sunny.")
        })
        .await
    );

    let events = bus.events();
    // Generation was kicked off on the final transcript, before the user
    // item committed, and the pregenerated reply was promoted (no second
    // completion).
    let speech_idx = events
        .iter()
        .position(|e| {
            matches!(
                e,
                SessionEvent::SpeechCreated {
                    origin: SpeechOrigin::UserTurn,
                    ..
                }
            )
        })
        .expect("user-turn speech");
    let user_idx = events
        .iter()
        .position(|e| {
            matches!(
                e,
                SessionEvent::ConversationItemAdded { item }
                    if item.as_message().map(|m| matches!(m.role, parley_chat::ChatRole::User)).unwrap_or(false)
            )
        })
        .expect("committed user item");
    assert!(speech_idx < user_idx);
    assert_eq!(llm.completions(), 1);
    assert_eq!(user_messages(&events).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn say_speaks_verbatim_and_records_history() {
    let bus = Arc::new(InMemoryEventBus::new());
    let tts = FakeTts::new(10, 20);
    let audio = CaptureAudio::new();
    let text_out = CaptureTextOutput::new();

    let agent = Arc::new(Agent::builder().tts(tts).build());
    let session = AgentSession::new(options(), bus.clone());
    session.set_audio_output(audio.clone());
    session.set_text_output(text_out.clone(), true);
    session.start(agent).await.unwrap();

    let handle = session.say("Welcome aboard.").await.unwrap();
    handle.wait_for_playout().await;

    assert!(
        wait_until(&bus, 60_000, |events| {
            assistant_messages(events)
                .iter()
                .any(|m| m.text_content() == "Welcome aboard.")
        })
        .await
    );
    assert_eq!(audio.total_ms(), 200);
    assert_eq!(text_out.full_text(), "Welcome aboard.");
    assert!(
        text_out
            .records
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.closed_final),
        "transcript segment was never finalized"
    );
}

//! The parley session runtime.
//!
//! Orchestrates four pipelines per active agent session — audio ingress,
//! recognition, generation, playout — into a well-ordered conversation with
//! barge-in interruption, tool-call recursion and agent handoff.
//!
//! The pieces, roughly in data-flow order: microphone frames arrive on the
//! session's frame bus, the recognition pipeline fuses VAD and STT into
//! end-of-turn decisions, the activity scheduler serializes agent
//! utterances through [`SpeechHandle`]s, and the reply pipeline fans the
//! model's token stream into synthesis, transcript forwarding and tool
//! execution before joining on playout.

mod activity;
mod agent;
mod error;
mod io;
mod options;
mod playback;
mod recognition;
mod reply;
mod session;
mod speech_handle;
mod tools;
mod transcript;

pub use agent::{Agent, AgentBuilder, AgentCore, StopResponse};
pub use error::{Result, SessionError};
pub use io::{AudioOutput, TextOutput, TextSegmentAttributes, TextWriter};
pub use options::{SessionOptions, REPLY_TASK_CANCEL_TIMEOUT, SPEECH_PRIORITY_NORMAL};
pub use playback::{PlaybackFinishedEvent, PlaybackSink};
pub use session::AgentSession;
pub use speech_handle::{Interrupted, SpeechHandle};
pub use tools::{FunctionTool, RunContext, ToolReturn};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parley_chat::{FunctionCall, FunctionCallOutput};
use parley_llm::ToolSpec;
use parley_task::{CancellationToken, Promise, SpawnedTask};
use parley_tools::{encode_output, validate_arguments, ToolError};
use tokio::sync::mpsc;

use crate::agent::AgentCore;
use crate::session::AgentSession;
use crate::speech_handle::SpeechHandle;

/// Everything a tool function can reach while executing.
#[derive(Clone)]
pub struct RunContext {
    pub session: AgentSession,
    /// The speech step whose reply produced this call.
    pub speech: SpeechHandle,
    pub call: FunctionCall,
    /// Fires when the reply is cancelled; cooperative tools return promptly.
    pub abort: CancellationToken,
}

/// A callable tool exposed to the language model.
#[async_trait]
pub trait FunctionTool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Run with already-validated arguments. Errors become `is_error`
    /// outputs in the chat history; they never tear down the session.
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: RunContext,
    ) -> Result<ToolReturn, ToolError>;
}

/// What a tool hands back to the runtime.
pub struct ToolReturn {
    /// Raw output recorded in history (JSON-encoded; strings double-quoted).
    pub output: serde_json::Value,
    /// Whether the model should produce a spoken follow-up.
    pub reply_required: bool,
    /// Replacement agent; triggers a handoff after this reply step.
    pub handoff: Option<Arc<dyn AgentCore>>,
}

impl ToolReturn {
    /// Output the model should react to with a follow-up reply.
    pub fn reply(output: impl Into<serde_json::Value>) -> Self {
        Self {
            output: output.into(),
            reply_required: true,
            handoff: None,
        }
    }

    /// Output recorded for future context only; no follow-up generated.
    pub fn silent(output: impl Into<serde_json::Value>) -> Self {
        Self {
            output: output.into(),
            reply_required: false,
            handoff: None,
        }
    }

    /// Replace the active agent once this reply step settles.
    pub fn handoff(agent: Arc<dyn AgentCore>) -> Self {
        Self {
            output: serde_json::Value::Null,
            reply_required: false,
            handoff: Some(agent),
        }
    }

    pub fn with_handoff(mut self, agent: Arc<dyn AgentCore>) -> Self {
        self.handoff = Some(agent);
        self
    }
}

/// Outcome of one tool call. `output` is `None` only when the call was
/// abandoned mid-flight (its result is ignored).
pub(crate) struct ToolExecution {
    pub call: FunctionCall,
    pub output: Option<FunctionCallOutput>,
    pub reply_required: bool,
    pub handoff: Option<Arc<dyn AgentCore>>,
}

/// Runs the tool calls of one reply step, each as its own task.
pub(crate) struct ToolExecutor {
    session: AgentSession,
    speech: SpeechHandle,
    tools: HashMap<String, Arc<dyn FunctionTool>>,
    first_started: Promise<()>,
}

impl ToolExecutor {
    pub(crate) fn new(
        session: AgentSession,
        speech: SpeechHandle,
        tools: &[Arc<dyn FunctionTool>],
    ) -> Self {
        let mut map: HashMap<String, Arc<dyn FunctionTool>> = HashMap::new();
        for tool in tools {
            let name = tool.spec().name;
            if map.insert(name.clone(), tool.clone()).is_some() {
                tracing::warn!(tool = %name, "duplicate tool name, keeping the last one");
            }
        }
        Self {
            session,
            speech,
            tools: map,
            first_started: Promise::new(),
        }
    }

    /// Resolves the first time any call's execute body begins.
    pub(crate) fn first_started(&self) -> Promise<()> {
        self.first_started.clone()
    }

    /// Consume calls until the channel closes (or `token` fires), then join
    /// every launched call. Cancellation reaches in-flight tools through
    /// their `RunContext::abort`; tools that ignore it are abandoned by the
    /// caller's join timeout, never blocking it from here.
    pub(crate) async fn run(
        &self,
        mut calls: mpsc::Receiver<FunctionCall>,
        token: CancellationToken,
    ) -> Vec<ToolExecution> {
        let mut running: Vec<(FunctionCall, SpawnedTask<ToolExecution>)> = Vec::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = calls.recv() => match next {
                    Some(call) => {
                        tracing::debug!(tool = %call.name, call_id = %call.call_id, "tool call received");
                        let task = self.spawn_call(call.clone(), &token);
                        running.push((call, task));
                    }
                    None => break,
                }
            }
        }

        let mut executions = Vec::with_capacity(running.len());
        for (call, task) in running {
            match task.join().await {
                Some(execution) => executions.push(execution),
                None => {
                    // The tool task panicked; record it like a thrown error.
                    let output = FunctionCallOutput::new(
                        call.call_id.clone(),
                        call.name.clone(),
                        "\"tool execution panicked\"",
                        true,
                    );
                    executions.push(ToolExecution {
                        call,
                        output: Some(output),
                        reply_required: true,
                        handoff: None,
                    });
                }
            }
        }
        executions
    }

    fn spawn_call(
        &self,
        call: FunctionCall,
        parent: &CancellationToken,
    ) -> SpawnedTask<ToolExecution> {
        let tool = self.tools.get(&call.name).cloned();
        let session = self.session.clone();
        let speech = self.speech.clone();
        let first_started = self.first_started.clone();

        SpawnedTask::spawn_child(parent, move |token| async move {
            let Some(tool) = tool else {
                tracing::warn!(tool = %call.name, "model called an undeclared tool");
                return error_execution(call, "unknown tool".to_string());
            };

            let spec = tool.spec();
            let args = match validate_arguments(&spec.parameters, &call.arguments) {
                Ok(args) => args,
                Err(err) => {
                    tracing::warn!(tool = %call.name, error = %err, "tool arguments rejected");
                    return error_execution(call, err.to_string());
                }
            };

            first_started.resolve(());
            let ctx = RunContext {
                session,
                speech,
                call: call.clone(),
                abort: token.clone(),
            };
            match tool.execute(args, ctx).await {
                Ok(ret) => {
                    let output = FunctionCallOutput::new(
                        call.call_id.clone(),
                        call.name.clone(),
                        encode_output(&ret.output),
                        false,
                    );
                    ToolExecution {
                        call,
                        output: Some(output),
                        reply_required: ret.reply_required,
                        handoff: ret.handoff,
                    }
                }
                Err(err) => {
                    tracing::warn!(tool = %call.name, error = %err, "tool execution failed");
                    error_execution(call, err.to_string())
                }
            }
        })
    }
}

fn error_execution(call: FunctionCall, message: String) -> ToolExecution {
    let output = FunctionCallOutput::new(
        call.call_id.clone(),
        call.name.clone(),
        encode_output(&serde_json::Value::String(message)),
        true,
    );
    ToolExecution {
        call,
        output: Some(output),
        reply_required: true,
        handoff: None,
    }
}

use std::collections::HashMap;

use crate::ToolCallDelta;

/// A fully reassembled tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedToolCall {
    pub call_id: String,
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

#[derive(Debug, Default)]
struct PendingCall {
    name: String,
    arguments: String,
}

/// Reassembles streamed tool-call deltas.
///
/// Deltas are buffered per `call_id` (a delta without one extends the most
/// recently seen call). A call is emitted as soon as its argument text
/// parses as complete JSON; anything still pending at stream end is emitted
/// by [`finish`] so argument validation downstream can report on it.
///
/// [`finish`]: ToolCallAccumulator::finish
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    pending: HashMap<String, PendingCall>,
    order: Vec<String>,
    current: Option<String>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta; returns a call if it just became complete.
    pub fn push(&mut self, delta: ToolCallDelta) -> Option<CompletedToolCall> {
        let call_id = match delta.call_id {
            Some(id) => {
                self.current = Some(id.clone());
                id
            }
            None => self.current.clone()?,
        };

        let entry = self.pending.entry(call_id.clone()).or_insert_with(|| {
            self.order.push(call_id.clone());
            PendingCall::default()
        });
        if let Some(name) = delta.name {
            entry.name = name;
        }
        entry.arguments.push_str(&delta.arguments);

        if !entry.arguments.is_empty()
            && serde_json::from_str::<serde_json::Value>(&entry.arguments).is_ok()
        {
            let done = self.pending.remove(&call_id).expect("entry just touched");
            self.order.retain(|id| id != &call_id);
            if self.current.as_deref() == Some(call_id.as_str()) {
                self.current = None;
            }
            return Some(CompletedToolCall {
                call_id,
                name: done.name,
                arguments: done.arguments,
            });
        }
        None
    }

    /// Emit everything still pending, complete or not, in arrival order.
    pub fn finish(&mut self) -> Vec<CompletedToolCall> {
        let order = std::mem::take(&mut self.order);
        self.current = None;
        order
            .into_iter()
            .filter_map(|call_id| {
                self.pending.remove(&call_id).map(|call| {
                    if serde_json::from_str::<serde_json::Value>(&call.arguments).is_err() {
                        tracing::warn!(
                            call_id = %call_id,
                            tool = %call.name,
                            "tool call arguments incomplete at stream end"
                        );
                    }
                    CompletedToolCall {
                        call_id,
                        name: call.name,
                        arguments: call.arguments,
                    }
                })
            })
            .collect()
    }
}

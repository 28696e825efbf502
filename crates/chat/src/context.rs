use std::collections::HashSet;
use std::sync::Arc;

use crate::items::{ChatItem, ChatMessage, ChatRole};
use crate::{ChatError, Result};

/// Mutable, ordered chat history.
///
/// Item ids are unique within a context; a `FunctionCallOutput` may only be
/// inserted once a `FunctionCall` with the same `call_id` precedes it.
/// Insertion keeps items ordered by `created_at` (stable: ties keep
/// insertion order).
#[derive(Debug, Clone, Default)]
pub struct ChatContext {
    items: Vec<ChatItem>,
}

impl ChatContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an existing item sequence, preserving its order.
    pub fn with_items(items: Vec<ChatItem>) -> Result<Self> {
        let mut seen = HashSet::new();
        for item in &items {
            if !seen.insert(item.id().to_string()) {
                return Err(ChatError::DuplicateId(item.id().to_string()));
            }
        }
        Ok(Self { items })
    }

    pub fn items(&self) -> &[ChatItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ChatItem> {
        self.items.iter().find(|item| item.id() == id)
    }

    /// Insert an item at its timestamp-ordered position.
    pub fn insert(&mut self, item: ChatItem) -> Result<()> {
        if self.get(item.id()).is_some() {
            return Err(ChatError::DuplicateId(item.id().to_string()));
        }
        let position = self
            .items
            .iter()
            .rposition(|existing| existing.created_at() <= item.created_at())
            .map(|i| i + 1)
            .unwrap_or(0);

        if let ChatItem::FunctionCallOutput(output) = &item {
            let call_precedes = self.items[..position].iter().any(|existing| {
                matches!(existing, ChatItem::FunctionCall(call) if call.call_id == output.call_id)
            });
            if !call_precedes {
                return Err(ChatError::DanglingOutput(output.call_id.clone()));
            }
        }

        self.items.insert(position, item);
        Ok(())
    }

    /// Append a plain text message and return a reference to it.
    pub fn add_message(&mut self, role: ChatRole, text: impl Into<String>) -> &ChatMessage {
        let message = ChatMessage::new(role, text);
        let id = message.id.clone();
        // A freshly generated id cannot collide.
        self.insert(ChatItem::Message(message))
            .expect("fresh message id collided");
        match self.get(&id) {
            Some(ChatItem::Message(m)) => m,
            _ => unreachable!("message just inserted"),
        }
    }

    /// Deep copy for user-code edits or display snapshots.
    pub fn copy(&self) -> ChatContext {
        self.clone()
    }

    /// Immutable snapshot handed to readers.
    pub fn view(&self) -> ChatContextView {
        ChatContextView {
            items: self.items.clone().into(),
        }
    }

    /// Same length and pairwise-equivalent items (timestamps ignored).
    pub fn is_equivalent(&self, other: &ChatContext) -> bool {
        self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .zip(other.items.iter())
                .all(|(a, b)| a.is_equivalent(b))
    }
}

/// Read-only view over a chat context snapshot.
///
/// Mutation is impossible by construction; callers wanting to edit take a
/// [`ChatContext::copy`] instead.
#[derive(Debug, Clone)]
pub struct ChatContextView {
    items: Arc<[ChatItem]>,
}

impl ChatContextView {
    pub fn items(&self) -> &[ChatItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ChatItem> {
        self.items.iter().find(|item| item.id() == id)
    }

    /// Materialize a mutable copy of the snapshot.
    pub fn copy(&self) -> ChatContext {
        ChatContext {
            items: self.items.to_vec(),
        }
    }
}

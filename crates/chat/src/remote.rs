use std::collections::HashMap;

use crate::items::ChatItem;
use crate::{ChatContext, ChatError, Result};

/// Mirror of a server-authoritative item ordering.
///
/// A doubly linked list keyed by item id (links are ids, not references),
/// giving O(1) positional insert and delete without rebuilding the whole
/// context on every edit.
#[derive(Debug, Default)]
pub struct RemoteChatContext {
    nodes: HashMap<String, RemoteNode>,
    head: Option<String>,
    tail: Option<String>,
}

#[derive(Debug)]
struct RemoteNode {
    item: ChatItem,
    prev: Option<String>,
    next: Option<String>,
}

impl RemoteChatContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The latest-inserted item with this id, if present.
    pub fn get(&self, id: &str) -> Option<&ChatItem> {
        self.nodes.get(id).map(|node| &node.item)
    }

    /// Insert `item` after `previous_id`, or at the head when `None`.
    ///
    /// Inserting an id that is already present, or after an unknown id, is a
    /// protocol violation and returns an error.
    pub fn insert(&mut self, previous_id: Option<&str>, item: ChatItem) -> Result<()> {
        let id = item.id().to_string();
        if self.nodes.contains_key(&id) {
            return Err(ChatError::DuplicateId(id));
        }

        let (prev, next) = match previous_id {
            Some(prev_id) => {
                if !self.nodes.contains_key(prev_id) {
                    return Err(ChatError::UnknownId(prev_id.to_string()));
                }
                let next = self.nodes[prev_id].next.clone();
                (Some(prev_id.to_string()), next)
            }
            None => (None, self.head.clone()),
        };

        match &prev {
            Some(prev_id) => {
                self.nodes
                    .get_mut(prev_id)
                    .expect("prev node checked above")
                    .next = Some(id.clone());
            }
            None => self.head = Some(id.clone()),
        }
        match &next {
            Some(next_id) => {
                self.nodes
                    .get_mut(next_id)
                    .expect("next node linked from prev")
                    .prev = Some(id.clone());
            }
            None => self.tail = Some(id.clone()),
        }

        self.nodes.insert(id, RemoteNode { item, prev, next });
        Ok(())
    }

    /// Remove the item with this id, returning it.
    pub fn delete(&mut self, id: &str) -> Result<ChatItem> {
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| ChatError::UnknownId(id.to_string()))?;

        match &node.prev {
            Some(prev_id) => {
                self.nodes
                    .get_mut(prev_id)
                    .expect("prev node of deleted item")
                    .next = node.next.clone();
            }
            None => self.head = node.next.clone(),
        }
        match &node.next {
            Some(next_id) => {
                self.nodes
                    .get_mut(next_id)
                    .expect("next node of deleted item")
                    .prev = node.prev.clone();
            }
            None => self.tail = node.prev.clone(),
        }
        Ok(node.item)
    }

    /// Materialize the linked order into a plain context.
    pub fn to_chat_ctx(&self) -> ChatContext {
        let mut items = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.head.clone();
        while let Some(id) = cursor {
            let node = &self.nodes[&id];
            items.push(node.item.clone());
            cursor = node.next.clone();
        }
        ChatContext::with_items(items).expect("linked ids are unique by construction")
    }
}

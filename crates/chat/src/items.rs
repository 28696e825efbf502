use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fresh unique id for a chat item.
pub fn new_item_id() -> String {
    format!("item_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    Developer,
    User,
    Assistant,
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatContent {
    Text { text: String },
    Image(ImageContent),
    Audio(AudioContent),
}

impl ChatContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioContent {
    #[serde(default)]
    pub transcript: Option<String>,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: Vec<ChatContent>,
    #[serde(default)]
    pub interrupted: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            id: new_item_id(),
            role,
            content: vec![ChatContent::text(text)],
            interrupted: false,
            created_at: Utc::now(),
        }
    }

    /// Concatenation of all text parts.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ChatContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub call_id: String,
    pub name: String,
    /// JSON-encoded argument object, exactly as the model produced it.
    pub arguments: String,
    pub created_at: DateTime<Utc>,
}

impl FunctionCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: new_item_id(),
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallOutput {
    pub id: String,
    pub call_id: String,
    pub name: String,
    pub output: String,
    pub is_error: bool,
    pub created_at: DateTime<Utc>,
}

impl FunctionCallOutput {
    pub fn new(
        call_id: impl Into<String>,
        name: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            id: new_item_id(),
            call_id: call_id.into(),
            name: name.into(),
            output: output.into(),
            is_error,
            created_at: Utc::now(),
        }
    }
}

/// One entry on the conversation timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatItem {
    Message(ChatMessage),
    FunctionCall(FunctionCall),
    FunctionCallOutput(FunctionCallOutput),
}

impl ChatItem {
    pub fn id(&self) -> &str {
        match self {
            ChatItem::Message(m) => &m.id,
            ChatItem::FunctionCall(c) => &c.id,
            ChatItem::FunctionCallOutput(o) => &o.id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            ChatItem::Message(m) => m.created_at,
            ChatItem::FunctionCall(c) => c.created_at,
            ChatItem::FunctionCallOutput(o) => o.created_at,
        }
    }

    pub fn set_created_at(&mut self, at: DateTime<Utc>) {
        match self {
            ChatItem::Message(m) => m.created_at = at,
            ChatItem::FunctionCall(c) => c.created_at = at,
            ChatItem::FunctionCallOutput(o) => o.created_at = at,
        }
    }

    pub fn as_message(&self) -> Option<&ChatMessage> {
        match self {
            ChatItem::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Structural equivalence. Timestamps are for display ordering only and
    /// are ignored here.
    pub fn is_equivalent(&self, other: &ChatItem) -> bool {
        match (self, other) {
            (ChatItem::Message(a), ChatItem::Message(b)) => {
                a.id == b.id
                    && a.role == b.role
                    && a.content == b.content
                    && a.interrupted == b.interrupted
            }
            (ChatItem::FunctionCall(a), ChatItem::FunctionCall(b)) => {
                a.id == b.id
                    && a.call_id == b.call_id
                    && a.name == b.name
                    && a.arguments == b.arguments
            }
            (ChatItem::FunctionCallOutput(a), ChatItem::FunctionCallOutput(b)) => {
                a.id == b.id
                    && a.call_id == b.call_id
                    && a.name == b.name
                    && a.output == b.output
                    && a.is_error == b.is_error
            }
            _ => false,
        }
    }
}

//! Chat history data model.
//!
//! A conversation is an ordered sequence of [`ChatItem`]s on one monotonic
//! timeline: messages, function calls and function-call outputs. The mutable
//! [`ChatContext`] is owned by the runtime; readers get a [`ChatContextView`]
//! snapshot. [`RemoteChatContext`] mirrors a server-authoritative ordering
//! with O(1) id-keyed edits.

mod context;
mod items;
mod remote;

pub use context::{ChatContext, ChatContextView};
pub use items::{
    new_item_id, AudioContent, ChatContent, ChatItem, ChatMessage, ChatRole, FunctionCall,
    FunctionCallOutput,
};
pub use remote::RemoteChatContext;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    #[error("duplicate item id: {0}")]
    DuplicateId(String),
    #[error("unknown item id: {0}")]
    UnknownId(String),
    #[error("function call output references unknown call id: {0}")]
    DanglingOutput(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session has not been started")]
    NotStarted,
    #[error("session is closed")]
    Closed,
    #[error("activity is draining, no new speech accepted")]
    Draining,
    #[error(transparent)]
    Chat(#[from] parley_chat::ChatError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

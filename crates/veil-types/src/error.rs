use thiserror::Error;

/// Errors surfaced to a client as an `error` event. None of these are
/// fatal: the connection stays open and no state is mutated by the
/// failing operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("connection has no registered identity")]
    NotRegistered,

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("{user_code} is not a participant of conversation {conversation_id}")]
    NotParticipant {
        user_code: String,
        conversation_id: String,
    },

    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl RelayError {
    /// Stable machine-readable discriminant carried in the `error` event.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::NotRegistered => "NotRegistered",
            RelayError::ConversationNotFound(_) => "ConversationNotFound",
            RelayError::NotParticipant { .. } => "NotParticipant",
            RelayError::MalformedRequest(_) => "MalformedRequest",
        }
    }
}

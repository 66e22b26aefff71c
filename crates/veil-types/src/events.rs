use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::models::{Conversation, DeviceClass, Identity, Message, MessageKind, RetentionMode};

/// Commands sent FROM client TO server over the WebSocket. One variant
/// per protocol event; anything that fails to parse into this set is
/// rejected at the transport boundary and never reaches core logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Bind (or mint) a user code for this connection
    Register {
        #[serde(default)]
        user_code: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        device_type: Option<DeviceClass>,
    },

    /// Open (or re-open) a conversation with another user code
    StartConversation {
        user_code: String,
        #[serde(default)]
        message_mode: RetentionMode,
    },

    /// Append a message and fan it out to the conversation's room
    SendMessage {
        conversation_id: String,
        content: String,
        #[serde(default, rename = "type")]
        kind: MessageKind,
    },

    /// Bind this connection to a conversation's room
    JoinConversation { conversation_id: String },

    /// Fetch a conversation's history (implicitly joins its room)
    GetMessages { conversation_id: String },

    /// Fetch all conversations this identity participates in
    GetConversations,

    /// Remove a single message (sender only)
    DeleteMessage {
        message_id: String,
        conversation_id: String,
    },
}

/// Events pushed FROM server TO client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Registration succeeded; carries the bound identity
    Registered(Identity),

    /// Full live-presence list, rebroadcast on every join/leave
    UserList(Vec<Identity>),

    /// The requester's conversation summaries
    Conversations(Vec<Conversation>),

    /// A conversation was just created
    NewConversation(Conversation),

    /// An existing conversation's record (summary refresh or re-open)
    ConversationUpdated(Conversation),

    /// A message was appended to a room this connection is bound to
    NewMessage(Message),

    /// Reply to `getMessages`
    Messages {
        conversation_id: String,
        messages: Vec<Message>,
    },

    /// A message was removed from a room this connection is bound to
    MessageDeleted {
        message_id: String,
        conversation_id: String,
    },

    /// A request failed; the connection remains usable
    Error { kind: String, message: String },
}

impl ServerEvent {
    pub fn error(err: &RelayError) -> Self {
        ServerEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use veil_types::models::{Conversation, Identity, ParticipantDetail, RetentionMode};

/// Conversation records keyed by canonical id. Owns the denormalized
/// last-message summary; the message log itself lives in the store.
#[derive(Clone, Default)]
pub struct Directory {
    conversations: Arc<RwLock<HashMap<String, Conversation>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or lazily create the conversation between the initiator and
    /// a counterpart code. Returns the record plus whether it was created.
    ///
    /// An existing record is returned unchanged: the first writer's
    /// retention mode wins, re-opening never mutates anything. Participant
    /// details are cached best-effort from whoever is live right now.
    pub async fn get_or_create(
        &self,
        initiator: &Identity,
        counterpart_code: &str,
        counterpart: Option<&Identity>,
        retention_mode: RetentionMode,
    ) -> (Conversation, bool) {
        let counterpart_code = counterpart_code.to_uppercase();
        let id = Conversation::canonical_id(&initiator.user_code, &counterpart_code);

        let mut conversations = self.conversations.write().await;
        if let Some(existing) = conversations.get(&id) {
            return (existing.clone(), false);
        }

        let mut participants = [initiator.user_code.clone(), counterpart_code.clone()];
        participants.sort();

        let mut participant_details = HashMap::new();
        participant_details.insert(
            initiator.user_code.clone(),
            ParticipantDetail {
                user_code: initiator.user_code.clone(),
                name: initiator.name.clone(),
            },
        );
        if let Some(counterpart) = counterpart {
            participant_details.insert(
                counterpart.user_code.clone(),
                ParticipantDetail {
                    user_code: counterpart.user_code.clone(),
                    name: counterpart.name.clone(),
                },
            );
        }

        let conversation = Conversation {
            id: id.clone(),
            participants,
            participant_details,
            retention_mode,
            last_message: "New conversation started".to_string(),
            last_message_time: Utc::now(),
        };
        conversations.insert(id, conversation.clone());

        (conversation, true)
    }

    pub async fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(conversation_id).cloned()
    }

    /// All conversations a code participates in. Unordered; the caller
    /// sorts by `last_message_time` for presentation.
    pub async fn list_for(&self, user_code: &str) -> Vec<Conversation> {
        self.conversations
            .read()
            .await
            .values()
            .filter(|c| c.is_participant(user_code))
            .cloned()
            .collect()
    }

    /// Refresh the summary after an append. Called only by the router once
    /// the store accepted the message, so summary and log stay within one
    /// update of each other.
    pub async fn touch(
        &self,
        conversation_id: &str,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> Option<Conversation> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations.get_mut(conversation_id)?;
        conversation.last_message = last_message.to_string();
        conversation.last_message_time = at;
        Some(conversation.clone())
    }
}

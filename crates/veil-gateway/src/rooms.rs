use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

/// Room membership: which live connections receive updates for which
/// conversation. Indexed both ways so disconnect cleanup touches only the
/// rooms that connection was actually in.
#[derive(Clone, Default)]
pub struct Rooms {
    state: Arc<RwLock<RoomState>>,
}

#[derive(Default)]
struct RoomState {
    members: HashMap<String, HashSet<Uuid>>,
    joined: HashMap<Uuid, HashSet<String>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub async fn join(&self, connection_id: Uuid, conversation_id: &str) {
        let mut state = self.state.write().await;
        state
            .members
            .entry(conversation_id.to_string())
            .or_default()
            .insert(connection_id);
        state
            .joined
            .entry(connection_id)
            .or_default()
            .insert(conversation_id.to_string());
    }

    pub async fn members(&self, conversation_id: &str) -> Vec<Uuid> {
        self.state
            .read()
            .await
            .members
            .get(conversation_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove a connection from every room it joined. Empty rooms are
    /// dropped entirely.
    pub async fn remove_connection(&self, connection_id: Uuid) {
        let mut state = self.state.write().await;
        let Some(joined) = state.joined.remove(&connection_id) else {
            return;
        };
        for conversation_id in joined {
            if let Some(members) = state.members.get_mut(&conversation_id) {
                members.remove(&connection_id);
                if members.is_empty() {
                    state.members.remove(&conversation_id);
                }
            }
        }
    }
}

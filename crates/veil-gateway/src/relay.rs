use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use veil_store::{MessageLog, StoreError};
use veil_types::error::RelayError;
use veil_types::events::{ClientCommand, ServerEvent};
use veil_types::models::{Conversation, DeviceClass, Identity, MessageKind, RetentionMode};

use crate::directory::Directory;
use crate::registry::Registry;
use crate::rooms::Rooms;

/// The fan-out router. Owns the per-connection send channels and composes
/// the injected components: identity registry, conversation directory,
/// room index, and message log. Every inbound command is handled
/// run-to-completion on its connection's task.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    registry: Registry,
    directory: Directory,
    rooms: Rooms,
    log: MessageLog,

    /// Targeted per-connection channels.
    connections: RwLock<HashMap<Uuid, mpsc::UnboundedSender<ServerEvent>>>,

    /// Broadcast channel for events every connection receives (`userList`).
    broadcast_tx: broadcast::Sender<ServerEvent>,
}

impl Relay {
    pub fn new(registry: Registry, directory: Directory, rooms: Rooms, log: MessageLog) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RelayInner {
                registry,
                directory,
                rooms,
                log,
                connections: RwLock::new(HashMap::new()),
                broadcast_tx,
            }),
        }
    }

    /// Subscribe to globally-broadcast events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Register a connection's targeted channel. Called once per socket,
    /// before any command is handled.
    pub async fn attach(&self, connection_id: Uuid) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.connections.write().await.insert(connection_id, tx);
        rx
    }

    /// Tear down everything transient for a connection: live identity
    /// binding, room memberships, send channel. Conversation and message
    /// records are untouched. Presence is rebroadcast if an identity was
    /// actually bound.
    pub async fn disconnect(&self, connection_id: Uuid) {
        let identity = self.inner.registry.leave(connection_id).await;
        self.inner.rooms.remove_connection(connection_id).await;
        self.inner.connections.write().await.remove(&connection_id);

        if let Some(identity) = identity {
            info!("{} ({}) left", identity.name, identity.user_code);
            self.broadcast_user_list().await;
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Dispatch one client command. Failures are surfaced to the
    /// originating connection as an `error` event and never propagate:
    /// no handler may take down the connection, let alone the server.
    pub async fn handle_command(&self, connection_id: Uuid, command: ClientCommand) {
        let result = match command {
            ClientCommand::Register { user_code, name, device_type } => {
                self.register(connection_id, user_code, name, device_type.unwrap_or_default())
                    .await
            }
            ClientCommand::StartConversation { user_code, message_mode } => {
                self.start_conversation(connection_id, &user_code, message_mode).await
            }
            ClientCommand::SendMessage { conversation_id, content, kind } => {
                self.send_message(connection_id, &conversation_id, content, kind).await
            }
            ClientCommand::JoinConversation { conversation_id } => {
                self.join_conversation(connection_id, &conversation_id).await
            }
            ClientCommand::GetMessages { conversation_id } => {
                self.get_messages(connection_id, &conversation_id).await
            }
            ClientCommand::GetConversations => self.get_conversations(connection_id).await,
            ClientCommand::DeleteMessage { message_id, conversation_id } => {
                self.delete_message(connection_id, &message_id, &conversation_id).await
            }
        };

        if let Err(err) = result {
            debug!("command from {connection_id} failed: {err}");
            self.send_to(connection_id, ServerEvent::error(&err)).await;
        }
    }

    /// Push an event to one connection. Dead channels are ignored; the
    /// disconnect path cleans them up.
    pub async fn send_to(&self, connection_id: Uuid, event: ServerEvent) {
        let connections = self.inner.connections.read().await;
        if let Some(tx) = connections.get(&connection_id) {
            let _ = tx.send(event);
        }
    }

    // -- Handlers --

    async fn register(
        &self,
        connection_id: Uuid,
        user_code: Option<String>,
        name: Option<String>,
        device_class: DeviceClass,
    ) -> Result<(), RelayError> {
        let (identity, superseded) = self
            .inner
            .registry
            .join(connection_id, user_code, name, device_class)
            .await;

        // The old connection no longer speaks for this code.
        if let Some(old_conn) = superseded {
            self.inner.rooms.remove_connection(old_conn).await;
        }

        info!("{} ({}) registered", identity.name, identity.user_code);

        self.send_to(connection_id, ServerEvent::Registered(identity.clone())).await;
        self.broadcast_user_list().await;

        // Resync: a rejoining client gets its conversation list without an
        // extra round trip.
        let conversations = self.conversations_for(&identity.user_code).await;
        self.send_to(connection_id, ServerEvent::Conversations(conversations)).await;

        Ok(())
    }

    async fn start_conversation(
        &self,
        connection_id: Uuid,
        counterpart_code: &str,
        retention_mode: RetentionMode,
    ) -> Result<(), RelayError> {
        let initiator = self.require_identity(connection_id).await?;
        let counterpart = self.inner.registry.resolve_by_code(counterpart_code).await;

        let (conversation, created) = self
            .inner
            .directory
            .get_or_create(&initiator, counterpart_code, counterpart.as_ref(), retention_mode)
            .await;

        let event = if created {
            info!(
                "conversation {} created by {}",
                conversation.id, initiator.user_code
            );
            ServerEvent::NewConversation(conversation)
        } else {
            ServerEvent::ConversationUpdated(conversation)
        };

        self.send_to(connection_id, event.clone()).await;
        if let Some(counterpart) = counterpart {
            if counterpart.connection_id != connection_id {
                self.send_to(counterpart.connection_id, event).await;
            }
        }

        Ok(())
    }

    async fn send_message(
        &self,
        connection_id: Uuid,
        conversation_id: &str,
        content: String,
        kind: MessageKind,
    ) -> Result<(), RelayError> {
        let sender = self.require_identity(connection_id).await?;
        let conversation = self.require_conversation(conversation_id).await?;

        let message = match self
            .inner
            .log
            .append(&conversation, &sender.user_code, content, kind)
            .await
        {
            Ok(message) => message,
            Err(StoreError::NotParticipant { user_code, conversation_id }) => {
                return Err(RelayError::NotParticipant { user_code, conversation_id });
            }
            // Persistence trouble stays local: in-memory state is the
            // source of truth and the next flush rewrites everything.
            Err(e) => {
                warn!("append to {conversation_id} failed: {e}");
                return Ok(());
            }
        };

        let updated = self
            .inner
            .directory
            .touch(conversation_id, &message.content, message.created_at)
            .await
            .unwrap_or(conversation.clone());

        // Map participant codes to their current live connections and pull
        // them into the room, so a participant who reconnected under a new
        // connection id is reachable without an explicit rejoin.
        for code in &conversation.participants {
            if let Some(participant) = self.inner.registry.resolve_by_code(code).await {
                self.inner.rooms.join(participant.connection_id, conversation_id).await;
            }
        }

        for member in self.inner.rooms.members(conversation_id).await {
            self.send_to(member, ServerEvent::NewMessage(message.clone())).await;
            self.send_to(member, ServerEvent::ConversationUpdated(updated.clone())).await;
        }

        Ok(())
    }

    async fn join_conversation(
        &self,
        connection_id: Uuid,
        conversation_id: &str,
    ) -> Result<(), RelayError> {
        self.require_identity(connection_id).await?;
        self.require_conversation(conversation_id).await?;
        self.inner.rooms.join(connection_id, conversation_id).await;
        Ok(())
    }

    /// History read doubles as intent to receive live updates.
    async fn get_messages(
        &self,
        connection_id: Uuid,
        conversation_id: &str,
    ) -> Result<(), RelayError> {
        self.require_identity(connection_id).await?;
        self.require_conversation(conversation_id).await?;

        self.inner.rooms.join(connection_id, conversation_id).await;
        let messages = self.inner.log.list(conversation_id).await;
        self.send_to(
            connection_id,
            ServerEvent::Messages {
                conversation_id: conversation_id.to_string(),
                messages,
            },
        )
        .await;
        Ok(())
    }

    async fn get_conversations(&self, connection_id: Uuid) -> Result<(), RelayError> {
        let identity = self.require_identity(connection_id).await?;
        let conversations = self.conversations_for(&identity.user_code).await;
        self.send_to(connection_id, ServerEvent::Conversations(conversations)).await;
        Ok(())
    }

    async fn delete_message(
        &self,
        connection_id: Uuid,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<(), RelayError> {
        let requester = self.require_identity(connection_id).await?;
        self.require_conversation(conversation_id).await?;

        let removed = self
            .inner
            .log
            .delete(message_id, conversation_id, &requester.user_code)
            .await;

        if removed {
            let event = ServerEvent::MessageDeleted {
                message_id: message_id.to_string(),
                conversation_id: conversation_id.to_string(),
            };
            for member in self.inner.rooms.members(conversation_id).await {
                self.send_to(member, event.clone()).await;
            }
        }

        Ok(())
    }

    // -- Shared plumbing --

    async fn require_identity(&self, connection_id: Uuid) -> Result<Identity, RelayError> {
        self.inner
            .registry
            .resolve_by_connection(connection_id)
            .await
            .ok_or(RelayError::NotRegistered)
    }

    async fn require_conversation(&self, conversation_id: &str) -> Result<Conversation, RelayError> {
        self.inner
            .directory
            .get(conversation_id)
            .await
            .ok_or_else(|| RelayError::ConversationNotFound(conversation_id.to_string()))
    }

    /// Most recent activity first.
    async fn conversations_for(&self, user_code: &str) -> Vec<Conversation> {
        let mut conversations = self.inner.directory.list_for(user_code).await;
        conversations.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
        conversations
    }

    async fn broadcast_user_list(&self) {
        let users = self.inner.registry.live_users().await;
        let _ = self.inner.broadcast_tx.send(ServerEvent::UserList(users));
    }
}

mod snapshot;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use veil_types::models::{Conversation, Message, MessageKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{user_code} is not a participant of conversation {conversation_id}")]
    NotParticipant {
        user_code: String,
        conversation_id: String,
    },

    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Append-only per-conversation message log.
///
/// The full log lives in memory and is the source of truth for the life of
/// the process. Durability is a single JSON snapshot keyed by conversation
/// id: loaded in full at open, rewritten in full after every mutation. The
/// rewrite is scheduled fire-and-forget so persistence never blocks the
/// delivery path; a failed rewrite is retried implicitly by the next
/// mutation's flush, which writes everything again anyway.
#[derive(Clone)]
pub struct MessageLog {
    inner: Arc<LogInner>,
}

struct LogInner {
    path: PathBuf,
    conversations: RwLock<HashMap<String, Vec<Message>>>,
    /// Last issued message id. Ids are millisecond timestamps bumped past
    /// the previous id, so same-millisecond appends stay distinct and ordered.
    last_id: AtomicI64,
    /// Serializes snapshot writes. The snapshot is encoded under this lock,
    /// so the file on disk only ever moves forward.
    flush_lock: Mutex<()>,
}

impl MessageLog {
    /// Load the snapshot (if any) and return a ready log. Called before the
    /// server accepts connections.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conversations = snapshot::load(path)?;

        let message_count: usize = conversations.values().map(Vec::len).sum();
        let last_id = conversations
            .values()
            .flatten()
            .filter_map(|m| m.id.parse::<i64>().ok())
            .max()
            .unwrap_or(0);

        info!(
            "message log opened at {} ({} conversations, {} messages)",
            path.display(),
            conversations.len(),
            message_count
        );

        Ok(Self {
            inner: Arc::new(LogInner {
                path: path.to_path_buf(),
                conversations: RwLock::new(conversations),
                last_id: AtomicI64::new(last_id),
                flush_lock: Mutex::new(()),
            }),
        })
    }

    /// Append a message to a conversation's log. The conversation record has
    /// already been resolved by the caller; this enforces the invariant that
    /// the sender is one of its participants.
    pub async fn append(
        &self,
        conversation: &Conversation,
        sender_user_code: &str,
        content: String,
        kind: MessageKind,
    ) -> Result<Message, StoreError> {
        if !conversation.is_participant(sender_user_code) {
            return Err(StoreError::NotParticipant {
                user_code: sender_user_code.to_string(),
                conversation_id: conversation.id.clone(),
            });
        }

        let message = Message {
            id: self.next_id(),
            conversation_id: conversation.id.clone(),
            sender_user_code: sender_user_code.to_string(),
            content,
            kind,
            created_at: Utc::now(),
            delivered: false,
        };

        {
            let mut conversations = self.inner.conversations.write().await;
            conversations
                .entry(conversation.id.clone())
                .or_default()
                .push(message.clone());
        }

        self.schedule_flush();
        Ok(message)
    }

    /// Messages of one conversation in append order. Unknown ids yield an
    /// empty log, not an error.
    pub async fn list(&self, conversation_id: &str) -> Vec<Message> {
        self.inner
            .conversations
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Hard-remove a single message. Succeeds only when a message with that
    /// id exists in that conversation AND the requester is its original
    /// sender; everything else is a no-op returning `false`.
    pub async fn delete(
        &self,
        message_id: &str,
        conversation_id: &str,
        requester_user_code: &str,
    ) -> bool {
        let removed = {
            let mut conversations = self.inner.conversations.write().await;
            let Some(log) = conversations.get_mut(conversation_id) else {
                return false;
            };
            match log
                .iter()
                .position(|m| m.id == message_id && m.sender_user_code == requester_user_code)
            {
                Some(pos) => {
                    log.remove(pos);
                    true
                }
                None => false,
            }
        };

        if removed {
            self.schedule_flush();
        }
        removed
    }

    /// Rewrite the full snapshot and wait for it to land. Used at graceful
    /// shutdown; mutations go through `schedule_flush` instead.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let _guard = self.inner.flush_lock.lock().await;
        let encoded = {
            let conversations = self.inner.conversations.read().await;
            serde_json::to_vec_pretty(&*conversations)?
        };
        snapshot::write(&self.inner.path, &encoded).await?;
        Ok(())
    }

    fn schedule_flush(&self) {
        let log = self.clone();
        tokio::spawn(async move {
            if let Err(e) = log.flush().await {
                warn!("snapshot flush failed, next mutation retries: {e}");
            }
        });
    }

    fn next_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let id = match self.inner.last_id.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        }) {
            Ok(prev) | Err(prev) => now.max(prev + 1),
        };
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_types::models::RetentionMode;

    fn conversation(a: &str, b: &str) -> Conversation {
        let mut participants = [a.to_string(), b.to_string()];
        participants.sort();
        Conversation {
            id: Conversation::canonical_id(a, b),
            participants,
            participant_details: HashMap::new(),
            retention_mode: RetentionMode::Permanent,
            last_message: String::new(),
            last_message_time: Utc::now(),
        }
    }

    fn open_in(dir: &tempfile::TempDir) -> MessageLog {
        MessageLog::open(&dir.path().join("messages.json")).unwrap()
    }

    #[tokio::test]
    async fn append_preserves_call_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        let conv = conversation("AB12CD", "ZZ99YY");

        for i in 0..20 {
            log.append(&conv, "AB12CD", format!("msg {i}"), MessageKind::Text)
                .await
                .unwrap();
        }

        let messages = log.list(&conv.id).await;
        assert_eq!(messages.len(), 20);
        for (i, m) in messages.iter().enumerate() {
            assert_eq!(m.content, format!("msg {i}"));
        }
        // Ids are strictly increasing even within one millisecond
        for pair in messages.windows(2) {
            assert!(pair[0].id.parse::<i64>().unwrap() < pair[1].id.parse::<i64>().unwrap());
        }
    }

    #[tokio::test]
    async fn append_rejects_non_participant() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        let conv = conversation("AB12CD", "ZZ99YY");

        let err = log
            .append(&conv, "XX00XX", "hello".into(), MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotParticipant { .. }));
        assert!(log.list(&conv.id).await.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_exactly_one_matching_message() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        let conv = conversation("AB12CD", "ZZ99YY");

        let first = log
            .append(&conv, "AB12CD", "one".into(), MessageKind::Text)
            .await
            .unwrap();
        log.append(&conv, "ZZ99YY", "two".into(), MessageKind::Text)
            .await
            .unwrap();

        assert!(log.delete(&first.id, &conv.id, "AB12CD").await);
        let remaining = log.list(&conv.id).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "two");

        // Absent id and wrong conversation are no-ops
        assert!(!log.delete(&first.id, &conv.id, "AB12CD").await);
        assert!(!log.delete(&remaining[0].id, "AA11AA_BB22BB", "ZZ99YY").await);
    }

    // Stricter than the permissive upstream behavior: only the original
    // sender may remove a message.
    #[tokio::test]
    async fn delete_requires_original_sender() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        let conv = conversation("AB12CD", "ZZ99YY");

        let msg = log
            .append(&conv, "AB12CD", "mine".into(), MessageKind::Text)
            .await
            .unwrap();

        assert!(!log.delete(&msg.id, &conv.id, "ZZ99YY").await);
        assert_eq!(log.list(&conv.id).await.len(), 1);
        assert!(log.delete(&msg.id, &conv.id, "AB12CD").await);
    }

    #[tokio::test]
    async fn snapshot_roundtrip_reloads_identical_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        let conv = conversation("AB12CD", "ZZ99YY");

        let appended = {
            let log = MessageLog::open(&path).unwrap();
            let mut appended = Vec::new();
            for i in 0..5 {
                appended.push(
                    log.append(&conv, "AB12CD", format!("msg {i}"), MessageKind::Text)
                        .await
                        .unwrap(),
                );
            }
            log.flush().await.unwrap();
            appended
        };

        let reopened = MessageLog::open(&path).unwrap();
        let reloaded = reopened.list(&conv.id).await;
        assert_eq!(reloaded.len(), appended.len());
        for (a, b) in appended.iter().zip(&reloaded) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.content, b.content);
            assert_eq!(a.sender_user_code, b.sender_user_code);
            assert_eq!(a.created_at, b.created_at);
        }

        // New ids keep climbing past everything reloaded from disk
        let next = reopened
            .append(&conv, "ZZ99YY", "after restart".into(), MessageKind::Text)
            .await
            .unwrap();
        let max_reloaded = reloaded.iter().map(|m| m.id.parse::<i64>().unwrap()).max().unwrap();
        assert!(next.id.parse::<i64>().unwrap() > max_reloaded);
    }

    #[tokio::test]
    async fn open_without_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        assert!(log.list("AB12CD_ZZ99YY").await.is_empty());
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::sync::RwLock;
use uuid::Uuid;

use veil_types::models::{DeviceClass, Identity};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 6;

/// Maps live connections to stable user codes and back.
///
/// Possession of a code is the whole identity model: `join` never rejects a
/// code it hasn't seen before, and a join with an already-bound code
/// supersedes the previous connection's binding. At most one connection is
/// live per code at any time.
#[derive(Clone, Default)]
pub struct Registry {
    state: Arc<RwLock<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    by_conn: HashMap<Uuid, Identity>,
    /// Incremental userCode -> connectionId index, consulted by the router
    /// on every fan-out instead of rescanning all live connections.
    by_code: HashMap<String, Uuid>,
    /// Every code this process has ever bound; freshly minted codes are
    /// collision-checked against it, not just against live bindings.
    known_codes: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an identity to a connection. A missing code mints a fresh one.
    /// Returns the identity plus the connection whose binding was
    /// superseded, if any — the caller evicts that connection from its
    /// rooms, since it no longer speaks for the code.
    pub async fn join(
        &self,
        connection_id: Uuid,
        provided_code: Option<String>,
        name: Option<String>,
        device_class: DeviceClass,
    ) -> (Identity, Option<Uuid>) {
        let mut state = self.state.write().await;

        let user_code = match provided_code {
            Some(code) => code.trim().to_uppercase(),
            None => mint_code(&state),
        };

        // A connection re-registering under a new code gives up its old one.
        let previous_code = state.by_conn.get(&connection_id).map(|p| p.user_code.clone());
        if let Some(previous_code) = previous_code {
            if previous_code != user_code
                && state.by_code.get(&previous_code) == Some(&connection_id)
            {
                state.by_code.remove(&previous_code);
            }
        }

        let superseded = state
            .by_code
            .insert(user_code.clone(), connection_id)
            .filter(|old| *old != connection_id);
        if let Some(old_conn) = superseded {
            state.by_conn.remove(&old_conn);
        }

        let identity = Identity {
            user_code: user_code.clone(),
            name: name.unwrap_or_else(|| format!("User_{user_code}")),
            connection_id,
            device_class,
            last_seen: Utc::now(),
        };

        state.known_codes.insert(user_code);
        state.by_conn.insert(connection_id, identity.clone());

        (identity, superseded)
    }

    pub async fn resolve_by_connection(&self, connection_id: Uuid) -> Option<Identity> {
        self.state.read().await.by_conn.get(&connection_id).cloned()
    }

    /// Only live bindings resolve; a known but offline code yields `None`.
    pub async fn resolve_by_code(&self, user_code: &str) -> Option<Identity> {
        let state = self.state.read().await;
        let conn = state.by_code.get(&user_code.to_uppercase())?;
        state.by_conn.get(conn).cloned()
    }

    /// Drop the live binding for a connection. Guarded against clobbering a
    /// newer binding: the code index entry is only removed if it still
    /// points at this connection.
    pub async fn leave(&self, connection_id: Uuid) -> Option<Identity> {
        let mut state = self.state.write().await;
        let identity = state.by_conn.remove(&connection_id)?;
        if state.by_code.get(&identity.user_code) == Some(&connection_id) {
            state.by_code.remove(&identity.user_code);
        }
        Some(identity)
    }

    pub async fn live_users(&self) -> Vec<Identity> {
        self.state.read().await.by_conn.values().cloned().collect()
    }
}

fn mint_code(state: &RegistryState) -> String {
    let mut rng = rand::rng();
    loop {
        let code: String = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        if !state.by_code.contains_key(&code) && !state.known_codes.contains(&code) {
            return code;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn minted_codes_use_fixed_length_alphanumerics() {
        let registry = Registry::new();
        for _ in 0..50 {
            let (identity, _) = registry
                .join(Uuid::new_v4(), None, None, DeviceClass::Mobile)
                .await;
            assert_eq!(identity.user_code.len(), CODE_LEN);
            assert!(identity.user_code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
            assert_eq!(identity.name, format!("User_{}", identity.user_code));
        }
        // All fifty must be distinct: collision-checked against known codes
        assert_eq!(registry.live_users().await.len(), 50);
    }

    #[tokio::test]
    async fn provided_code_is_normalized_and_bound() {
        let registry = Registry::new();
        let conn = Uuid::new_v4();
        let (identity, superseded) = registry
            .join(conn, Some("ab12cd".into()), Some("Ada".into()), DeviceClass::Web)
            .await;
        assert_eq!(identity.user_code, "AB12CD");
        assert_eq!(identity.name, "Ada");
        assert!(superseded.is_none());

        let resolved = registry.resolve_by_code("ab12cd").await.unwrap();
        assert_eq!(resolved.connection_id, conn);
    }

    #[tokio::test]
    async fn rebind_supersedes_previous_connection() {
        let registry = Registry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        registry
            .join(first, Some("AB12CD".into()), None, DeviceClass::Mobile)
            .await;
        let (_, superseded) = registry
            .join(second, Some("AB12CD".into()), None, DeviceClass::Mobile)
            .await;

        assert_eq!(superseded, Some(first));
        assert!(registry.resolve_by_connection(first).await.is_none());
        assert_eq!(
            registry.resolve_by_code("AB12CD").await.unwrap().connection_id,
            second
        );

        // A stale leave from the superseded connection must not unbind the new one
        registry.leave(first).await;
        assert!(registry.resolve_by_code("AB12CD").await.is_some());
    }

    #[tokio::test]
    async fn leave_drops_live_binding_only() {
        let registry = Registry::new();
        let conn = Uuid::new_v4();
        registry
            .join(conn, Some("AB12CD".into()), None, DeviceClass::Mobile)
            .await;

        let left = registry.leave(conn).await.unwrap();
        assert_eq!(left.user_code, "AB12CD");
        assert!(registry.resolve_by_code("AB12CD").await.is_none());
        assert!(registry.live_users().await.is_empty());

        // The code remains a valid external identity and can rebind later
        let again = Uuid::new_v4();
        let (identity, _) = registry
            .join(again, Some("AB12CD".into()), None, DeviceClass::Mobile)
            .await;
        assert_eq!(identity.user_code, "AB12CD");
    }

    #[tokio::test]
    async fn reregistering_a_new_code_releases_the_old_one() {
        let registry = Registry::new();
        let conn = Uuid::new_v4();
        registry
            .join(conn, Some("AB12CD".into()), None, DeviceClass::Mobile)
            .await;
        registry
            .join(conn, Some("ZZ99YY".into()), None, DeviceClass::Mobile)
            .await;

        assert!(registry.resolve_by_code("AB12CD").await.is_none());
        assert_eq!(
            registry.resolve_by_code("ZZ99YY").await.unwrap().connection_id,
            conn
        );
        assert_eq!(registry.live_users().await.len(), 1);
    }
}

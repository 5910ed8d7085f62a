//! Session and Identity Management
//!
//! A session is a player's stable identity, keyed by the
//! client-persisted `userId` and never by a transport handle. Sessions
//! survive disconnects; a fresh connection binding the same identity
//! supersedes the old one, whose remaining events are then ignored.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;

use crate::network::protocol::ServerMessage;

/// Per-connection outbound channel. Unbounded so sends never await:
/// broadcasts can happen while a room lock is held, which is what
/// keeps delivery in acceptance order.
pub type Outbound = UnboundedSender<ServerMessage>;

/// Session-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// A concurrent bind superseded this connection mid-action.
    #[error("session was superseded by a newer connection")]
    SessionConflict,

    /// No session exists for the presented identity.
    #[error("unknown session")]
    UnknownSession,
}

/// One player's stable identity.
#[derive(Debug)]
pub struct Session {
    /// Client-persisted stable identifier.
    pub user_id: String,
    /// Display name (updated on every contact).
    pub username: String,
    /// Code of the room this session is in, if any.
    pub current_room: Option<String>,
    /// Bind generation. Incremented on every bind; events presented
    /// with an older epoch come from a superseded connection.
    epoch: u64,
    /// Live outbound channel, absent while disconnected.
    sender: Option<Outbound>,
}

impl Session {
    fn new(user_id: &str, username: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            username: username.to_string(),
            current_room: None,
            epoch: 0,
            sender: None,
        }
    }

    /// Current bind epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether a live connection is bound.
    pub fn is_connected(&self) -> bool {
        self.sender.is_some()
    }
}

/// Report returned by a successful (current-epoch) unbind.
#[derive(Debug, Clone)]
pub struct UnbindReport {
    /// Display name at disconnect time.
    pub username: String,
    /// The room the session was in, if any.
    pub room_id: Option<String>,
}

/// All known sessions, keyed by `userId`.
pub struct SessionMap {
    sessions: RwLock<BTreeMap<String, Arc<RwLock<Session>>>>,
}

impl SessionMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Look up a session, creating it on first contact.
    pub async fn resolve(&self, user_id: &str, username: &str) -> Arc<RwLock<Session>> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Session::new(user_id, username))))
            .clone()
    }

    /// Get a session without creating one.
    pub async fn get(&self, user_id: &str) -> Option<Arc<RwLock<Session>>> {
        let sessions = self.sessions.read().await;
        sessions.get(user_id).cloned()
    }

    /// Bind a live connection to an identity, superseding any prior
    /// connection. Returns the new bind epoch; events arriving with an
    /// older epoch must be ignored.
    pub async fn bind(&self, user_id: &str, username: &str, sender: Outbound) -> u64 {
        let session = self.resolve(user_id, username).await;
        let mut session = session.write().await;
        session.username = username.to_string();
        session.epoch += 1;
        session.sender = Some(sender);
        session.epoch
    }

    /// Release a connection on transport disconnect. A stale epoch
    /// (the connection was already superseded) is a no-op and returns
    /// `None`. The session itself survives.
    pub async fn unbind(&self, user_id: &str, epoch: u64) -> Option<UnbindReport> {
        let session = self.get(user_id).await?;
        let mut session = session.write().await;
        if session.epoch != epoch {
            return None;
        }
        session.sender = None;
        Some(UnbindReport {
            username: session.username.clone(),
            room_id: session.current_room.clone(),
        })
    }

    /// Check that an epoch is still the session's current bind.
    pub async fn verify(&self, user_id: &str, epoch: u64) -> Result<(), SessionError> {
        let session = self.get(user_id).await.ok_or(SessionError::UnknownSession)?;
        let session = session.read().await;
        if session.epoch == epoch {
            Ok(())
        } else {
            Err(SessionError::SessionConflict)
        }
    }

    /// Record which room a session is in.
    pub async fn set_room(&self, user_id: &str, room_id: Option<String>) {
        if let Some(session) = self.get(user_id).await {
            session.write().await.current_room = room_id;
        }
    }

    /// Destroy a session (explicit leave or permanent disconnect).
    pub async fn remove(&self, user_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(user_id);
    }

    /// Destroy every session bound to a deleted room.
    pub async fn remove_by_room(&self, room_id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        let candidates: Vec<Arc<RwLock<Session>>> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };
        for session in candidates {
            let session = session.read().await;
            if session.current_room.as_deref() == Some(room_id) {
                removed.push(session.user_id.clone());
            }
        }
        let mut sessions = self.sessions.write().await;
        for user_id in &removed {
            sessions.remove(user_id);
        }
        removed
    }

    /// Number of known sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no sessions are known.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}

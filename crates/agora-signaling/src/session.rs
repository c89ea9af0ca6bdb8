//! Relay session management.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Tracks connected relay clients and the calls each one follows.
pub struct SessionManager {
    /// Map of session_id → Session
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    /// Map of call_id → session ids subscribed to it (usually both devices)
    call_sessions: Arc<RwLock<HashMap<Uuid, HashSet<String>>>>,
}

pub struct Session {
    pub session_id: String,
    /// Calls this session receives dispatches for
    pub subscribed_calls: HashSet<Uuid>,
    /// Last heartbeat time
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            call_sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new session.
    pub async fn register(&self, session_id: String) {
        let session = Session {
            session_id: session_id.clone(),
            subscribed_calls: HashSet::new(),
            last_heartbeat: chrono::Utc::now(),
        };

        self.sessions.write().await.insert(session_id, session);
    }

    /// Record that a session follows a call.
    pub async fn subscribe(&self, session_id: &str, call_id: Uuid) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.subscribed_calls.insert(call_id);
        }
        self.call_sessions
            .write()
            .await
            .entry(call_id)
            .or_default()
            .insert(session_id.to_string());
    }

    pub async fn unsubscribe(&self, session_id: &str, call_id: Uuid) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.subscribed_calls.remove(&call_id);
        }
        let mut calls = self.call_sessions.write().await;
        if let Some(sessions) = calls.get_mut(&call_id) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                calls.remove(&call_id);
            }
        }
    }

    pub async fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.last_heartbeat = chrono::Utc::now();
        }
    }

    /// Remove a session and all of its subscriptions.
    pub async fn remove(&self, session_id: &str) {
        let Some(session) = self.sessions.write().await.remove(session_id) else {
            return;
        };
        let mut calls = self.call_sessions.write().await;
        for call_id in session.subscribed_calls {
            if let Some(sessions) = calls.get_mut(&call_id) {
                sessions.remove(session_id);
                if sessions.is_empty() {
                    calls.remove(&call_id);
                }
            }
        }
    }

    /// Number of sessions following a call.
    pub async fn watchers(&self, call_id: Uuid) -> usize {
        self.call_sessions
            .read()
            .await
            .get(&call_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Get total active sessions count.
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_clears_call_index() {
        let sessions = SessionManager::new();
        let call_id = Uuid::now_v7();
        sessions.register("a".into()).await;
        sessions.register("b".into()).await;
        sessions.subscribe("a", call_id).await;
        sessions.subscribe("b", call_id).await;
        assert_eq!(sessions.watchers(call_id).await, 2);

        sessions.remove("a").await;
        assert_eq!(sessions.watchers(call_id).await, 1);
        sessions.unsubscribe("b", call_id).await;
        assert_eq!(sessions.watchers(call_id).await, 0);
        assert_eq!(sessions.active_count().await, 1);
    }
}

//! Session management for multi-turn trik conversations.
//!
//! Sessions expire lazily: nothing sweeps them in the background, an expired
//! session simply stops resolving (and is dropped on the first miss).
//! Embedders that care about memory can call `cleanup()` on their own
//! schedule.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use trikgate_manifest::{
    SessionCapabilities, SessionHistoryEntry, TrikSession, DEFAULT_MAX_DURATION_MS,
    DEFAULT_MAX_HISTORY_ENTRIES,
};
use uuid::Uuid;

use crate::now_ms;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Storage for trik sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session for a trik, honoring its session capabilities.
    async fn create(&self, trik_id: &str, config: Option<&SessionCapabilities>) -> TrikSession;

    /// Resolve a session by id. Expired sessions are dropped and return
    /// `None`; a hit refreshes `last_activity_at`.
    async fn get(&self, session_id: &str) -> Option<TrikSession>;

    /// Append a history entry, evicting the oldest entries beyond the cap.
    async fn add_history(
        &self,
        session_id: &str,
        action: &str,
        input: Value,
        agent_data: Value,
        user_content: Option<Value>,
    ) -> Result<()>;

    /// Delete a session. Idempotent.
    async fn delete(&self, session_id: &str);

    /// Drop every expired session, returning how many were removed.
    async fn cleanup(&self) -> usize;
}

fn generate_session_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("sess_{}_{}", now_ms(), &random[..8])
}

struct SessionRecord {
    session: TrikSession,
    max_history: usize,
}

/// In-memory session store. Sessions do not survive a restart.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions, for monitoring.
    pub fn active_count(&self) -> usize {
        self.sessions.lock().expect("session lock poisoned").len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, trik_id: &str, config: Option<&SessionCapabilities>) -> TrikSession {
        let now = now_ms();
        let max_duration_ms = config
            .map(SessionCapabilities::max_duration_ms)
            .unwrap_or(DEFAULT_MAX_DURATION_MS);
        let max_history = config
            .map(SessionCapabilities::max_history_entries)
            .unwrap_or(DEFAULT_MAX_HISTORY_ENTRIES);

        let session = TrikSession {
            session_id: generate_session_id(),
            trik_id: trik_id.to_string(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + max_duration_ms,
            history: Vec::new(),
        };

        tracing::debug!(trik_id, session_id = %session.session_id, "session created");
        self.sessions.lock().expect("session lock poisoned").insert(
            session.session_id.clone(),
            SessionRecord { session: session.clone(), max_history },
        );
        session
    }

    async fn get(&self, session_id: &str) -> Option<TrikSession> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let record = sessions.get_mut(session_id)?;

        let now = now_ms();
        if now > record.session.expires_at {
            sessions.remove(session_id);
            return None;
        }

        record.session.last_activity_at = now;
        Some(record.session.clone())
    }

    async fn add_history(
        &self,
        session_id: &str,
        action: &str,
        input: Value,
        agent_data: Value,
        user_content: Option<Value>,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let now = now_ms();

        let live = sessions
            .get(session_id)
            .is_some_and(|record| now <= record.session.expires_at);
        if !live {
            sessions.remove(session_id);
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        let Some(record) = sessions.get_mut(session_id) else {
            return Err(SessionError::NotFound(session_id.to_string()));
        };
        record.session.last_activity_at = now;
        record.session.history.push(SessionHistoryEntry {
            timestamp: now,
            action: action.to_string(),
            input,
            agent_data,
            user_content,
        });

        // Oldest entries fall off first.
        let len = record.session.history.len();
        if len > record.max_history {
            record.session.history.drain(..len - record.max_history);
        }
        Ok(())
    }

    async fn delete(&self, session_id: &str) {
        self.sessions.lock().expect("session lock poisoned").remove(session_id);
    }

    async fn cleanup(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let now = now_ms();
        let before = sessions.len();
        sessions.retain(|_, record| now <= record.session.expires_at);
        before - sessions.len()
    }
}

//! Session storage contract

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::session::types::{Message, SessionMeta, StoredSession};

/// Durable home of session metadata and message history
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Upsert metadata; replace the message list when `messages` is present
    async fn save(&self, session: &StoredSession) -> Result<()>;

    /// Metadata of every stored session, oldest first
    async fn list(&self) -> Result<Vec<SessionMeta>>;

    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>>;

    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// Process-local store for tests and ephemeral runs
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, (SessionMeta, Vec<Message>)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored copy of a session's messages, without going through the trait
    pub fn stored_messages(&self, session_id: &str) -> Option<Vec<Message>> {
        self.sessions.lock().get(session_id).map(|(_, m)| m.clone())
    }

    pub fn stored_meta(&self, session_id: &str) -> Option<SessionMeta> {
        self.sessions.lock().get(session_id).map(|(meta, _)| meta.clone())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &StoredSession) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .entry(session.meta.id.clone())
            .or_insert_with(|| (session.meta.clone(), Vec::new()));
        entry.0 = session.meta.clone();
        if let Some(messages) = &session.messages {
            entry.1 = messages.clone();
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionMeta>> {
        let mut metas: Vec<SessionMeta> = self.sessions.lock().values().map(|(m, _)| m.clone()).collect();
        metas.sort_by_key(|m| m.created_at);
        Ok(metas)
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self.stored_messages(session_id).unwrap_or_default())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.sessions.lock().remove(session_id);
        Ok(())
    }
}

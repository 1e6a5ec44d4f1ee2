//! Session repository

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::params;

use crate::db::store::SessionStore;
use crate::db::Database;
use crate::session::types::{Message, SessionMeta, StoredSession};

/// SQLite-backed `SessionStore`
pub struct SessionRepository {
    db: Database,
}

impl SessionRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get the database reference
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Get a session's metadata by ID
    pub async fn get(&self, id: &str) -> Result<Option<SessionMeta>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare("SELECT meta FROM sessions WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;

        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                let meta = serde_json::from_str(&raw)
                    .with_context(|| format!("Corrupt metadata for session {}", id))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// List sessions of one workspace
    pub async fn list_by_workspace(&self, workspace_id: &str) -> Result<Vec<SessionMeta>> {
        let conn = self.db.lock().await;
        let mut stmt =
            conn.prepare("SELECT meta FROM sessions WHERE workspace_id = ?1 ORDER BY created_at ASC")?;
        let rows = stmt.query_map(params![workspace_id], |row| row.get::<_, String>(0))?;

        let mut metas = Vec::new();
        for raw in rows {
            metas.push(serde_json::from_str(&raw?).context("Corrupt session metadata")?);
        }
        Ok(metas)
    }

    /// Number of stored messages for a session
    pub async fn message_count(&self, session_id: &str) -> Result<usize> {
        let conn = self.db.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[async_trait]
impl SessionStore for SessionRepository {
    async fn save(&self, session: &StoredSession) -> Result<()> {
        let meta = &session.meta;
        let meta_json = serde_json::to_string(meta)?;

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sessions (id, workspace_id, parent_id, name, meta, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                workspace_id = excluded.workspace_id,
                parent_id = excluded.parent_id,
                name = excluded.name,
                meta = excluded.meta,
                updated_at = excluded.updated_at",
            params![
                meta.id,
                meta.workspace_id,
                meta.parent_id,
                meta.name,
                meta_json,
                meta.created_at,
                meta.updated_at,
            ],
        )
        .context("Failed to upsert session")?;

        if let Some(messages) = &session.messages {
            tx.execute("DELETE FROM messages WHERE session_id = ?1", params![meta.id])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO messages (session_id, seq, id, role, content, timestamp, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for (seq, message) in messages.iter().enumerate() {
                    stmt.execute(params![
                        meta.id,
                        seq as i64,
                        message.id,
                        message.role.as_str(),
                        message.content,
                        message.timestamp,
                        serde_json::to_string(message)?,
                    ])
                    .context("Failed to insert message")?;
                }
            }
        }

        tx.commit()?;
        tracing::debug!("Saved session: {}", meta.id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionMeta>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare("SELECT meta FROM sessions ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut metas = Vec::new();
        for raw in rows {
            metas.push(serde_json::from_str(&raw?).context("Corrupt session metadata")?);
        }
        Ok(metas)
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare("SELECT payload FROM messages WHERE session_id = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;

        let mut messages = Vec::new();
        for raw in rows {
            messages.push(
                serde_json::from_str(&raw?)
                    .with_context(|| format!("Corrupt message in session {}", session_id))?,
            );
        }
        Ok(messages)
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])?;
        tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])
            .context("Failed to delete session")?;
        tx.commit()?;

        tracing::debug!("Deleted session: {}", session_id);
        Ok(())
    }
}

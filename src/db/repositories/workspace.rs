//! Workspace repository

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;

/// A named container that sessions and notifications are scoped to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub root_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_workspace(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        root_path: row.get(2)?,
        created_at: parse_timestamp(&row.get::<_, String>(3)?),
        updated_at: parse_timestamp(&row.get::<_, String>(4)?),
    })
}

pub struct WorkspaceRepository {
    db: Database,
}

impl WorkspaceRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new workspace
    pub async fn create(&self, name: String, root_path: Option<String>) -> Result<Workspace> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let workspace = Workspace {
            id: id.clone(),
            name,
            root_path,
            created_at: now,
            updated_at: now,
        };

        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO workspaces (id, name, root_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                workspace.id,
                workspace.name,
                workspace.root_path,
                workspace.created_at.to_rfc3339(),
                workspace.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert workspace")?;

        tracing::debug!("Created workspace: {}", id);
        Ok(workspace)
    }

    /// Get a workspace by ID
    pub async fn get(&self, id: &str) -> Result<Option<Workspace>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, root_path, created_at, updated_at
             FROM workspaces WHERE id = ?1",
        )?;

        match stmt.query_row(params![id], row_to_workspace) {
            Ok(workspace) => Ok(Some(workspace)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to get workspace"),
        }
    }

    /// List all workspaces
    pub async fn list(&self) -> Result<Vec<Workspace>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, root_path, created_at, updated_at
             FROM workspaces ORDER BY created_at DESC",
        )?;

        let workspaces = stmt
            .query_map([], row_to_workspace)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(workspaces)
    }

    /// Delete a workspace (its sessions are left to the session store)
    pub async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute("DELETE FROM workspaces WHERE id = ?1", params![id])?;
        tracing::debug!("Deleted workspace: {}", id);
        Ok(())
    }
}

//! Application state

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::db::{Database, SessionRepository, WorkspaceRepository};
use crate::session::{BackendFactory, ClaudeBackendFactory, SessionManager};

/// Everything a front end (CLI, tool server) needs
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub session_manager: SessionManager,
}

impl AppState {
    /// Wire the engine over an open database
    pub fn new(config: Config, db: Database, factory: Arc<dyn BackendFactory>) -> Self {
        let store = Arc::new(SessionRepository::new(db.clone()));
        let session_manager = SessionManager::builder(config.engine.clone(), store, factory).build();
        Self {
            config,
            db,
            session_manager,
        }
    }

    /// Open the configured database with the Claude Code backend and load
    /// stored sessions
    pub async fn open(config: Config) -> Result<Self> {
        let db_path = config.resolve_db_path()?;
        let db = Database::new(&db_path).with_context(|| format!("Failed to open database {:?}", db_path))?;
        Self::start(config, db).await
    }

    /// Same as `open`, over an in-memory database
    pub async fn ephemeral(config: Config) -> Result<Self> {
        let db = Database::in_memory()?;
        Self::start(config, db).await
    }

    async fn start(config: Config, db: Database) -> Result<Self> {
        let factory = Arc::new(ClaudeBackendFactory::new(&config.claude));
        let state = Self::new(config, db, factory);
        let loaded = state.session_manager.load_persisted().await?;
        info!(database = %state.db.path(), sessions = loaded, "Application state ready");
        Ok(state)
    }

    pub fn workspaces(&self) -> WorkspaceRepository {
        WorkspaceRepository::new(self.db.clone())
    }

    pub fn sessions(&self) -> SessionRepository {
        SessionRepository::new(self.db.clone())
    }
}

//! Agent backend contract

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

use super::events::{AbortReason, TurnEvent};
use super::types::PermissionMode;

/// Ordered events of one turn; the stream ends when the backend has drained
pub type TurnStream = BoxStream<'static, TurnEvent>;

/// Everything a factory needs to build a backend for a session
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub session_id: String,
    pub workspace_id: String,
    pub model: Option<String>,
    pub connection: Option<String>,
    pub permission_mode: PermissionMode,
    /// Backend-side conversation to resume, if any
    pub resume_id: Option<String>,
}

/// A live connection to an agent for one session
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Start a turn and stream its events
    async fn send(&self, message: &str) -> Result<TurnStream>;

    /// Ask the in-flight turn to stop at its next checkpoint.
    /// Events already produced are still delivered before the stream ends.
    fn abort(&self, reason: AbortReason);

    /// Whether this backend can take new input mid-turn
    fn supports_steering(&self) -> bool {
        false
    }

    /// Inject input into the running turn; returns whether it was accepted
    async fn steer(&self, _message: &str) -> bool {
        false
    }

    /// Answer a permission request raised during the turn
    async fn respond_to_permission(&self, request_id: &str, allowed: bool, remember: bool) -> Result<()>;

    fn set_permission_mode(&self, _mode: PermissionMode) {}

    fn model(&self) -> Option<String>;

    /// Backend-side conversation id, once known
    fn backend_session_id(&self) -> Option<String>;
}

/// Creates backends lazily on a session's first turn (and after auth resets)
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, config: BackendConfig) -> Result<Arc<dyn AgentBackend>>;
}

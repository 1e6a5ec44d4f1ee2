//! Engine error taxonomy and crash reporting

use crate::session::events::BackendError;

/// Domain errors callers may want to match on.
///
/// These travel inside `anyhow::Error`; use `downcast_ref::<EngineError>()`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {child} is not a child of {parent}")]
    ChildNotFound { parent: String, child: String },

    #[error("Session {0} is not an orchestrator")]
    NotAnOrchestrator(String),

    #[error("Model selection is locked for session {0}")]
    ModelLocked(String),

    #[error("Invalid state for session {session}: {reason}")]
    InvalidState { session: String, reason: String },
}

impl EngineError {
    pub fn invalid_state(session: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidState {
            session: session.to_string(),
            reason: reason.into(),
        }
    }
}

/// External crash-tracking collaborator for backend/protocol errors
pub trait ErrorReporter: Send + Sync {
    fn report(&self, session_id: &str, error: &BackendError);
}

/// Default reporter: logs the full diagnostic payload
#[derive(Debug, Default, Clone)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, session_id: &str, error: &BackendError) {
        tracing::error!(
            session_id,
            code = %error.code,
            title = %error.title,
            details = ?error.details,
            "Backend error: {}",
            error.message
        );
    }
}

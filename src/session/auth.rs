//! Credential refresh and auth-request resolution

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::manager::{not_found, CredentialResponse, SessionManager, SubmitOptions};
use super::notify::EngineEvent;
use super::processor::TurnContext;
use super::types::{AuthRequestStatus, ErrorDetails, Message, MessageRole, PauseReason};
use crate::core::EngineError;

/// External credential/token service
#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Which of `sources` hold credentials that need refreshing
    async fn sources_needing_refresh(&self, sources: &[String]) -> Vec<String>;

    async fn refresh(&self, sources: &[String]) -> Result<()>;

    /// Persist a credential supplied by the user for `source`
    async fn store(&self, source: &str, credential: &str) -> Result<()>;
}

/// Service for deployments without managed credentials
#[derive(Debug, Default, Clone)]
pub struct NoopCredentials;

#[async_trait]
impl CredentialService for NoopCredentials {
    async fn sources_needing_refresh(&self, _sources: &[String]) -> Vec<String> {
        Vec::new()
    }

    async fn refresh(&self, _sources: &[String]) -> Result<()> {
        Ok(())
    }

    async fn store(&self, source: &str, _credential: &str) -> Result<()> {
        anyhow::bail!("No credential store configured for source {}", source)
    }
}

impl SessionManager {
    /// Refresh stale credentials before the turn is retried.
    ///
    /// Runs while the failed turn still holds the session, so nothing sent in
    /// the meantime can start ahead of the retry. A failed refresh turns the
    /// retry into a terminal authentication error.
    pub(crate) async fn refresh_for_retry(&self, ctx: &mut TurnContext) {
        let id = ctx.session_id.clone();
        if !self.is_current(&id, ctx.generation) {
            return;
        }
        let sources = self
            .inner
            .registry
            .with(&id, |s| s.meta.enabled_sources.clone())
            .unwrap_or_default();

        let stale = self.inner.credentials.sources_needing_refresh(&sources).await;
        if stale.is_empty() {
            return;
        }
        info!(session_id = %id, sources = ?stale, "Refreshing credentials before retry");
        if let Err(e) = self.inner.credentials.refresh(&stale).await {
            warn!(session_id = %id, "Credential refresh failed: {:#}", e);
            ctx.auth_retry = false;
            let message = Message::error(
                "Authentication failed. Please sign in again.",
                ErrorDetails {
                    code: Some("authentication_failed".to_string()),
                    title: Some("Authentication failed".to_string()),
                    details: vec![format!("{:#}", e)],
                    can_retry: false,
                },
                0,
            );
            self.push_error(ctx, message);
        }
    }

    /// Resolve a pending auth request: store the credential and continue, or
    /// record the cancellation and move on with the queue
    pub async fn respond_to_credential(&self, id: &str, response: CredentialResponse) -> Result<()> {
        self.ensure_loaded(id).await?;

        let source = self
            .inner
            .registry
            .with(id, |s| {
                if s.paused != Some(PauseReason::Authentication) {
                    return Err(EngineError::invalid_state(id, "no authentication request is pending"));
                }
                s.messages
                    .iter()
                    .rev()
                    .filter(|m| m.role == MessageRole::AuthRequest)
                    .filter_map(|m| m.auth_request.as_ref())
                    .find(|a| a.request_id == response.request_id)
                    .map(|a| a.source.clone())
                    .ok_or_else(|| EngineError::invalid_state(id, "unknown auth request"))
            })
            .ok_or_else(|| not_found(id))??;

        let stored = match (&response.value, response.cancelled) {
            (Some(value), false) => self.inner.credentials.store(&source, value).await,
            (None, false) => Err(anyhow::anyhow!("no credential supplied")),
            (_, true) => Ok(()),
        };
        let completed = stored.is_ok() && !response.cancelled;
        let status = if completed {
            AuthRequestStatus::Completed
        } else {
            AuthRequestStatus::Cancelled
        };

        let info_text = if completed {
            format!("Authentication completed for {}.", source)
        } else {
            format!("Authentication for {} was cancelled.", source)
        };
        let mut note = Message::info(info_text, 0);

        self.inner.registry.with_mut(id, |s| {
            note.timestamp = self.now();
            if let Some(request) = s
                .messages
                .iter_mut()
                .filter_map(|m| m.auth_request.as_mut())
                .find(|a| a.request_id == response.request_id)
            {
                request.status = status;
            }
            s.messages.push(note.clone());
            s.paused = None;
        });
        self.persist(id);
        self.emit(id, EngineEvent::Info { message: note });

        if let Err(e) = &stored {
            warn!(session_id = id, source = %source, "Failed to store credential: {:#}", e);
        }

        if completed {
            let prompt = format!("Authentication for {} is complete. Please continue.", source);
            self.submit(id, prompt, SubmitOptions::default()).await?;
        } else {
            self.start_next_queued(id);
        }
        stored
    }
}

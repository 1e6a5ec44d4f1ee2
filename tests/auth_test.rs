// Credential failure retry and auth request resolution

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::Harness;
use conductor::session::{
    BackendError, ChildStatus, CredentialResponse, CredentialService, MessageRole, PauseReason, TurnEvent,
    UserMessageStatus,
};
use conductor::session::types::AuthRequestStatus;
use parking_lot::Mutex;
use tokio::sync::Notify;

fn expired_token() -> TurnEvent {
    TurnEvent::TypedError {
        error: BackendError::new("expired_oauth_token", "Token expired", "OAuth token has expired"),
    }
}

#[derive(Default)]
struct RecordingCredentials {
    stale: Vec<String>,
    fail_refresh: bool,
    refreshes: AtomicUsize,
    stored: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl CredentialService for RecordingCredentials {
    async fn sources_needing_refresh(&self, sources: &[String]) -> Vec<String> {
        sources.iter().filter(|s| self.stale.contains(s)).cloned().collect()
    }

    async fn refresh(&self, _sources: &[String]) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.fail_refresh {
            anyhow::bail!("refresh token revoked");
        }
        Ok(())
    }

    async fn store(&self, source: &str, credential: &str) -> Result<()> {
        self.stored.lock().push((source.to_string(), credential.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn test_credential_failure_retries_with_fresh_backend() {
    let mut h = Harness::new();
    let id = h.create("retry");

    h.manager.send_message(&id, "summarize the repo").await.unwrap();
    let first = h.next_turn().await;
    first.send(expired_token());

    let retry = h.next_turn().await;
    assert_eq!(retry.input, "summarize the repo");
    assert_eq!(h.factory.created(), 2);
    assert!(h.manager.session_info(&id).unwrap().auth_retry_attempted);

    retry.finish("summary");
    h.wait_idle(&id).await;

    let messages = h.manager.messages(&id).await.unwrap();
    let users = messages.iter().filter(|m| m.role == MessageRole::User).count();
    assert_eq!(users, 1);
    assert!(messages.iter().all(|m| m.role != MessageRole::Error));
    let last = messages.last().unwrap();
    assert_eq!(last.role, MessageRole::Assistant);
    assert_eq!(last.content, "summary");
    assert_eq!(
        h.manager.session_info(&id).unwrap().last_turn_status,
        Some(ChildStatus::Completed)
    );

    // The guard re-arms for the next independent turn
    h.manager.send_message(&id, "now the tests").await.unwrap();
    let next = h.next_turn().await;
    assert!(!h.manager.session_info(&id).unwrap().auth_retry_attempted);
    next.send(expired_token());
    let again = h.next_turn().await;
    assert_eq!(again.input, "now the tests");
    assert_eq!(h.factory.created(), 3);
    again.finish("tests pass");
    h.wait_idle(&id).await;
}

#[tokio::test]
async fn test_second_credential_failure_surfaces_error() {
    let mut h = Harness::new();
    let id = h.create("expired");

    h.manager.send_message(&id, "hello").await.unwrap();
    h.next_turn().await.send(expired_token());

    let retry = h.next_turn().await;
    retry.send(expired_token());
    retry.complete();
    h.wait_idle(&id).await;
    h.no_turn_within(Duration::from_millis(50)).await;

    let info = h.manager.session_info(&id).unwrap();
    assert_eq!(info.last_turn_status, Some(ChildStatus::Error));

    let messages = h.manager.messages(&id).await.unwrap();
    let error = messages.iter().find(|m| m.role == MessageRole::Error).unwrap();
    assert!(error.content.starts_with("Authentication failed"));
    let details = error.error.as_ref().unwrap();
    assert_eq!(details.code.as_deref(), Some("expired_oauth_token"));
    assert!(!details.can_retry);
}

/// Holds the refresh check open until the test lets it go
#[derive(Default)]
struct GatedCredentials {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl CredentialService for GatedCredentials {
    async fn sources_needing_refresh(&self, sources: &[String]) -> Vec<String> {
        self.entered.notify_one();
        self.release.notified().await;
        sources.to_vec()
    }

    async fn refresh(&self, _sources: &[String]) -> Result<()> {
        Ok(())
    }

    async fn store(&self, _source: &str, _credential: &str) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_message_sent_during_refresh_waits_for_retry() {
    let credentials = Arc::new(GatedCredentials::default());
    let mut h = Harness::with_credentials(credentials.clone());
    let id = h.create("refresh-window");
    h.manager.set_sources(&id, vec!["github".to_string()]).unwrap();

    h.manager.send_message(&id, "original").await.unwrap();
    h.next_turn().await.send(expired_token());
    tokio::time::timeout(common::WAIT, credentials.entered.notified())
        .await
        .unwrap();

    // The session is still held by the failed turn
    let outcome = h.manager.send_message(&id, "later").await.unwrap();
    assert_eq!(outcome.status, UserMessageStatus::Queued);
    assert!(h.manager.session_info(&id).unwrap().is_processing);
    h.no_turn_within(Duration::from_millis(50)).await;

    credentials.release.notify_one();
    let retry = h.next_turn().await;
    assert_eq!(retry.input, "original");
    let retry_backend = h.factory.backend_for(&id).unwrap();

    // A second credential failure on the retry is not retried again
    retry.send(expired_token());
    retry.complete();

    let later = h.next_turn().await;
    assert_eq!(later.input, "later");
    assert!(retry_backend.aborts.lock().is_empty());
    later.finish("done");
    h.wait_idle(&id).await;
    assert_eq!(h.factory.created(), 2);

    let messages = h.manager.messages(&id).await.unwrap();
    let users: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(users, vec!["original", "later"]);
    assert!(messages.iter().any(|m| m.content.starts_with("Authentication failed")));
}

#[tokio::test]
async fn test_stale_sources_are_refreshed_before_retry() {
    let credentials = Arc::new(RecordingCredentials {
        stale: vec!["github".to_string()],
        ..Default::default()
    });
    let mut h = Harness::with_credentials(credentials.clone());
    let id = h.create("sources");
    h.manager
        .set_sources(&id, vec!["github".to_string(), "linear".to_string()])
        .unwrap();

    h.manager.send_message(&id, "open a PR").await.unwrap();
    h.next_turn().await.send(expired_token());
    let retry = h.next_turn().await;
    assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
    retry.finish("opened");
    h.wait_idle(&id).await;
}

#[tokio::test]
async fn test_failed_refresh_ends_in_auth_failure() {
    let credentials = Arc::new(RecordingCredentials {
        stale: vec!["github".to_string()],
        fail_refresh: true,
        ..Default::default()
    });
    let mut h = Harness::with_credentials(credentials);
    let id = h.create("revoked");
    h.manager.set_sources(&id, vec!["github".to_string()]).unwrap();

    h.manager.send_message(&id, "open a PR").await.unwrap();
    h.next_turn().await.send(expired_token());

    h.wait_until("auth failure is recorded", |m| {
        m.session_info(&id).unwrap().last_turn_status == Some(ChildStatus::Error)
    })
    .await;
    h.no_turn_within(Duration::from_millis(50)).await;

    let messages = h.manager.messages(&id).await.unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.role, MessageRole::Error);
    assert_eq!(last.content, "Authentication failed. Please sign in again.");
}

#[tokio::test]
async fn test_auth_request_completed_continues_the_session() {
    let credentials = Arc::new(RecordingCredentials::default());
    let mut h = Harness::with_credentials(credentials.clone());
    let id = h.create("auth");

    h.manager.send_message(&id, "check my issues").await.unwrap();
    let turn = h.next_turn().await;
    turn.send(TurnEvent::AuthRequest {
        request_id: "req-1".to_string(),
        source: "linear".to_string(),
        message: "Sign in to Linear".to_string(),
    });
    h.wait_idle(&id).await;
    assert_eq!(
        h.manager.session_info(&id).unwrap().paused,
        Some(PauseReason::Authentication)
    );

    h.manager
        .respond_to_credential(
            &id,
            CredentialResponse {
                request_id: "req-1".to_string(),
                cancelled: false,
                value: Some("lin_api_123".to_string()),
            },
        )
        .await
        .unwrap();

    let resumed = h.next_turn().await;
    assert_eq!(resumed.input, "Authentication for linear is complete. Please continue.");
    assert_eq!(
        *credentials.stored.lock(),
        vec![("linear".to_string(), "lin_api_123".to_string())]
    );

    let messages = h.manager.messages(&id).await.unwrap();
    let request = messages
        .iter()
        .find(|m| m.role == MessageRole::AuthRequest)
        .and_then(|m| m.auth_request.clone())
        .unwrap();
    assert_eq!(request.status, AuthRequestStatus::Completed);

    resumed.finish("3 open issues");
    h.wait_idle(&id).await;
}

#[tokio::test]
async fn test_auth_request_cancelled_stays_idle() {
    let mut h = Harness::new();
    let id = h.create("auth-cancel");

    h.manager.send_message(&id, "check my issues").await.unwrap();
    h.next_turn().await.send(TurnEvent::AuthRequest {
        request_id: "req-2".to_string(),
        source: "linear".to_string(),
        message: "Sign in to Linear".to_string(),
    });
    h.wait_idle(&id).await;

    h.manager
        .respond_to_credential(
            &id,
            CredentialResponse {
                request_id: "req-2".to_string(),
                cancelled: true,
                value: None,
            },
        )
        .await
        .unwrap();
    h.no_turn_within(Duration::from_millis(50)).await;

    let info = h.manager.session_info(&id).unwrap();
    assert_eq!(info.paused, None);
    assert!(!info.is_processing);

    let messages = h.manager.messages(&id).await.unwrap();
    assert_eq!(
        messages.last().unwrap().content,
        "Authentication for linear was cancelled."
    );

    // Nothing pending any more
    let err = h
        .manager
        .respond_to_credential(
            &id,
            CredentialResponse {
                request_id: "req-2".to_string(),
                cancelled: true,
                value: None,
            },
        )
        .await;
    assert!(err.is_err());
}

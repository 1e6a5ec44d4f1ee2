//! UI notification stream

use serde::Serialize;
use tokio::sync::broadcast;

use super::events::AbortReason;
use super::types::{ChildStatus, CompletionRecord, Message, PermissionMode, TokenUsage};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserMessageStatus {
    /// Injected into the running turn
    Accepted,
    /// Waiting for the current turn to end
    Queued,
    /// Started a new turn
    Processing,
}

/// Typed events delivered to the UI layer
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    SessionCreated,
    SessionDeleted,
    UserMessage {
        message: Message,
        status: UserMessageStatus,
    },
    TextDelta {
        delta: String,
        turn_id: Option<String>,
    },
    TextComplete {
        message: Message,
    },
    ToolStart {
        message: Message,
    },
    ToolResult {
        message: Message,
    },
    Status {
        message: String,
    },
    Usage {
        usage: TokenUsage,
    },
    Complete {
        usage: TokenUsage,
    },
    Interrupted {
        reason: AbortReason,
    },
    Error {
        message: Message,
    },
    Info {
        message: Message,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        description: String,
    },
    PermissionModeChanged {
        mode: PermissionMode,
    },
    PlanSubmitted {
        message: Message,
    },
    AuthRequest {
        message: Message,
    },
    ChildProgress {
        child_id: String,
        summary: String,
    },
    ChildStatusChanged {
        child_id: String,
        is_processing: bool,
        status: Option<ChildStatus>,
    },
    OrchestratorWaiting {
        waiting_for: Vec<String>,
    },
    OrchestratorResumed {
        results: Vec<CompletionRecord>,
    },
    SourcesChanged {
        sources: Vec<String>,
    },
    LabelsChanged {
        labels: Vec<String>,
    },
    UnreadChanged {
        has_unread: bool,
    },
    ModelChanged {
        model: Option<String>,
        connection: Option<String>,
    },
}

/// Envelope routing an event to its workspace and session
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub workspace_id: String,
    pub session_id: String,
    pub event: EngineEvent,
}

/// Broadcast bus for engine notifications.
///
/// Publishing never blocks; slow subscribers lag instead.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Notification>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Subscribe to one workspace only
    pub fn subscribe_workspace(&self, workspace_id: impl Into<String>) -> WorkspaceReceiver {
        WorkspaceReceiver {
            workspace_id: workspace_id.into(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn publish(&self, workspace_id: &str, session_id: &str, event: EngineEvent) {
        let _ = self.tx.send(Notification {
            workspace_id: workspace_id.to_string(),
            session_id: session_id.to_string(),
            event,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(2048)
    }
}

pub struct WorkspaceReceiver {
    workspace_id: String,
    rx: broadcast::Receiver<Notification>,
}

impl WorkspaceReceiver {
    /// Next notification for this workspace; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(n) if n.workspace_id == self.workspace_id => return Some(n),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(workspace_id = %self.workspace_id, skipped, "Notification receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

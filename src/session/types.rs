//! Session and message data model

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::backend::AgentBackend;
use super::events::AbortReason;

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    Plan,
    AuthRequest,
    Error,
    #[default]
    Info,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
            MessageRole::Plan => "plan",
            MessageRole::AuthRequest => "auth-request",
            MessageRole::Error => "error",
            MessageRole::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Completed,
    Error,
}

/// Structured detail attached to error messages.
///
/// `title` and the message content are what the user sees; `details` is kept
/// for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ErrorDetails {
    pub code: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub details: Vec<String>,
    #[serde(default)]
    pub can_retry: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthRequestStatus {
    Pending,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthRequestInfo {
    pub request_id: String,
    pub source: String,
    pub status: AuthRequestStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_status: Option<ToolStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_intermediate: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_queued: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub queue_recovered: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_request: Option<AuthRequestInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp,
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>, timestamp: i64) -> Self {
        Self::new(MessageRole::User, content, timestamp)
    }

    pub fn info(content: impl Into<String>, timestamp: i64) -> Self {
        Self::new(MessageRole::Info, content, timestamp)
    }

    pub fn error(content: impl Into<String>, details: ErrorDetails, timestamp: i64) -> Self {
        let mut message = Self::new(MessageRole::Error, content, timestamp);
        message.error = Some(details);
        message
    }

    /// Tool message still waiting for its result
    pub fn is_open_tool(&self) -> bool {
        self.role == MessageRole::Tool && self.tool_status == Some(ToolStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Read-only exploration; the agent is expected to submit a plan
    Safe,
    #[default]
    Ask,
    AllowAll,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Safe => "safe",
            PermissionMode::Ask => "ask",
            PermissionMode::AllowAll => "allow-all",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "safe" => Ok(PermissionMode::Safe),
            "ask" => Ok(PermissionMode::Ask),
            "allow-all" => Ok(PermissionMode::AllowAll),
            _ => anyhow::bail!("Unknown permission mode: {}", s),
        }
    }
}

/// Terminal outcome of a child session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChildStatus {
    Completed,
    Error,
    Cancelled,
}

impl ChildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildStatus::Completed => "completed",
            ChildStatus::Error => "error",
            ChildStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(ChildStatus::Completed),
            "error" => Ok(ChildStatus::Error),
            "cancelled" => Ok(ChildStatus::Cancelled),
            _ => anyhow::bail!("Unknown child status: {}", s),
        }
    }
}

/// Why an idle session is waiting on the user
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PauseReason {
    PlanReview,
    Authentication,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TokenUsage {
    /// Size of the current context, not a running sum
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
}

impl TokenUsage {
    /// Fold a usage report into the running totals
    pub fn accumulate(&mut self, report: &TokenUsage) {
        self.input_tokens = report.input_tokens;
        self.cache_read_tokens = report.cache_read_tokens;
        self.cache_creation_tokens = report.cache_creation_tokens;
        self.output_tokens += report.output_tokens;
        self.cost_usd += report.cost_usd;
        if report.context_window.is_some() {
            self.context_window = report.context_window;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRecord {
    pub child_id: String,
    pub name: String,
    pub status: ChildStatus,
    pub summary: String,
    pub usage: TokenUsage,
    pub completed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OrchestrationState {
    /// Child ids still blocking resumption
    #[serde(default)]
    pub waiting_for: BTreeSet<String>,
    /// Every id of the current wait, kept for the resume summary
    #[serde(default)]
    pub wait_targets: Vec<String>,
    #[serde(default)]
    pub completed_results: Vec<CompletionRecord>,
    #[serde(default)]
    pub auto_approve_children: Vec<String>,
}

impl OrchestrationState {
    pub fn is_waiting(&self) -> bool {
        !self.waiting_for.is_empty()
    }

    pub fn result_for(&self, child_id: &str) -> Option<&CompletionRecord> {
        self.completed_results.iter().find(|r| r.child_id == child_id)
    }

    pub fn is_recorded(&self, child_id: &str) -> bool {
        self.result_for(child_id).is_some()
    }
}

/// A user input accepted while the session was busy
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub message_id: String,
    pub content: String,
}

/// Persisted part of a session record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionMeta {
    pub id: String,
    pub workspace_id: String,
    pub name: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    pub connection: Option<String>,
    pub model_locked: bool,
    pub parent_id: Option<String>,
    pub sibling_order: Option<u32>,
    pub orchestration: Option<OrchestrationState>,
    pub labels: Vec<String>,
    pub enabled_sources: Vec<String>,
    pub has_unread: bool,
    pub usage: TokenUsage,
    pub backend_session_id: Option<String>,
    pub last_turn_status: Option<ChildStatus>,
}

/// Snapshot handed to the persistence layer.
///
/// `messages` is `None` for metadata-only writes of sessions whose body was
/// never loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub meta: SessionMeta,
    pub messages: Option<Vec<Message>>,
}

/// Live in-memory state of one conversation
pub struct SessionRecord {
    pub meta: SessionMeta,
    pub backend: Option<Arc<dyn AgentBackend>>,
    pub messages: Vec<Message>,
    pub messages_loaded: bool,
    pub is_processing: bool,
    pub processing_generation: u64,
    pub stop_requested: bool,
    pub pending_abort: Option<AbortReason>,
    pub pending: VecDeque<QueuedMessage>,
    pub was_interrupted: bool,
    pub auth_retry_attempted: bool,
    pub paused: Option<PauseReason>,
}

impl SessionRecord {
    /// Fresh session with an empty, already-loaded history
    pub fn new(meta: SessionMeta) -> Self {
        let mut record = Self::from_meta(meta);
        record.messages_loaded = true;
        record
    }

    /// Metadata-only record; the body is loaded on first access
    pub fn from_meta(meta: SessionMeta) -> Self {
        Self {
            meta,
            backend: None,
            messages: Vec::new(),
            messages_loaded: false,
            is_processing: false,
            processing_generation: 0,
            stop_requested: false,
            pending_abort: None,
            pending: VecDeque::new(),
            was_interrupted: false,
            auth_retry_attempted: false,
            paused: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }

    /// Most recent tool message for a tool-call id
    pub fn tool_message_mut(&mut self, tool_use_id: &str) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .rev()
            .find(|m| m.role == MessageRole::Tool && m.tool_use_id.as_deref() == Some(tool_use_id))
    }

    /// Last final assistant output, used for child summaries
    pub fn final_output(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| {
            (m.role == MessageRole::Assistant && !m.is_intermediate) || m.role == MessageRole::Error
        })
    }

    pub fn is_child(&self) -> bool {
        self.meta.parent_id.is_some()
    }

    pub fn snapshot(&self) -> StoredSession {
        StoredSession {
            meta: self.meta.clone(),
            messages: self.messages_loaded.then(|| self.messages.clone()),
        }
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.meta.id)
            .field("has_backend", &self.backend.is_some())
            .field("messages", &self.messages.len())
            .field("is_processing", &self.is_processing)
            .field("processing_generation", &self.processing_generation)
            .field("stop_requested", &self.stop_requested)
            .field("pending_abort", &self.pending_abort)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Read-only view of a session for callers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub workspace_id: String,
    pub name: Option<String>,
    pub is_processing: bool,
    pub processing_generation: u64,
    pub stop_requested: bool,
    pub pending_count: usize,
    pub message_count: Option<usize>,
    pub has_unread: bool,
    pub was_interrupted: bool,
    pub auth_retry_attempted: bool,
    pub paused: Option<PauseReason>,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    pub connection: Option<String>,
    pub model_locked: bool,
    pub parent_id: Option<String>,
    pub sibling_order: Option<u32>,
    pub labels: Vec<String>,
    pub enabled_sources: Vec<String>,
    pub usage: TokenUsage,
    pub waiting_for: Vec<String>,
    pub last_turn_status: Option<ChildStatus>,
}

impl From<&SessionRecord> for SessionInfo {
    fn from(s: &SessionRecord) -> Self {
        Self {
            id: s.meta.id.clone(),
            workspace_id: s.meta.workspace_id.clone(),
            name: s.meta.name.clone(),
            is_processing: s.is_processing,
            processing_generation: s.processing_generation,
            stop_requested: s.stop_requested,
            pending_count: s.pending.len(),
            message_count: s.messages_loaded.then_some(s.messages.len()),
            has_unread: s.meta.has_unread,
            was_interrupted: s.was_interrupted,
            auth_retry_attempted: s.auth_retry_attempted,
            paused: s.paused,
            permission_mode: s.meta.permission_mode,
            model: s.meta.model.clone(),
            connection: s.meta.connection.clone(),
            model_locked: s.meta.model_locked,
            parent_id: s.meta.parent_id.clone(),
            sibling_order: s.meta.sibling_order,
            labels: s.meta.labels.clone(),
            enabled_sources: s.meta.enabled_sources.clone(),
            usage: s.meta.usage.clone(),
            waiting_for: s
                .meta
                .orchestration
                .as_ref()
                .map(|o| o.waiting_for.iter().cloned().collect())
                .unwrap_or_default(),
            last_turn_status: s.meta.last_turn_status,
        }
    }
}

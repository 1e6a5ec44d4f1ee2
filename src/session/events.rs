//! Events produced by agent backends during a turn

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::TokenUsage;

/// Typed abort signal; the reason decides what happens after the drain
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    UserStop,
    Redirect,
    PlanSubmitted,
    AuthRequest,
    WaitingForChildren,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::UserStop => "user_stop",
            AbortReason::Redirect => "redirect",
            AbortReason::PlanSubmitted => "plan_submitted",
            AbortReason::AuthRequest => "auth_request",
            AbortReason::WaitingForChildren => "waiting_for_children",
        }
    }
}

/// Structured error reported by a backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BackendError {
    pub code: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
    #[serde(default)]
    pub can_retry: bool,
}

const CREDENTIAL_FAILURE_CODES: &[&str] = &[
    "invalid_api_key",
    "expired_oauth_token",
    "token_expired",
    "invalid_credentials",
    "unauthorized",
    "authentication_error",
];

impl BackendError {
    pub fn new(code: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            title: title.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Transient credential/token failure that a fresh backend may recover from
    pub fn is_credential_failure(&self) -> bool {
        CREDENTIAL_FAILURE_CODES.contains(&self.code.as_str())
    }
}

/// One event in a backend's turn stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    TextDelta {
        text: String,
        #[serde(default)]
        turn_id: Option<String>,
    },
    TextComplete {
        text: String,
        #[serde(default)]
        turn_id: Option<String>,
        #[serde(default)]
        is_intermediate: bool,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    /// May arrive twice for one call: first with empty input, then complete
    ToolStart {
        tool_use_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        intent: Option<String>,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
        #[serde(default)]
        turn_id: Option<String>,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        tool_name: Option<String>,
        result: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    Status {
        message: String,
    },
    Error {
        message: String,
    },
    TypedError {
        error: BackendError,
    },
    Usage {
        usage: TokenUsage,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        description: String,
    },
    PlanSubmitted {
        content: String,
        #[serde(default)]
        plan_path: Option<String>,
    },
    AuthRequest {
        request_id: String,
        source: String,
        message: String,
    },
    BackendSessionId {
        id: String,
    },
    Complete,
}

//! Event stream processor
//!
//! Applies one backend event at a time to the session it belongs to. Every
//! side effect is gated on the session still processing the generation the
//! turn was started with, so a stale turn can never touch newer state.

use serde_json::Value;
use tracing::{debug, info, warn};

use super::events::{AbortReason, BackendError, TurnEvent};
use super::manager::SessionManager;
use super::notify::EngineEvent;
use super::turn::TurnStart;
use super::types::{
    AuthRequestInfo, AuthRequestStatus, ErrorDetails, Message, MessageRole, SessionRecord, ToolStatus,
};
use crate::orchestration::summary::truncate_summary;

/// Tools whose calls own nested tool calls (sub-agents)
const TASK_TOOLS: &[&str] = &["Task", "Agent"];

/// Per-turn processing state
#[derive(Debug, Clone)]
pub(crate) struct TurnContext {
    pub session_id: String,
    pub workspace_id: String,
    pub generation: u64,
    pub user_message_id: String,
    pub content: String,
    pub errored: bool,
    pub auth_retry: bool,
    /// Completed by the stop timeout instead of the backend
    pub forced: bool,
}

impl TurnContext {
    pub fn new(session_id: &str, workspace_id: &str, start: &TurnStart) -> Self {
        Self {
            session_id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            generation: start.generation,
            user_message_id: start.message_id.clone(),
            content: start.content.clone(),
            errored: false,
            auth_retry: false,
            forced: false,
        }
    }

    pub fn forced(session_id: &str, workspace_id: &str, generation: u64) -> Self {
        Self {
            session_id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            generation,
            user_message_id: String::new(),
            content: String::new(),
            errored: false,
            auth_retry: false,
            forced: true,
        }
    }
}

/// Cap a tool result at `max_chars` characters, appending an explicit marker
pub(crate) fn truncate_tool_result(result: String, max_chars: usize) -> (String, bool) {
    match result.char_indices().nth(max_chars) {
        None => (result, false),
        Some((cut, _)) => {
            let omitted = result[cut..].chars().count();
            (
                format!("{}\n\n[truncated: {} characters omitted]", &result[..cut], omitted),
                true,
            )
        }
    }
}

fn has_input(input: &Value) -> bool {
    match input {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

fn error_message(error: &BackendError, content: String, timestamp: i64) -> Message {
    Message::error(
        content,
        ErrorDetails {
            code: Some(error.code.clone()),
            title: Some(error.title.clone()),
            details: error.details.clone(),
            can_retry: error.can_retry,
        },
        timestamp,
    )
}

impl SessionManager {
    /// Run `f` only if the turn is still the session's current one
    fn mutate<R>(&self, ctx: &TurnContext, f: impl FnOnce(&mut SessionRecord) -> R) -> Option<R> {
        self.inner
            .registry
            .with_mut(&ctx.session_id, |s| {
                (s.is_processing && s.processing_generation == ctx.generation).then(|| f(s))
            })
            .flatten()
    }

    pub(crate) fn handle_event(&self, ctx: &mut TurnContext, event: TurnEvent) {
        let id = ctx.session_id.clone();
        match event {
            TurnEvent::TextDelta { text, turn_id } => {
                if self.mutate(ctx, |_| ()).is_some() {
                    self.inner.batcher.push(&ctx.workspace_id, &id, turn_id, &text);
                }
            }

            TurnEvent::TextComplete {
                text,
                turn_id,
                is_intermediate,
                parent_tool_use_id,
            } => {
                self.inner.batcher.flush(&id);
                let mut message = Message::new(MessageRole::Assistant, text, 0);
                message.turn_id = turn_id;
                message.is_intermediate = is_intermediate;
                message.parent_tool_use_id = parent_tool_use_id;

                let Some(parent_id) = self.mutate(ctx, |s| {
                    message.timestamp = self.now();
                    s.messages.push(message.clone());
                    s.meta.parent_id.clone()
                }) else {
                    return;
                };
                self.persist(&id);

                let summary = (!is_intermediate)
                    .then(|| truncate_summary(&message.content, self.inner.config.child_summary_chars));
                self.emit(&id, EngineEvent::TextComplete { message });
                if let (Some(parent_id), Some(summary)) = (parent_id, summary) {
                    self.emit(
                        &parent_id,
                        EngineEvent::ChildProgress {
                            child_id: id.clone(),
                            summary,
                        },
                    );
                }
            }

            TurnEvent::ToolStart {
                tool_use_id,
                tool_name,
                input,
                intent,
                parent_tool_use_id,
                turn_id,
            } => {
                let message = self.mutate(ctx, |s| {
                    // The early event carries no arguments; merge the complete one into it.
                    if let Some(existing) = s.tool_message_mut(&tool_use_id) {
                        if has_input(&input) {
                            existing.tool_input = Some(input);
                        }
                        if intent.is_some() {
                            existing.tool_intent = intent;
                        }
                        if parent_tool_use_id.is_some() {
                            existing.parent_tool_use_id = parent_tool_use_id;
                        }
                        existing.tool_name = Some(tool_name);
                        return existing.clone();
                    }

                    let mut message = Message::new(MessageRole::Tool, String::new(), self.now());
                    message.tool_use_id = Some(tool_use_id);
                    message.tool_name = Some(tool_name);
                    message.tool_input = has_input(&input).then_some(input);
                    message.tool_intent = intent;
                    message.tool_status = Some(ToolStatus::Pending);
                    message.parent_tool_use_id = parent_tool_use_id;
                    message.turn_id = turn_id;
                    s.messages.push(message.clone());
                    message
                });
                if let Some(message) = message {
                    self.emit(&id, EngineEvent::ToolStart { message });
                }
            }

            TurnEvent::ToolResult {
                tool_use_id,
                tool_name,
                result,
                is_error,
                parent_tool_use_id,
            } => {
                let (content, truncated) = truncate_tool_result(result, self.inner.config.max_tool_result_chars);
                let updated = self
                    .mutate(ctx, |s| {
                        let synthesized = s.tool_message_mut(&tool_use_id).is_none();
                        if synthesized {
                            let mut start = Message::new(MessageRole::Tool, String::new(), self.now());
                            start.tool_use_id = Some(tool_use_id.clone());
                            start.tool_name = Some(tool_name.clone().unwrap_or_else(|| "unknown".to_string()));
                            start.tool_status = Some(ToolStatus::Pending);
                            start.parent_tool_use_id = parent_tool_use_id;
                            s.messages.push(start);
                        }

                        let message = s.tool_message_mut(&tool_use_id)?;
                        message.content = content;
                        message.truncated = truncated;
                        message.tool_status = Some(if is_error { ToolStatus::Error } else { ToolStatus::Completed });
                        if let Some(name) = tool_name {
                            message.tool_name = Some(name);
                        }
                        let message = message.clone();

                        let mut closed = Vec::new();
                        if message.tool_name.as_deref().map_or(false, |n| TASK_TOOLS.contains(&n)) {
                            for child in s.messages.iter_mut().filter(|m| {
                                m.is_open_tool() && m.parent_tool_use_id.as_deref() == Some(tool_use_id.as_str())
                            }) {
                                child.tool_status = Some(ToolStatus::Completed);
                                closed.push(child.clone());
                            }
                        }
                        Some((message, closed, synthesized))
                    })
                    .flatten();

                let Some((message, closed, synthesized)) = updated else {
                    return;
                };
                if synthesized {
                    debug!(session_id = %id, tool_use_id = ?message.tool_use_id, "Tool result arrived before its start");
                }
                self.persist(&id);
                for child in closed {
                    self.emit(&id, EngineEvent::ToolResult { message: child });
                }
                self.emit(&id, EngineEvent::ToolResult { message });
            }

            TurnEvent::Status { message } => {
                if self.mutate(ctx, |_| ()).is_some() {
                    self.emit(&id, EngineEvent::Status { message });
                }
            }

            TurnEvent::Error { message } => {
                let message = Message::error(
                    message,
                    ErrorDetails {
                        title: Some("Agent error".to_string()),
                        ..Default::default()
                    },
                    0,
                );
                self.push_error(ctx, message);
            }

            TurnEvent::TypedError { error } => self.handle_typed_error(ctx, error),

            TurnEvent::Usage { usage } => {
                let total = self.mutate(ctx, |s| {
                    s.meta.usage.accumulate(&usage);
                    s.meta.usage.clone()
                });
                if let Some(usage) = total {
                    self.emit(&id, EngineEvent::Usage { usage });
                }
            }

            TurnEvent::PermissionRequest {
                request_id,
                tool_name,
                description,
            } => {
                if self.mutate(ctx, |_| ()).is_some() {
                    self.emit(
                        &id,
                        EngineEvent::PermissionRequest {
                            request_id,
                            tool_name,
                            description,
                        },
                    );
                }
            }

            TurnEvent::PlanSubmitted { content, plan_path } => {
                self.inner.batcher.flush(&id);
                let mut message = Message::new(MessageRole::Plan, content, 0);
                message.plan_path = plan_path;
                let pushed = self.mutate(ctx, |s| {
                    message.timestamp = self.now();
                    s.messages.push(message.clone());
                });
                if pushed.is_some() {
                    self.persist(&id);
                    self.emit(&id, EngineEvent::PlanSubmitted { message });
                    self.abort_turn(&id, AbortReason::PlanSubmitted);
                }
            }

            TurnEvent::AuthRequest {
                request_id,
                source,
                message,
            } => {
                self.inner.batcher.flush(&id);
                let mut message = Message::new(MessageRole::AuthRequest, message, 0);
                message.auth_request = Some(AuthRequestInfo {
                    request_id,
                    source,
                    status: AuthRequestStatus::Pending,
                });
                let pushed = self.mutate(ctx, |s| {
                    message.timestamp = self.now();
                    s.messages.push(message.clone());
                });
                if pushed.is_some() {
                    self.persist(&id);
                    self.emit(&id, EngineEvent::AuthRequest { message });
                    self.abort_turn(&id, AbortReason::AuthRequest);
                }
            }

            TurnEvent::BackendSessionId { id: backend_id } => {
                if self
                    .mutate(ctx, |s| s.meta.backend_session_id = Some(backend_id))
                    .is_some()
                {
                    self.persist(&id);
                }
            }

            TurnEvent::Complete => {}
        }
    }

    /// Credential failures get one recreate-and-retry per user turn; every
    /// other typed error becomes an error message and goes to the reporter
    fn handle_typed_error(&self, ctx: &mut TurnContext, error: BackendError) {
        let id = ctx.session_id.clone();

        if error.is_credential_failure() {
            let retry = self.mutate(ctx, |s| {
                if s.auth_retry_attempted {
                    return false;
                }
                s.auth_retry_attempted = true;
                s.backend = None;
                true
            });
            match retry {
                None => return,
                Some(true) => {
                    info!(session_id = %id, code = %error.code, "Credential failure, retrying turn with a fresh backend");
                    ctx.auth_retry = true;
                    self.persist(&id);
                    return;
                }
                Some(false) => {
                    warn!(session_id = %id, code = %error.code, "Credential failure after retry");
                    let content = format!("Authentication failed: {}", error.message);
                    let mut message = error_message(&error, content, 0);
                    if let Some(details) = message.error.as_mut() {
                        details.title = Some("Authentication failed".to_string());
                        details.can_retry = false;
                    }
                    self.push_error(ctx, message);
                    return;
                }
            }
        }

        if self.mutate(ctx, |_| ()).is_none() {
            return;
        }
        self.inner.reporter.report(&id, &error);
        let content = if error.message.is_empty() {
            error.title.clone()
        } else {
            error.message.clone()
        };
        let message = error_message(&error, content, 0);
        self.push_error(ctx, message);
    }

    pub(crate) fn push_error(&self, ctx: &mut TurnContext, mut message: Message) {
        let pushed = self.mutate(ctx, |s| {
            message.timestamp = self.now();
            s.messages.push(message.clone());
        });
        if pushed.is_some() {
            ctx.errored = true;
            self.persist(&ctx.session_id);
            self.emit(&ctx.session_id, EngineEvent::Error { message });
        }
    }

    /// The backend failed outside its event stream (spawn, send)
    pub(crate) fn turn_failed(&self, ctx: &mut TurnContext, error: &anyhow::Error) {
        warn!(session_id = %ctx.session_id, "Turn failed: {:#}", error);
        let message = Message::error(
            error.to_string(),
            ErrorDetails {
                code: Some("backend_failure".to_string()),
                title: Some("Agent error".to_string()),
                details: error.chain().skip(1).map(|c| c.to_string()).collect(),
                can_retry: true,
            },
            0,
        );
        self.push_error(ctx, message);
    }
}

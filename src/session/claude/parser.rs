//! `claude --output-format stream-json` line parser

use serde_json::Value;

use crate::session::events::{BackendError, TurnEvent};
use crate::session::types::TokenUsage;

const PLAN_TOOL: &str = "ExitPlanMode";

/// Turns stream-json lines into turn events.
///
/// Stateful: remembers the id of the message being streamed so deltas and
/// the final text share a turn id.
#[derive(Debug, Default)]
pub struct StreamJsonParser {
    message_id: Option<String>,
    model: Option<String>,
    saw_result: bool,
}

impl StreamJsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Whether the final `result` line has been seen
    pub fn saw_result(&self) -> bool {
        self.saw_result
    }

    pub fn parse_line(&mut self, line: &str) -> Vec<TurnEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };

        match str_field(&value, "type") {
            Some("system") => self.parse_system(&value),
            Some("stream_event") => self.parse_stream_event(&value),
            Some("assistant") => self.parse_assistant(&value),
            Some("user") => parse_tool_results(&value),
            Some("result") => self.parse_result(&value),
            _ => Vec::new(),
        }
    }

    fn parse_system(&mut self, value: &Value) -> Vec<TurnEvent> {
        if str_field(value, "subtype") != Some("init") {
            return Vec::new();
        }
        if let Some(model) = str_field(value, "model") {
            self.model = Some(model.to_string());
        }
        str_field(value, "session_id")
            .map(|id| vec![TurnEvent::BackendSessionId { id: id.to_string() }])
            .unwrap_or_default()
    }

    fn parse_stream_event(&mut self, value: &Value) -> Vec<TurnEvent> {
        // Sub-agent output is reported through its tool result instead
        if str_field(value, "parent_tool_use_id").is_some() {
            return Vec::new();
        }
        let Some(event) = value.get("event") else {
            return Vec::new();
        };

        match str_field(event, "type") {
            Some("message_start") => {
                self.message_id = event
                    .get("message")
                    .and_then(|m| str_field(m, "id"))
                    .map(str::to_string);
                Vec::new()
            }
            Some("content_block_delta") => {
                let delta = event.get("delta");
                match delta.and_then(|d| str_field(d, "type")) {
                    Some("text_delta") => delta
                        .and_then(|d| str_field(d, "text"))
                        .filter(|t| !t.is_empty())
                        .map(|text| {
                            vec![TurnEvent::TextDelta {
                                text: text.to_string(),
                                turn_id: self.message_id.clone(),
                            }]
                        })
                        .unwrap_or_default(),
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn parse_assistant(&mut self, value: &Value) -> Vec<TurnEvent> {
        let Some(message) = value.get("message") else {
            return Vec::new();
        };
        if let Some(model) = str_field(message, "model") {
            self.model = Some(model.to_string());
        }
        let turn_id = str_field(message, "id").map(str::to_string).or_else(|| self.message_id.clone());
        let parent = str_field(value, "parent_tool_use_id").map(str::to_string);
        let blocks = message.get("content").and_then(Value::as_array).cloned().unwrap_or_default();

        let has_tool_use = blocks.iter().any(|b| str_field(b, "type") == Some("tool_use"));
        let mut events = Vec::new();
        for block in &blocks {
            match str_field(block, "type") {
                Some("text") => {
                    let text = str_field(block, "text").unwrap_or_default();
                    if text.trim().is_empty() {
                        continue;
                    }
                    events.push(TurnEvent::TextComplete {
                        text: text.to_string(),
                        turn_id: turn_id.clone(),
                        is_intermediate: has_tool_use || parent.is_some(),
                        parent_tool_use_id: parent.clone(),
                    });
                }
                Some("tool_use") => {
                    let name = str_field(block, "name").unwrap_or("Tool").to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    if name == PLAN_TOOL && parent.is_none() {
                        let plan = str_field(&input, "plan").unwrap_or_default().to_string();
                        events.push(TurnEvent::PlanSubmitted {
                            content: plan,
                            plan_path: None,
                        });
                        continue;
                    }
                    events.push(TurnEvent::ToolStart {
                        tool_use_id: str_field(block, "id").unwrap_or_default().to_string(),
                        tool_name: name,
                        intent: str_field(&input, "description").map(str::to_string),
                        input,
                        parent_tool_use_id: parent.clone(),
                        turn_id: turn_id.clone(),
                    });
                }
                _ => {}
            }
        }
        events
    }

    fn parse_result(&mut self, value: &Value) -> Vec<TurnEvent> {
        self.saw_result = true;
        let mut events = Vec::new();

        if let Some(usage) = value.get("usage") {
            events.push(TurnEvent::Usage {
                usage: TokenUsage {
                    input_tokens: u64_field(usage, "input_tokens"),
                    output_tokens: u64_field(usage, "output_tokens"),
                    cache_read_tokens: u64_field(usage, "cache_read_input_tokens"),
                    cache_creation_tokens: u64_field(usage, "cache_creation_input_tokens"),
                    cost_usd: value.get("total_cost_usd").and_then(Value::as_f64).unwrap_or(0.0),
                    context_window: None,
                },
            });
        }

        if value.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
            let text = str_field(value, "result").unwrap_or("The agent reported an error").to_string();
            events.push(TurnEvent::TypedError {
                error: classify_error(str_field(value, "subtype"), &text),
            });
        }
        events
    }
}

/// Map a failed `result` line to a typed error
pub fn classify_error(subtype: Option<&str>, text: &str) -> BackendError {
    let lower = text.to_lowercase();
    let (code, title) = if lower.contains("invalid api key") {
        ("invalid_api_key", "Invalid API key")
    } else if lower.contains("oauth token has expired") || lower.contains("token expired") {
        ("expired_oauth_token", "Session expired")
    } else if lower.contains("rate limit") {
        ("rate_limited", "Rate limited")
    } else if lower.contains("overloaded") {
        ("overloaded", "Service overloaded")
    } else {
        (subtype.unwrap_or("error_during_execution"), "Agent error")
    };

    let mut error = BackendError::new(code, title, text);
    error.can_retry = matches!(code, "rate_limited" | "overloaded");
    if let Some(subtype) = subtype {
        error.details.push(format!("subtype: {}", subtype));
    }
    error
}

fn parse_tool_results(value: &Value) -> Vec<TurnEvent> {
    let parent = str_field(value, "parent_tool_use_id").map(str::to_string);
    let Some(blocks) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    blocks
        .iter()
        .filter(|b| str_field(b, "type") == Some("tool_result"))
        .map(|block| TurnEvent::ToolResult {
            tool_use_id: str_field(block, "tool_use_id").unwrap_or_default().to_string(),
            tool_name: None,
            result: tool_result_text(block.get("content")),
            is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            parent_tool_use_id: parent.clone(),
        })
        .collect()
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| str_field(p, "text"))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

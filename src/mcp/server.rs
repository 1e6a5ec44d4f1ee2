//! MCP server
//!
//! JSON-RPC over HTTP/1.1 POST. Each tool maps onto one `SessionManager` or
//! `Coordinator` operation, so an orchestrating agent can drive its own
//! children through tool calls.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::types::*;
use crate::core::AppState;
use crate::orchestration::{PlanDecision, SpawnChildRequest};
use crate::session::{CreateSessionOptions, CredentialResponse, PermissionMode};

const PROTOCOL_VERSION: &str = "2024-11-05";
const MAX_BODY: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct McpServer {
    host: String,
    port: u16,
    state: AppState,
}

#[derive(Deserialize)]
struct SessionArgs {
    session_id: String,
}

#[derive(Deserialize)]
struct SendArgs {
    session_id: String,
    content: String,
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default)]
    workspace_id: Option<String>,
}

#[derive(Deserialize)]
struct ModeArgs {
    session_id: String,
    mode: PermissionMode,
}

#[derive(Deserialize)]
struct PermissionArgs {
    session_id: String,
    request_id: String,
    allowed: bool,
    #[serde(default)]
    remember: bool,
}

#[derive(Deserialize)]
struct CredentialArgs {
    session_id: String,
    #[serde(flatten)]
    response: CredentialResponse,
}

#[derive(Deserialize)]
struct SpawnArgs {
    session_id: String,
    #[serde(flatten)]
    request: SpawnChildRequest,
}

#[derive(Deserialize)]
struct WaitArgs {
    session_id: String,
    #[serde(default)]
    child_ids: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ChildArgs {
    session_id: String,
    child_id: String,
}

#[derive(Deserialize)]
struct ReviewArgs {
    session_id: String,
    child_id: String,
    approve: bool,
    #[serde(default)]
    mode: Option<PermissionMode>,
    #[serde(default)]
    feedback: Option<String>,
}

#[derive(Deserialize)]
struct WorkspaceArgs {
    name: String,
    #[serde(default)]
    root_path: Option<String>,
}

fn parse_args<T: DeserializeOwned>(arguments: &Value) -> Result<T> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments.clone() };
    serde_json::from_value(arguments).context("Invalid tool arguments")
}

fn json_text<T: Serialize>(value: &T) -> Result<ToolCallResult> {
    Ok(ToolCallResult::text(serde_json::to_string(value)?))
}

impl McpServer {
    pub fn new(state: AppState) -> Self {
        Self {
            host: state.config.server.host.clone(),
            port: state.config.server.port,
            state,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        info!("MCP server listening on {}", addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Accepted connection from {}", peer);

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    error!("Error handling connection: {:#}", e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let mut reader = BufReader::new(stream);

        loop {
            let Some(body) = read_http_body(&mut reader).await? else {
                break;
            };

            let response = match serde_json::from_slice::<JsonRpcRequest>(&body) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => JsonRpcResponse::error(Value::Null, PARSE_ERROR, &format!("Parse error: {}", e)),
            };
            send_response(reader.get_mut(), &response).await?;
        }

        Ok(())
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id;

        if request.method.starts_with("notifications/") {
            return JsonRpcResponse::success(id, Value::Null);
        }
        let Some(method) = McpMethod::from_str(&request.method) else {
            return JsonRpcResponse::error(id, METHOD_NOT_FOUND, "Method not found");
        };

        let result = match method {
            McpMethod::Initialize => serde_json::to_value(InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: Capabilities { tools: json!({}) },
                server_info: ServerInfo {
                    name: "conductor".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            }),
            McpMethod::Ping => Ok(json!({})),
            McpMethod::ToolsList => serde_json::to_value(ToolsListResult { tools: Self::get_tools() }),
            McpMethod::ToolsCall => {
                let call: ToolCall = match serde_json::from_value(request.params) {
                    Ok(call) => call,
                    Err(e) => {
                        return JsonRpcResponse::error(id, INVALID_PARAMS, &format!("Invalid params: {}", e));
                    }
                };
                let outcome = match self.call_tool(&call).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(tool = %call.name, "Tool call failed: {:#}", e);
                        ToolCallResult::failure(format!("{:#}", e))
                    }
                };
                serde_json::to_value(outcome)
            }
        };

        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, &e.to_string()),
        }
    }

    async fn call_tool(&self, call: &ToolCall) -> Result<ToolCallResult> {
        let manager = &self.state.session_manager;
        let coordinator = manager.coordinator();
        let args = &call.arguments;
        debug!(tool = %call.name, "Tool call");

        match call.name.as_str() {
            "create_session" => {
                let options: CreateSessionOptions = parse_args(args)?;
                json_text(&manager.create_session(options)?)
            }
            "send_message" => {
                let a: SendArgs = parse_args(args)?;
                json_text(&manager.send_message(&a.session_id, a.content).await?)
            }
            "cancel" => {
                let a: SessionArgs = parse_args(args)?;
                manager.cancel(&a.session_id).await?;
                json_text(&json!({ "session_id": a.session_id, "cancelled": true }))
            }
            "delete_session" => {
                let a: SessionArgs = parse_args(args)?;
                manager.delete_session(&a.session_id).await?;
                json_text(&json!({ "session_id": a.session_id, "deleted": true }))
            }
            "get_session" => {
                let a: SessionArgs = parse_args(args)?;
                json_text(&manager.session_info(&a.session_id)?)
            }
            "list_sessions" => {
                let a: ListArgs = parse_args(args)?;
                json_text(&json!({ "sessions": manager.list_sessions(a.workspace_id.as_deref()) }))
            }
            "get_messages" => {
                let a: SessionArgs = parse_args(args)?;
                json_text(&json!({ "messages": manager.messages(&a.session_id).await? }))
            }
            "set_permission_mode" => {
                let a: ModeArgs = parse_args(args)?;
                manager.set_permission_mode(&a.session_id, a.mode)?;
                json_text(&json!({ "session_id": a.session_id, "mode": a.mode }))
            }
            "respond_to_permission" => {
                let a: PermissionArgs = parse_args(args)?;
                manager
                    .respond_to_permission(&a.session_id, &a.request_id, a.allowed, a.remember)
                    .await?;
                json_text(&json!({ "request_id": a.request_id, "allowed": a.allowed }))
            }
            "respond_to_credential" => {
                let a: CredentialArgs = parse_args(args)?;
                let request_id = a.response.request_id.clone();
                manager.respond_to_credential(&a.session_id, a.response).await?;
                json_text(&json!({ "request_id": request_id, "resolved": true }))
            }
            "mark_read" => {
                let a: SessionArgs = parse_args(args)?;
                manager.mark_read(&a.session_id)?;
                json_text(&json!({ "session_id": a.session_id, "has_unread": false }))
            }
            "spawn_child" => {
                let a: SpawnArgs = parse_args(args)?;
                json_text(&coordinator.spawn_child(&a.session_id, a.request).await?)
            }
            "wait_for_children" => {
                let a: WaitArgs = parse_args(args)?;
                json_text(&coordinator.wait_for_children(&a.session_id, a.child_ids).await?)
            }
            "get_child_result" => {
                let a: ChildArgs = parse_args(args)?;
                json_text(&coordinator.get_child_result(&a.session_id, &a.child_id).await?)
            }
            "list_children" => {
                let a: SessionArgs = parse_args(args)?;
                json_text(&json!({ "children": coordinator.list_children(&a.session_id).await? }))
            }
            "review_child_plan" => {
                let a: ReviewArgs = parse_args(args)?;
                let decision = if a.approve {
                    PlanDecision::Approve { mode: a.mode }
                } else {
                    PlanDecision::Reject {
                        feedback: a.feedback.unwrap_or_default(),
                    }
                };
                coordinator.review_child_plan(&a.session_id, &a.child_id, decision).await?;
                json_text(&json!({ "child_id": a.child_id, "approved": a.approve }))
            }
            "list_workspaces" => json_text(&json!({ "workspaces": self.state.workspaces().list().await? })),
            "create_workspace" => {
                let a: WorkspaceArgs = parse_args(args)?;
                json_text(&self.state.workspaces().create(a.name, a.root_path).await?)
            }
            _ => Err(anyhow::anyhow!("Unknown tool: {}", call.name)),
        }
    }

    fn get_tools() -> Vec<Tool> {
        let session_only = json!({
            "type": "object",
            "properties": { "session_id": { "type": "string" } },
            "required": ["session_id"]
        });
        let child = json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string", "description": "Parent (orchestrator) session" },
                "child_id": { "type": "string" }
            },
            "required": ["session_id", "child_id"]
        });
        let mode = json!({ "type": "string", "enum": ["safe", "ask", "allow-all"] });

        let tool = |name: &str, description: &str, input_schema: Value| Tool {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        };

        vec![
            tool(
                "create_session",
                "Create a new top-level agent session",
                json!({
                    "type": "object",
                    "properties": {
                        "workspace_id": { "type": "string" },
                        "name": { "type": "string" },
                        "permission_mode": mode,
                        "model": { "type": "string" },
                        "labels": { "type": "array", "items": { "type": "string" } },
                        "enabled_sources": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["workspace_id"]
                }),
            ),
            tool(
                "send_message",
                "Send user input; starts a turn, steers the running one, or queues it",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "string" },
                        "content": { "type": "string" }
                    },
                    "required": ["session_id", "content"]
                }),
            ),
            tool("cancel", "Stop the running turn and drop queued input", session_only.clone()),
            tool("delete_session", "Delete a session and its history", session_only.clone()),
            tool("get_session", "Get a session's state", session_only.clone()),
            tool(
                "list_sessions",
                "List sessions, optionally for one workspace",
                json!({
                    "type": "object",
                    "properties": { "workspace_id": { "type": "string" } }
                }),
            ),
            tool("get_messages", "Get a session's message history", session_only.clone()),
            tool(
                "set_permission_mode",
                "Change what the agent may do without asking",
                json!({
                    "type": "object",
                    "properties": { "session_id": { "type": "string" }, "mode": mode },
                    "required": ["session_id", "mode"]
                }),
            ),
            tool(
                "respond_to_permission",
                "Answer a permission request raised by the agent",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "string" },
                        "request_id": { "type": "string" },
                        "allowed": { "type": "boolean" },
                        "remember": { "type": "boolean" }
                    },
                    "required": ["session_id", "request_id", "allowed"]
                }),
            ),
            tool(
                "respond_to_credential",
                "Supply or cancel a credential the agent asked for",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "string" },
                        "request_id": { "type": "string" },
                        "value": { "type": "string" },
                        "cancelled": { "type": "boolean" }
                    },
                    "required": ["session_id", "request_id"]
                }),
            ),
            tool("mark_read", "Clear a session's unread flag", session_only.clone()),
            tool(
                "spawn_child",
                "Spawn a child session under an orchestrator and send it an instruction",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "string", "description": "Parent (orchestrator) session" },
                        "name": { "type": "string", "description": "Unique among siblings; reused if it exists" },
                        "instruction": { "type": "string" },
                        "permission_mode": mode,
                        "model": { "type": "string" },
                        "auto_approve": { "type": "boolean", "description": "Approve this child's plans automatically" }
                    },
                    "required": ["session_id", "name", "instruction"]
                }),
            ),
            tool(
                "wait_for_children",
                "Suspend the orchestrator until the given children (default: all unfinished) complete",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "string" },
                        "child_ids": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["session_id"]
                }),
            ),
            tool("get_child_result", "Get one child's state and recorded result", child.clone()),
            tool("list_children", "List an orchestrator's children in spawn order", session_only),
            tool(
                "review_child_plan",
                "Approve or reject a plan a child submitted",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "string" },
                        "child_id": { "type": "string" },
                        "approve": { "type": "boolean" },
                        "mode": mode,
                        "feedback": { "type": "string" }
                    },
                    "required": ["session_id", "child_id", "approve"]
                }),
            ),
            tool("list_workspaces", "List workspaces", json!({ "type": "object", "properties": {} })),
            tool(
                "create_workspace",
                "Create a workspace",
                json!({
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "root_path": { "type": "string" }
                    },
                    "required": ["name"]
                }),
            ),
        ]
    }
}

/// Read one HTTP request and return its body; `None` when the peer closed
async fn read_http_body(reader: &mut BufReader<TcpStream>) -> Result<Option<Vec<u8>>> {
    let mut content_length = 0usize;
    let mut saw_request_line = false;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let line = line.trim_end();
        if line.is_empty() {
            if saw_request_line {
                break;
            }
            continue;
        }
        if !saw_request_line {
            saw_request_line = true;
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().context("Invalid Content-Length")?;
            }
        }
    }

    if content_length > MAX_BODY {
        anyhow::bail!("Request body too large: {} bytes", content_length);
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn send_response(stream: &mut TcpStream, response: &JsonRpcResponse) -> Result<()> {
    let response_str = serde_json::to_string(response)?;
    debug!("Sending: {}", response_str);

    let http_response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        response_str.len(),
        response_str
    );

    stream.write_all(http_response.as_bytes()).await?;
    stream.flush().await?;

    Ok(())
}

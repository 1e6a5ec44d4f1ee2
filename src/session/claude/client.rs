//! Claude Code CLI backend
//!
//! Every turn is one `claude -p` process in stream-json mode; the CLI's own
//! session id is kept so the next turn resumes the same conversation.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::parser::StreamJsonParser;
use crate::config::ClaudeConfig;
use crate::session::backend::{AgentBackend, BackendConfig, BackendFactory, TurnStream};
use crate::session::events::{AbortReason, TurnEvent};
use crate::session::types::PermissionMode;

const EVENT_BUFFER: usize = 256;
const STDERR_TAIL: usize = 2000;

fn cli_permission_mode(mode: PermissionMode) -> &'static str {
    match mode {
        PermissionMode::Safe => "plan",
        PermissionMode::Ask => "default",
        PermissionMode::AllowAll => "bypassPermissions",
    }
}

#[derive(Debug, Default)]
struct TurnState {
    resume_id: Option<String>,
    model: Option<String>,
    permission_mode: PermissionMode,
    cancel: Option<CancellationToken>,
}

/// One session's connection to the `claude` CLI
pub struct ClaudeBackend {
    claude_path: String,
    work_dir: PathBuf,
    state: Arc<Mutex<TurnState>>,
}

impl ClaudeBackend {
    pub fn new(claude_path: impl Into<String>, work_dir: impl Into<PathBuf>, config: &BackendConfig) -> Self {
        Self {
            claude_path: claude_path.into(),
            work_dir: work_dir.into(),
            state: Arc::new(Mutex::new(TurnState {
                resume_id: config.resume_id.clone(),
                model: config.model.clone(),
                permission_mode: config.permission_mode,
                cancel: None,
            })),
        }
    }

    fn command(&self, message: &str) -> Command {
        let (mode, model, resume) = {
            let state = self.state.lock();
            (state.permission_mode, state.model.clone(), state.resume_id.clone())
        };

        let mut cmd = Command::new(&self.claude_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages")
            .arg("--permission-mode")
            .arg(cli_permission_mode(mode));
        if let Some(model) = model.filter(|m| !m.trim().is_empty()) {
            cmd.arg("--model").arg(model);
        }
        if let Some(resume) = resume {
            cmd.arg("--resume").arg(resume);
        }
        cmd.arg(message);

        cmd.current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    async fn send(&self, message: &str) -> Result<TurnStream> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .with_context(|| format!("Failed to create work dir {:?}", self.work_dir))?;

        let mut child = self
            .command(message)
            .spawn()
            .context("Failed to start Claude Code process")?;
        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let stderr = child.stderr.take().context("Failed to get stderr")?;

        let cancel = CancellationToken::new();
        if let Some(previous) = self.state.lock().cancel.replace(cancel.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let state = self.state.clone();
        debug!(pid = ?child.id(), "Claude Code turn started");

        tokio::spawn(async move {
            let stderr_task = tokio::spawn(async move {
                let mut output = String::new();
                let _ = BufReader::new(stderr).read_to_string(&mut output).await;
                output
            });

            let mut parser = StreamJsonParser::new();
            let mut lines = BufReader::new(stdout).lines();
            let mut cancelled = false;
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    line = lines.next_line() => line,
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read Claude Code output: {}", e);
                        break;
                    }
                };

                for event in parser.parse_line(&line) {
                    if let TurnEvent::BackendSessionId { id } = &event {
                        state.lock().resume_id = Some(id.clone());
                    }
                    if tx.send(event).await.is_err() {
                        cancelled = true;
                        break;
                    }
                }
                if cancelled {
                    break;
                }
            }

            if cancelled {
                let _ = child.start_kill();
            }
            let status = child.wait().await;
            let stderr = stderr_task.await.unwrap_or_default();
            if let Some(model) = parser.model() {
                state.lock().model = Some(model.to_string());
            }

            let failed = matches!(&status, Ok(s) if !s.success()) || status.is_err();
            if failed && !cancelled && !parser.saw_result() {
                let tail: String = stderr
                    .chars()
                    .rev()
                    .take(STDERR_TAIL)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                let message = if tail.trim().is_empty() {
                    format!("Claude Code exited unexpectedly ({:?})", status)
                } else {
                    format!("Claude Code exited unexpectedly: {}", tail.trim())
                };
                let _ = tx.send(TurnEvent::Error { message }).await;
            }
            let _ = tx.send(TurnEvent::Complete).await;
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }

    fn abort(&self, reason: AbortReason) {
        if let Some(cancel) = self.state.lock().cancel.take() {
            debug!(reason = reason.as_str(), "Stopping Claude Code turn");
            cancel.cancel();
        }
    }

    async fn respond_to_permission(&self, _request_id: &str, _allowed: bool, _remember: bool) -> Result<()> {
        anyhow::bail!("Claude Code in print mode does not take permission responses; change the permission mode instead")
    }

    fn set_permission_mode(&self, mode: PermissionMode) {
        self.state.lock().permission_mode = mode;
    }

    fn model(&self) -> Option<String> {
        self.state.lock().model.clone()
    }

    fn backend_session_id(&self) -> Option<String> {
        self.state.lock().resume_id.clone()
    }
}

/// Builds `ClaudeBackend`s from the `claude` section of the config
#[derive(Debug, Clone)]
pub struct ClaudeBackendFactory {
    claude_path: String,
    work_dir: PathBuf,
}

impl ClaudeBackendFactory {
    pub fn new(config: &ClaudeConfig) -> Self {
        let claude_path = config.path.clone().unwrap_or_else(|| {
            which::which("claude")
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|_| "claude".to_string())
        });
        let work_dir = config
            .work_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("conductor"));

        Self { claude_path, work_dir }
    }

    pub fn claude_path(&self) -> &str {
        &self.claude_path
    }

    /// Check that the CLI runs
    pub async fn health_check(&self) -> Result<bool> {
        match Command::new(&self.claude_path).arg("--version").output().await {
            Ok(output) => Ok(output.status.success()),
            Err(e) => {
                warn!("Claude Code health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl BackendFactory for ClaudeBackendFactory {
    async fn create(&self, config: BackendConfig) -> Result<Arc<dyn AgentBackend>> {
        let work_dir = self.work_dir.join(&config.workspace_id);
        info!(session_id = %config.session_id, work_dir = ?work_dir, "Creating Claude Code backend");
        Ok(Arc::new(ClaudeBackend::new(self.claude_path.clone(), work_dir, &config)))
    }
}

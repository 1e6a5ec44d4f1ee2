//! Turn lifecycle: start, drive the backend stream, finish, drain the queue

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tracing::{debug, info, warn};

use super::backend::{AgentBackend, BackendConfig};
use super::events::{AbortReason, TurnEvent};
use super::manager::{not_found, SessionManager};
use super::notify::{EngineEvent, UserMessageStatus};
use super::processor::TurnContext;
use super::types::{ChildStatus, Message, PauseReason, SessionRecord, TokenUsage};

/// Everything a freshly started turn needs, captured under the registry lock
#[derive(Debug, Clone)]
pub(crate) struct TurnStart {
    pub generation: u64,
    pub message_id: String,
    pub content: String,
    pub is_retry: bool,
    pub message: Option<Message>,
}

/// Move an idle session into `Processing` for a new turn
pub(crate) fn begin_turn(s: &mut SessionRecord, message_id: &str, content: &str, is_retry: bool) -> TurnStart {
    s.is_processing = true;
    s.processing_generation += 1;
    s.stop_requested = false;
    s.pending_abort = None;
    s.paused = None;
    s.meta.model_locked = true;
    s.meta.last_turn_status = None;
    if !is_retry {
        s.auth_retry_attempted = false;
    }

    TurnStart {
        generation: s.processing_generation,
        message_id: message_id.to_string(),
        content: content.to_string(),
        is_retry,
        message: s.messages.iter().find(|m| m.id == message_id).cloned(),
    }
}

/// Pop the front of the queue and start it
pub(crate) fn begin_next_queued(s: &mut SessionRecord) -> Option<TurnStart> {
    let next = s.pending.pop_front()?;
    if let Some(message) = s.message_mut(&next.message_id) {
        message.is_queued = false;
    }
    Some(begin_turn(s, &next.message_id, &next.content, false))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnOutcome {
    Completed,
    Failed,
    Aborted(AbortReason),
    AuthRetry,
}

struct Finished {
    outcome: TurnOutcome,
    retry: Option<TurnStart>,
    terminal: Option<ChildStatus>,
    drain: bool,
    unread_changed: bool,
    parent_id: Option<String>,
    usage: TokenUsage,
}

impl SessionManager {
    pub(crate) fn spawn_turn(&self, id: &str, start: TurnStart) {
        let generation = start.generation;
        let task = tokio::spawn(self.clone().run_turn(id.to_string(), start));
        self.inner
            .turn_tasks
            .lock()
            .insert(id.to_string(), (generation, task.abort_handle()));

        if let Some(parent_id) = self.inner.registry.with(id, |s| s.meta.parent_id.clone()).flatten() {
            self.emit(
                &parent_id,
                EngineEvent::ChildStatusChanged {
                    child_id: id.to_string(),
                    is_processing: true,
                    status: None,
                },
            );
        }
    }

    // Boxed: a turn can start further turns, so the future type must not be recursive.
    fn run_turn(self, id: String, start: TurnStart) -> BoxFuture<'static, ()> {
        async move {
            let Some(workspace_id) = self.inner.registry.with(&id, |s| s.meta.workspace_id.clone()) else {
                return;
            };
            let mut ctx = TurnContext::new(&id, &workspace_id, &start);
            debug!(session_id = %id, generation = start.generation, retry = start.is_retry, "Turn started");

            if let Err(e) = self.drive_turn(&mut ctx).await {
                self.turn_failed(&mut ctx, &e);
            }
            if ctx.auth_retry {
                self.refresh_for_retry(&mut ctx).await;
            }
            self.finish_turn(&id, ctx).await;
        }
        .boxed()
    }

    pub(crate) fn is_current(&self, id: &str, generation: u64) -> bool {
        self.inner
            .registry
            .with(id, |s| s.is_processing && s.processing_generation == generation)
            .unwrap_or(false)
    }

    /// The session's backend, created through the factory on first use
    pub(crate) async fn ensure_backend(&self, id: &str) -> Result<Arc<dyn AgentBackend>> {
        let (existing, config) = self
            .inner
            .registry
            .with(id, |s| {
                (
                    s.backend.clone(),
                    BackendConfig {
                        session_id: s.meta.id.clone(),
                        workspace_id: s.meta.workspace_id.clone(),
                        model: s.meta.model.clone(),
                        connection: s.meta.connection.clone(),
                        permission_mode: s.meta.permission_mode,
                        resume_id: s.meta.backend_session_id.clone(),
                    },
                )
            })
            .ok_or_else(|| not_found(id))?;

        if let Some(backend) = existing {
            return Ok(backend);
        }

        let created = self
            .inner
            .factory
            .create(config)
            .await
            .context("Failed to create agent backend")?;

        self.inner
            .registry
            .with_mut(id, |s| s.backend.get_or_insert_with(|| created.clone()).clone())
            .ok_or_else(|| not_found(id))
    }

    /// Pull the backend's events for one turn until it completes or goes stale
    async fn drive_turn(&self, ctx: &mut TurnContext) -> Result<()> {
        let backend = self.ensure_backend(&ctx.session_id).await?;
        if !self.is_current(&ctx.session_id, ctx.generation) {
            return Ok(());
        }

        let mut stream = backend
            .send(&ctx.content)
            .await
            .context("Backend failed to start the turn")?;

        while let Some(event) = stream.next().await {
            if !self.is_current(&ctx.session_id, ctx.generation) {
                debug!(session_id = %ctx.session_id, generation = ctx.generation, "Dropping events of stale turn");
                break;
            }
            let complete = matches!(event, TurnEvent::Complete);
            self.handle_event(ctx, event);
            if complete || ctx.auth_retry {
                break;
            }
        }
        Ok(())
    }

    /// Leave `Processing` exactly once per turn and decide what follows
    pub(crate) async fn finish_turn(&self, id: &str, ctx: TurnContext) {
        let viewing = self.is_viewing(id);

        let finished = self
            .inner
            .registry
            .with_mut(id, |s| {
                if !s.is_processing || s.processing_generation != ctx.generation {
                    return None;
                }

                // Only a user stop cancels a pending auth retry; anything sent
                // meanwhile stays queued behind it.
                let abort = s.pending_abort.take();
                let outcome = match abort {
                    Some(AbortReason::UserStop) => TurnOutcome::Aborted(AbortReason::UserStop),
                    _ if ctx.auth_retry => TurnOutcome::AuthRetry,
                    Some(reason) => TurnOutcome::Aborted(reason),
                    None if ctx.errored => TurnOutcome::Failed,
                    None => TurnOutcome::Completed,
                };

                if outcome == TurnOutcome::AuthRetry {
                    // The session goes straight into the retry without ever leaving Processing.
                    let retry = begin_turn(s, &ctx.user_message_id, &ctx.content, true);
                    return Some(Finished {
                        outcome,
                        retry: Some(retry),
                        terminal: None,
                        drain: false,
                        unread_changed: false,
                        parent_id: s.meta.parent_id.clone(),
                        usage: s.meta.usage.clone(),
                    });
                }

                s.is_processing = false;
                s.stop_requested = false;
                if ctx.forced {
                    s.backend = None;
                }

                match outcome {
                    TurnOutcome::Aborted(AbortReason::PlanSubmitted) => s.paused = Some(PauseReason::PlanReview),
                    TurnOutcome::Aborted(AbortReason::AuthRequest) => s.paused = Some(PauseReason::Authentication),
                    TurnOutcome::Completed => s.was_interrupted = false,
                    _ => {}
                }

                let terminal = match outcome {
                    TurnOutcome::Completed => Some(ChildStatus::Completed),
                    TurnOutcome::Failed => Some(ChildStatus::Error),
                    TurnOutcome::Aborted(AbortReason::UserStop) => Some(ChildStatus::Cancelled),
                    _ => None,
                }
                .filter(|_| s.pending.is_empty());
                s.meta.last_turn_status = terminal;

                let unread_changed = !viewing && !s.meta.has_unread;
                if unread_changed {
                    s.meta.has_unread = true;
                }

                Some(Finished {
                    outcome,
                    retry: None,
                    terminal,
                    drain: s.paused.is_none() && !s.pending.is_empty(),
                    unread_changed,
                    parent_id: s.meta.parent_id.clone(),
                    usage: s.meta.usage.clone(),
                })
            })
            .flatten();

        let Some(finished) = finished else {
            debug!(session_id = id, generation = ctx.generation, "Ignoring stale turn completion");
            return;
        };

        self.inner.batcher.flush(id);
        if let Some(retry) = finished.retry {
            info!(session_id = id, generation = retry.generation, "Retrying turn after credential failure");
            self.persist(id);
            self.spawn_turn(id, retry);
            return;
        }
        self.clear_stop_timer(id);
        self.persist_now(id).await;

        match finished.outcome {
            TurnOutcome::Completed | TurnOutcome::Failed => {
                self.emit(id, EngineEvent::Complete { usage: finished.usage.clone() })
            }
            TurnOutcome::Aborted(reason) => self.emit(id, EngineEvent::Interrupted { reason }),
            TurnOutcome::AuthRetry => {}
        }
        if finished.unread_changed {
            self.emit(id, EngineEvent::UnreadChanged { has_unread: true });
        }
        info!(session_id = id, generation = ctx.generation, outcome = ?finished.outcome, "Turn finished");

        if finished.drain {
            self.schedule_next(id);
        }

        if let Some(parent_id) = &finished.parent_id {
            self.emit(
                parent_id,
                EngineEvent::ChildStatusChanged {
                    child_id: id.to_string(),
                    is_processing: false,
                    status: finished.terminal,
                },
            );
            let coordinator = self.coordinator();
            if finished.outcome == TurnOutcome::Aborted(AbortReason::PlanSubmitted) {
                coordinator.plan_submitted(parent_id, id).await;
            }
            if finished.terminal.is_some() {
                coordinator.child_finished(id).await;
            }
        }
    }

    /// Start the next queued message on a later scheduler tick
    pub(crate) fn schedule_next(&self, id: &str) {
        let manager = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            manager.start_next_queued(&id);
        });
    }

    /// Dequeue and start the next message if the session is idle and not paused
    pub(crate) fn start_next_queued(&self, id: &str) -> bool {
        let start = self
            .inner
            .registry
            .with_mut(id, |s| {
                if s.is_processing || s.paused.is_some() {
                    None
                } else {
                    begin_next_queued(s)
                }
            })
            .flatten();

        let Some(start) = start else {
            return false;
        };
        self.persist(id);
        if let Some(message) = start.message.clone() {
            self.emit(
                id,
                EngineEvent::UserMessage {
                    message,
                    status: UserMessageStatus::Processing,
                },
            );
        }
        self.spawn_turn(id, start);
        true
    }

    pub(crate) fn arm_stop_timer(&self, id: &str, generation: u64) {
        let manager = self.downgrade();
        let timeout = self.inner.config.stop_timeout();
        let session_id = id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.force_stop(&session_id, generation).await;
            }
        });
        if let Some(previous) = self.inner.stop_timers.lock().insert(id.to_string(), timer) {
            previous.abort();
        }
    }

    fn clear_stop_timer(&self, id: &str) {
        if let Some(timer) = self.inner.stop_timers.lock().remove(id) {
            timer.abort();
        }
    }

    /// The backend never drained after a stop: complete the turn ourselves
    async fn force_stop(&self, id: &str, generation: u64) {
        // This runs on the timer task itself; forget it instead of aborting it.
        self.inner.stop_timers.lock().remove(id);

        if !self.is_current(id, generation) {
            return;
        }
        warn!(session_id = id, generation, "Backend did not drain after stop, forcing completion");

        let stale = {
            let mut tasks = self.inner.turn_tasks.lock();
            match tasks.get(id) {
                Some((g, _)) if *g == generation => tasks.remove(id).map(|(_, task)| task),
                _ => None,
            }
        };

        let ctx = self
            .inner
            .registry
            .with(id, |s| TurnContext::forced(id, &s.meta.workspace_id, generation));
        if let Some(ctx) = ctx {
            self.finish_turn(id, ctx).await;
        }
        if let Some(task) = stale {
            task.abort();
        }
    }
}

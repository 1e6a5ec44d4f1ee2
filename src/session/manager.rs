//! Session manager
//!
//! Front door of the engine: owns the registry and every per-session
//! resource, and exposes the operations callers use. Turn execution lives in
//! `turn.rs`, event handling in `processor.rs`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OnceCell};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};
use uuid::Uuid;

use super::abort::record_abort;
use super::auth::{CredentialService, NoopCredentials};
use super::backend::BackendFactory;
use super::batcher::DeltaBatcher;
use super::events::AbortReason;
use super::notify::{EngineEvent, EventBus, Notification, UserMessageStatus, WorkspaceReceiver};
use super::registry::SessionRegistry;
use super::turn::{begin_next_queued, begin_turn};
use super::types::{
    Message, PermissionMode, QueuedMessage, SessionInfo, SessionMeta, SessionRecord,
};
use crate::config::EngineConfig;
use crate::core::{EngineError, ErrorReporter, MonotonicClock, TracingReporter};
use crate::db::{PersistenceQueue, SessionStore};
use crate::orchestration::Coordinator;

/// Options for a new top-level session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionOptions {
    pub workspace_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub enabled_sources: Vec<String>,
}

/// What happened to a submitted message
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SendOutcome {
    pub message_id: String,
    pub status: UserMessageStatus,
}

/// Answer to an auth request raised by the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialResponse {
    pub request_id: String,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SubmitOptions {
    /// Try to inject into a running turn before redirecting it
    pub allow_steer: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self { allow_steer: true }
    }
}

pub(crate) struct Inner {
    pub config: EngineConfig,
    pub registry: SessionRegistry,
    pub bus: EventBus,
    pub batcher: DeltaBatcher,
    pub persistence: PersistenceQueue,
    pub factory: Arc<dyn BackendFactory>,
    pub credentials: Arc<dyn CredentialService>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub clock: MonotonicClock,
    pub loads: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
    pub stop_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    pub watchdogs: Mutex<HashMap<String, JoinHandle<()>>>,
    pub supervised: Mutex<HashMap<String, JoinHandle<Result<()>>>>,
    pub turn_tasks: Mutex<HashMap<String, (u64, AbortHandle)>>,
    pub viewing: Mutex<Option<String>>,
}

/// Cheaply cloneable handle to the session engine
#[derive(Clone)]
pub struct SessionManager {
    pub(crate) inner: Arc<Inner>,
}

/// Handle held by timers so they never keep the engine alive
#[derive(Clone)]
pub(crate) struct WeakManager(Weak<Inner>);

impl WeakManager {
    pub fn upgrade(&self) -> Option<SessionManager> {
        self.0.upgrade().map(|inner| SessionManager { inner })
    }
}

pub struct SessionManagerBuilder {
    config: EngineConfig,
    store: Arc<dyn SessionStore>,
    factory: Arc<dyn BackendFactory>,
    credentials: Option<Arc<dyn CredentialService>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl SessionManagerBuilder {
    pub fn credentials(mut self, credentials: Arc<dyn CredentialService>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn build(self) -> SessionManager {
        let bus = EventBus::new(self.config.event_capacity);
        let batcher = DeltaBatcher::new(self.config.delta_flush_interval(), bus.clone());
        let persistence = PersistenceQueue::new(self.store, self.config.persist_debounce());

        SessionManager {
            inner: Arc::new(Inner {
                registry: SessionRegistry::new(),
                bus,
                batcher,
                persistence,
                factory: self.factory,
                credentials: self.credentials.unwrap_or_else(|| Arc::new(NoopCredentials)),
                reporter: self.reporter.unwrap_or_else(|| Arc::new(TracingReporter)),
                clock: MonotonicClock::new(),
                loads: Mutex::new(HashMap::new()),
                stop_timers: Mutex::new(HashMap::new()),
                watchdogs: Mutex::new(HashMap::new()),
                supervised: Mutex::new(HashMap::new()),
                turn_tasks: Mutex::new(HashMap::new()),
                viewing: Mutex::new(None),
                config: self.config,
            }),
        }
    }
}

pub(crate) fn not_found(id: &str) -> anyhow::Error {
    EngineError::SessionNotFound(id.to_string()).into()
}

impl SessionManager {
    pub fn builder(
        config: EngineConfig,
        store: Arc<dyn SessionStore>,
        factory: Arc<dyn BackendFactory>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            store,
            factory,
            credentials: None,
            reporter: None,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakManager {
        WeakManager(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.bus.subscribe()
    }

    pub fn subscribe_workspace(&self, workspace_id: impl Into<String>) -> WorkspaceReceiver {
        self.inner.bus.subscribe_workspace(workspace_id)
    }

    /// Parent/child orchestration operations
    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.clone())
    }

    // ---- bookkeeping helpers -------------------------------------------

    pub(crate) fn now(&self) -> i64 {
        self.inner.clock.now()
    }

    /// Publish an event for a live session
    pub(crate) fn emit(&self, id: &str, event: EngineEvent) {
        if let Some(workspace_id) = self.inner.registry.with(id, |s| s.meta.workspace_id.clone()) {
            self.inner.bus.publish(&workspace_id, id, event);
        }
    }

    /// Queue a debounced write of the session's current state
    pub(crate) fn persist(&self, id: &str) {
        let now = Utc::now().timestamp_millis();
        let snapshot = self.inner.registry.with_mut(id, |s| {
            s.meta.updated_at = now;
            s.snapshot()
        });
        if let Some(snapshot) = snapshot {
            self.inner.persistence.enqueue(snapshot);
        }
    }

    /// Write the session's current state before returning
    pub(crate) async fn persist_now(&self, id: &str) {
        self.persist(id);
        self.inner.persistence.flush(id).await;
    }

    pub(crate) fn is_viewing(&self, id: &str) -> bool {
        self.inner.viewing.lock().as_deref() == Some(id)
    }

    /// Load the message body of a metadata-only session.
    ///
    /// Concurrent callers share one load. Queued user messages found in
    /// storage were never processed and come back flagged as recovered.
    pub(crate) async fn ensure_loaded(&self, id: &str) -> Result<()> {
        let loaded = self
            .inner
            .registry
            .with(id, |s| s.messages_loaded)
            .ok_or_else(|| not_found(id))?;
        if loaded {
            return Ok(());
        }

        let cell = self
            .inner
            .loads
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_try_init(|| async {
                let messages = self
                    .inner
                    .persistence
                    .store()
                    .load_messages(id)
                    .await
                    .with_context(|| format!("Failed to load messages for session {}", id))?;

                if let Some(latest) = messages.iter().map(|m| m.timestamp).max() {
                    self.inner.clock.observe(latest);
                }

                let recovered = self.inner.registry.with_mut(id, |s| {
                    if s.messages_loaded {
                        return 0;
                    }
                    let mut recovered = 0;
                    s.messages = messages
                        .into_iter()
                        .map(|mut m| {
                            if m.is_queued {
                                m.is_queued = false;
                                m.queue_recovered = true;
                                recovered += 1;
                            }
                            m
                        })
                        .collect();
                    s.messages_loaded = true;
                    recovered
                });
                if let Some(count) = recovered.filter(|c| *c > 0) {
                    info!(session_id = id, count, "Recovered unprocessed queued message(s)");
                }
                Ok::<(), anyhow::Error>(())
            })
            .await
            .map(|_| ());

        self.inner.loads.lock().remove(id);
        result
    }

    // ---- lifecycle -------------------------------------------------------

    /// Open a new, empty top-level session
    pub fn create_session(&self, options: CreateSessionOptions) -> Result<SessionInfo> {
        let now = self.now();
        let meta = SessionMeta {
            id: Uuid::new_v4().to_string(),
            workspace_id: options.workspace_id,
            name: options.name,
            created_at: now,
            updated_at: now,
            permission_mode: options.permission_mode,
            model: options.model,
            connection: options.connection,
            labels: options.labels,
            enabled_sources: options.enabled_sources,
            ..Default::default()
        };

        let record = SessionRecord::new(meta);
        let info = SessionInfo::from(&record);
        let snapshot = record.snapshot();
        if !self.inner.registry.insert(record) {
            return Err(EngineError::invalid_state(&info.id, "session id already exists").into());
        }

        self.inner.persistence.enqueue(snapshot);
        self.inner
            .bus
            .publish(&info.workspace_id, &info.id, EngineEvent::SessionCreated);
        info!(session_id = %info.id, workspace_id = %info.workspace_id, "Created session");
        Ok(info)
    }

    /// Register every stored session as a metadata-only record
    pub async fn load_persisted(&self) -> Result<usize> {
        let metas = self
            .inner
            .persistence
            .store()
            .list()
            .await
            .context("Failed to list stored sessions")?;

        let mut loaded = 0;
        let mut waiting = Vec::new();
        for meta in metas {
            let is_waiting = meta.orchestration.as_ref().map_or(false, |o| o.is_waiting());
            let id = meta.id.clone();
            if self.inner.registry.insert(SessionRecord::from_meta(meta)) {
                loaded += 1;
                if is_waiting {
                    waiting.push(id);
                }
            }
        }

        let coordinator = self.coordinator();
        for parent_id in waiting {
            debug!(session_id = %parent_id, "Re-arming watchdog for waiting orchestrator");
            coordinator.arm_watchdog(&parent_id);
        }

        info!("Loaded {} persisted session(s)", loaded);
        Ok(loaded)
    }

    /// Abort any in-flight turn, wait briefly for teardown, then remove the
    /// session and every resource keyed by it
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        if !self.inner.registry.contains(id) {
            return Err(not_found(id));
        }

        self.abort_turn(id, AbortReason::UserStop);

        let deadline = tokio::time::Instant::now() + self.inner.config.delete_grace();
        while self.inner.registry.with(id, |s| s.is_processing).unwrap_or(false)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let record = self.inner.registry.remove(id).ok_or_else(|| not_found(id))?;

        self.inner.batcher.clear(id);
        if let Some(timer) = self.inner.stop_timers.lock().remove(id) {
            timer.abort();
        }
        if let Some(watchdog) = self.inner.watchdogs.lock().remove(id) {
            watchdog.abort();
        }
        if let Some(task) = self.inner.supervised.lock().remove(id) {
            task.abort();
        }
        if let Some((_, task)) = self.inner.turn_tasks.lock().remove(id) {
            task.abort();
        }
        self.inner.loads.lock().remove(id);
        {
            let mut viewing = self.inner.viewing.lock();
            if viewing.as_deref() == Some(id) {
                *viewing = None;
            }
        }

        self.inner.persistence.discard(id).await;
        self.inner
            .persistence
            .store()
            .delete(id)
            .await
            .with_context(|| format!("Failed to delete session {}", id))?;

        self.inner
            .bus
            .publish(&record.meta.workspace_id, id, EngineEvent::SessionDeleted);
        info!(session_id = id, "Deleted session");

        if record.is_child() {
            self.coordinator().child_removed(&record).await;
        }
        Ok(())
    }

    // ---- turns -----------------------------------------------------------

    /// Submit user input; starts a turn, steers the running one, or queues it
    pub async fn send_message(&self, id: &str, content: impl Into<String>) -> Result<SendOutcome> {
        self.submit(id, content.into(), SubmitOptions::default()).await
    }

    pub(crate) async fn submit(&self, id: &str, content: String, options: SubmitOptions) -> Result<SendOutcome> {
        self.ensure_loaded(id).await?;

        // Steering happens outside the critical section; it may await the backend.
        let steer_target = self
            .inner
            .registry
            .with(id, |s| {
                let busy = s.is_processing && !s.stop_requested && s.pending_abort.is_none();
                if options.allow_steer && busy {
                    s.backend
                        .clone()
                        .filter(|b| b.supports_steering())
                        .map(|b| (b, s.processing_generation))
                } else {
                    None
                }
            })
            .ok_or_else(|| not_found(id))?;
        let steered_into = match steer_target {
            Some((backend, generation)) => backend.steer(&content).await.then_some(generation),
            None => None,
        };

        let (status, start, dequeued, abort_backend, message) = self
            .inner
            .registry
            .with_mut(id, |s| {
                let mut message = Message::user(content.clone(), self.now());

                // The steer only counts if the turn it went into is still running.
                if let Some(generation) = steered_into {
                    if s.is_processing && s.processing_generation == generation {
                        s.messages.push(message.clone());
                        return (UserMessageStatus::Accepted, None, None, None, message);
                    }
                    debug!(session_id = id, "Steered turn ended first, resubmitting");
                }

                if !s.is_processing {
                    if s.pending.is_empty() {
                        s.messages.push(message.clone());
                        let start = begin_turn(s, &message.id, &content, false);
                        return (UserMessageStatus::Processing, Some(start), None, None, message);
                    }
                    // Idle with a retained queue: keep submission order.
                    message.is_queued = true;
                    s.messages.push(message.clone());
                    s.pending.push_back(QueuedMessage {
                        message_id: message.id.clone(),
                        content: content.clone(),
                    });
                    let start = begin_next_queued(s);
                    let dequeued = start.as_ref().and_then(|t| t.message.clone());
                    return (UserMessageStatus::Queued, start, dequeued, None, message);
                }

                message.is_queued = true;
                s.messages.push(message.clone());
                s.pending.push_back(QueuedMessage {
                    message_id: message.id.clone(),
                    content: content.clone(),
                });
                let abort_backend = if record_abort(s, AbortReason::Redirect) {
                    s.backend.clone()
                } else {
                    None
                };
                (UserMessageStatus::Queued, None, None, abort_backend, message)
            })
            .ok_or_else(|| not_found(id))?;
        let message_id = message.id.clone();

        if let Some(backend) = abort_backend {
            debug!(session_id = id, "Redirecting in-flight turn");
            backend.abort(AbortReason::Redirect);
        }

        self.persist(id);
        self.emit(id, EngineEvent::UserMessage { message, status });
        if let Some(message) = dequeued {
            self.emit(
                id,
                EngineEvent::UserMessage {
                    message,
                    status: UserMessageStatus::Processing,
                },
            );
        }
        if let Some(start) = start {
            self.spawn_turn(id, start);
        }

        Ok(SendOutcome { message_id, status })
    }

    /// Stop the session: drop queued input, abort the turn, and give the
    /// backend a bounded time to drain
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.ensure_loaded(id).await?;

        let (signal, generation, was_waiting, dropped) = self
            .inner
            .registry
            .with_mut(id, |s| {
                let dropped: Vec<String> = s.pending.drain(..).map(|q| q.message_id).collect();
                s.messages.retain(|m| !dropped.contains(&m.id));
                s.paused = None;

                let signal = if s.is_processing && record_abort(s, AbortReason::UserStop) {
                    Some(s.backend.clone())
                } else {
                    None
                };

                let was_waiting = s
                    .meta
                    .orchestration
                    .as_mut()
                    .map(|o| {
                        let was = o.is_waiting();
                        o.waiting_for.clear();
                        o.wait_targets.clear();
                        was
                    })
                    .unwrap_or(false);

                (signal, s.processing_generation, was_waiting, dropped.len())
            })
            .ok_or_else(|| not_found(id))?;

        info!(session_id = id, dropped, "Cancel requested");

        if let Some(backend) = signal {
            if let Some(backend) = backend {
                backend.abort(AbortReason::UserStop);
            }
            self.arm_stop_timer(id, generation);
        }
        if was_waiting {
            self.coordinator().disarm_watchdog(id);
        }

        self.persist_now(id).await;
        Ok(())
    }

    // ---- session settings --------------------------------------------------

    pub fn mark_read(&self, id: &str) -> Result<()> {
        let changed = self
            .inner
            .registry
            .with_mut(id, |s| std::mem::replace(&mut s.meta.has_unread, false))
            .ok_or_else(|| not_found(id))?;
        if changed {
            self.persist(id);
            self.emit(id, EngineEvent::UnreadChanged { has_unread: false });
        }
        Ok(())
    }

    /// Record which session the user is looking at; it is marked read
    pub fn set_viewing(&self, id: Option<&str>) -> Result<()> {
        if let Some(id) = id {
            self.mark_read(id)?;
        }
        *self.inner.viewing.lock() = id.map(str::to_string);
        Ok(())
    }

    pub fn set_permission_mode(&self, id: &str, mode: PermissionMode) -> Result<()> {
        let backend = self
            .inner
            .registry
            .with_mut(id, |s| {
                s.meta.permission_mode = mode;
                s.backend.clone()
            })
            .ok_or_else(|| not_found(id))?;
        if let Some(backend) = backend {
            backend.set_permission_mode(mode);
        }
        self.persist(id);
        self.emit(id, EngineEvent::PermissionModeChanged { mode });
        Ok(())
    }

    /// Change model/connection; refused once the first turn has started
    pub fn set_model(&self, id: &str, model: Option<String>, connection: Option<String>) -> Result<()> {
        self.inner
            .registry
            .with_mut(id, |s| {
                if s.meta.model_locked {
                    return Err(anyhow::Error::from(EngineError::ModelLocked(id.to_string())));
                }
                s.meta.model = model.clone();
                s.meta.connection = connection.clone();
                Ok(())
            })
            .ok_or_else(|| not_found(id))??;
        self.persist(id);
        self.emit(id, EngineEvent::ModelChanged { model, connection });
        Ok(())
    }

    pub fn set_labels(&self, id: &str, labels: Vec<String>) -> Result<()> {
        self.inner
            .registry
            .with_mut(id, |s| s.meta.labels = labels.clone())
            .ok_or_else(|| not_found(id))?;
        self.persist(id);
        self.emit(id, EngineEvent::LabelsChanged { labels });
        Ok(())
    }

    pub fn set_sources(&self, id: &str, sources: Vec<String>) -> Result<()> {
        self.inner
            .registry
            .with_mut(id, |s| s.meta.enabled_sources = sources.clone())
            .ok_or_else(|| not_found(id))?;
        self.persist(id);
        self.emit(id, EngineEvent::SourcesChanged { sources });
        Ok(())
    }

    /// Forward a permission decision to the session's live backend
    pub async fn respond_to_permission(
        &self,
        id: &str,
        request_id: &str,
        allowed: bool,
        remember: bool,
    ) -> Result<()> {
        let backend = self
            .inner
            .registry
            .with(id, |s| s.backend.clone())
            .ok_or_else(|| not_found(id))?
            .ok_or_else(|| EngineError::invalid_state(id, "no active backend"))?;
        backend.respond_to_permission(request_id, allowed, remember).await
    }

    /// Re-enqueue user messages recovered from storage, keeping their ids
    pub async fn resend_recovered(&self, id: &str) -> Result<usize> {
        self.ensure_loaded(id).await?;

        let (count, start) = self
            .inner
            .registry
            .with_mut(id, |s| {
                let mut recovered = Vec::new();
                for m in s.messages.iter_mut().filter(|m| m.queue_recovered) {
                    m.queue_recovered = false;
                    m.is_queued = true;
                    recovered.push(QueuedMessage {
                        message_id: m.id.clone(),
                        content: m.content.clone(),
                    });
                }
                let count = recovered.len();
                s.pending.extend(recovered);
                let start = if s.is_processing {
                    None
                } else {
                    begin_next_queued(s)
                };
                (count, start)
            })
            .ok_or_else(|| not_found(id))?;

        if count == 0 {
            return Ok(0);
        }

        info!(session_id = id, count, "Resending recovered message(s)");
        self.persist(id);
        if let Some(start) = start {
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
        }
        Ok(count)
    }

    // ---- queries -----------------------------------------------------------

    pub async fn messages(&self, id: &str) -> Result<Vec<Message>> {
        self.ensure_loaded(id).await?;
        self.inner
            .registry
            .with(id, |s| s.messages.clone())
            .ok_or_else(|| not_found(id))
    }

    pub fn session_info(&self, id: &str) -> Result<SessionInfo> {
        self.inner.registry.info(id).ok_or_else(|| not_found(id))
    }

    /// Sessions of one workspace, or all of them
    pub fn list_sessions(&self, workspace_id: Option<&str>) -> Vec<SessionInfo> {
        self.inner
            .registry
            .list()
            .into_iter()
            .filter(|s| workspace_id.map_or(true, |ws| s.workspace_id == ws))
            .collect()
    }

    /// Write every pending snapshot (shutdown path)
    pub async fn flush_all(&self) {
        self.inner.persistence.flush_all().await;
    }
}

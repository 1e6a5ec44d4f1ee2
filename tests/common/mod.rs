// Shared test harness: a channel-driven fake agent backend

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use conductor::config::EngineConfig;
use conductor::db::MemorySessionStore;
use conductor::session::{
    AbortReason, AgentBackend, BackendConfig, BackendFactory, CreateSessionOptions, CredentialService,
    Notification, SessionManager, TurnEvent, TurnStream,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

pub const WAIT: Duration = Duration::from_secs(3);

pub fn test_config() -> EngineConfig {
    EngineConfig {
        delta_flush_interval_ms: 20,
        stop_timeout_ms: 150,
        delete_grace_ms: 150,
        watchdog_interval_ms: 40,
        resume_retry_delay_ms: 20,
        persist_debounce_ms: 5,
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FakeOptions {
    /// Accept mid-turn input instead of forcing a redirect
    pub steerable: bool,
    /// Keep streaming after an abort, so only the stop timeout ends the turn
    pub ignore_abort: bool,
    /// `steer` completes the running turn and only then reports success
    pub steer_ends_turn: bool,
}

/// One `send` call on a fake backend; the test plays the agent through it
pub struct FakeTurn {
    pub session_id: String,
    pub input: String,
    tx: mpsc::UnboundedSender<TurnEvent>,
}

impl FakeTurn {
    pub fn send(&self, event: TurnEvent) {
        let _ = self.tx.send(event);
    }

    pub fn delta(&self, text: &str) {
        self.send(TurnEvent::TextDelta {
            text: text.to_string(),
            turn_id: Some("t1".to_string()),
        });
    }

    pub fn text(&self, text: &str) {
        self.send(TurnEvent::TextComplete {
            text: text.to_string(),
            turn_id: Some("t1".to_string()),
            is_intermediate: false,
            parent_tool_use_id: None,
        });
    }

    pub fn complete(&self) {
        self.send(TurnEvent::Complete);
    }

    /// Final answer followed by completion
    pub fn finish(&self, text: &str) {
        self.text(text);
        self.complete();
    }
}

pub struct FakeBackend {
    session_id: String,
    options: FakeOptions,
    turns: mpsc::UnboundedSender<FakeTurn>,
    current: Mutex<Option<mpsc::UnboundedSender<TurnEvent>>>,
    pub aborts: Mutex<Vec<AbortReason>>,
    pub steered: Mutex<Vec<String>>,
}

#[async_trait]
impl AgentBackend for FakeBackend {
    async fn send(&self, message: &str) -> Result<TurnStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.current.lock() = Some(tx.clone());
        let _ = self.turns.send(FakeTurn {
            session_id: self.session_id.clone(),
            input: message.to_string(),
            tx,
        });
        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) });
        Ok(stream.boxed())
    }

    fn abort(&self, reason: AbortReason) {
        self.aborts.lock().push(reason);
        if self.options.ignore_abort {
            return;
        }
        if let Some(tx) = self.current.lock().take() {
            let _ = tx.send(TurnEvent::Complete);
        }
    }

    fn supports_steering(&self) -> bool {
        self.options.steerable
    }

    async fn steer(&self, message: &str) -> bool {
        self.steered.lock().push(message.to_string());
        if self.options.steer_ends_turn {
            if let Some(tx) = self.current.lock().take() {
                let _ = tx.send(TurnEvent::Complete);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.options.steerable
    }

    async fn respond_to_permission(&self, _request_id: &str, _allowed: bool, _remember: bool) -> Result<()> {
        Ok(())
    }

    fn model(&self) -> Option<String> {
        None
    }

    fn backend_session_id(&self) -> Option<String> {
        None
    }
}

pub struct FakeFactory {
    options: FakeOptions,
    turns: mpsc::UnboundedSender<FakeTurn>,
    pub created: AtomicUsize,
    pub backends: Mutex<Vec<Arc<FakeBackend>>>,
}

impl FakeFactory {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Latest backend created for a session
    pub fn backend_for(&self, session_id: &str) -> Option<Arc<FakeBackend>> {
        self.backends
            .lock()
            .iter()
            .rev()
            .find(|b| b.session_id == session_id)
            .cloned()
    }
}

#[async_trait]
impl BackendFactory for FakeFactory {
    async fn create(&self, config: BackendConfig) -> Result<Arc<dyn AgentBackend>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let backend = Arc::new(FakeBackend {
            session_id: config.session_id,
            options: self.options,
            turns: self.turns.clone(),
            current: Mutex::new(None),
            aborts: Mutex::new(Vec::new()),
            steered: Mutex::new(Vec::new()),
        });
        self.backends.lock().push(backend.clone());
        Ok(backend)
    }
}

/// A factory plus the receiving end of every turn its backends start
pub fn fake_factory(options: FakeOptions) -> (Arc<FakeFactory>, mpsc::UnboundedReceiver<FakeTurn>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let factory = Arc::new(FakeFactory {
        options,
        turns: tx,
        created: AtomicUsize::new(0),
        backends: Mutex::new(Vec::new()),
    });
    (factory, rx)
}

pub struct Harness {
    pub manager: SessionManager,
    pub store: Arc<MemorySessionStore>,
    pub factory: Arc<FakeFactory>,
    pub events: broadcast::Receiver<Notification>,
    turns: mpsc::UnboundedReceiver<FakeTurn>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(FakeOptions::default(), None)
    }

    pub fn with_options(options: FakeOptions) -> Self {
        Self::build(options, None)
    }

    pub fn with_credentials(credentials: Arc<dyn CredentialService>) -> Self {
        Self::build(FakeOptions::default(), Some(credentials))
    }

    fn build(options: FakeOptions, credentials: Option<Arc<dyn CredentialService>>) -> Self {
        let store = Arc::new(MemorySessionStore::new());
        let (factory, rx) = fake_factory(options);

        let mut builder = SessionManager::builder(test_config(), store.clone(), factory.clone());
        if let Some(credentials) = credentials {
            builder = builder.credentials(credentials);
        }
        let manager = builder.build();
        let events = manager.subscribe();

        Self {
            manager,
            store,
            factory,
            events,
            turns: rx,
        }
    }

    pub fn create(&self, name: &str) -> String {
        self.manager
            .create_session(CreateSessionOptions {
                workspace_id: "ws".to_string(),
                name: Some(name.to_string()),
                ..Default::default()
            })
            .unwrap()
            .id
    }

    /// Next turn started on any fake backend
    pub async fn next_turn(&mut self) -> FakeTurn {
        tokio::time::timeout(WAIT, self.turns.recv())
            .await
            .expect("timed out waiting for a turn")
            .expect("turn channel closed")
    }

    /// Assert no further turn starts within `window`
    pub async fn no_turn_within(&mut self, window: Duration) {
        if let Ok(Some(turn)) = tokio::time::timeout(window, self.turns.recv()).await {
            panic!("unexpected turn for {} with input {:?}", turn.session_id, turn.input);
        }
    }

    pub async fn wait_until(&self, what: &str, mut check: impl FnMut(&SessionManager) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check(&self.manager) {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting until {}", what);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_idle(&self, id: &str) {
        self.wait_until("session is idle", |m| !m.session_info(id).unwrap().is_processing)
            .await;
    }

    /// Every notification received so far
    pub fn drain_events(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.events.try_recv() {
            out.push(n);
        }
        out
    }
}

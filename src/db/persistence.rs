//! Debounced session writer

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::store::SessionStore;
use crate::session::types::StoredSession;

#[derive(Default)]
struct QueueState {
    pending: HashMap<String, StoredSession>,
    scheduled: bool,
}

/// Coalesces snapshots per session and writes them after a short delay.
///
/// The latest snapshot of a session wins. Writes are serialized and a batch is
/// only taken from `pending` while holding the write lock, so an older snapshot
/// can never land after a newer one. Storage errors are logged, never returned
/// to the engine.
#[derive(Clone)]
pub struct PersistenceQueue {
    store: Arc<dyn SessionStore>,
    debounce: Duration,
    state: Arc<Mutex<QueueState>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl PersistenceQueue {
    pub fn new(store: Arc<dyn SessionStore>, debounce: Duration) -> Self {
        Self {
            store,
            debounce,
            state: Arc::new(Mutex::new(QueueState::default())),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Queue a snapshot for the next debounced write
    pub fn enqueue(&self, session: StoredSession) {
        let schedule = {
            let mut state = self.state.lock();
            let id = session.meta.id.clone();
            let session = match state.pending.remove(&id) {
                // a metadata-only snapshot must not drop a pending message body
                Some(prev) if session.messages.is_none() => StoredSession {
                    meta: session.meta,
                    messages: prev.messages,
                },
                _ => session,
            };
            state.pending.insert(id, session);
            !std::mem::replace(&mut state.scheduled, true)
        };

        if schedule {
            let queue = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(queue.debounce).await;
                queue.state.lock().scheduled = false;
                queue.flush_all().await;
            });
        }
    }

    /// Write one session's pending snapshot now
    pub async fn flush(&self, session_id: &str) {
        let _guard = self.write_lock.lock().await;
        let pending = self.state.lock().pending.remove(session_id);
        if let Some(session) = pending {
            self.write(&session).await;
        }
    }

    /// Write everything that is pending
    pub async fn flush_all(&self) {
        let _guard = self.write_lock.lock().await;
        let batch: Vec<StoredSession> = self.state.lock().pending.drain().map(|(_, s)| s).collect();
        if !batch.is_empty() {
            debug!("Flushing {} session snapshot(s)", batch.len());
        }
        for session in &batch {
            self.write(session).await;
        }
    }

    /// Forget a session's pending snapshot and wait out any in-flight write
    pub async fn discard(&self, session_id: &str) {
        let _guard = self.write_lock.lock().await;
        self.state.lock().pending.remove(session_id);
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    async fn write(&self, session: &StoredSession) {
        if let Err(e) = self.store.save(session).await {
            warn!(session_id = %session.meta.id, "Failed to persist session: {:#}", e);
        }
    }
}

//! In-memory session table

use std::collections::HashMap;

use parking_lot::Mutex;

use super::types::{SessionInfo, SessionRecord};

/// Owned table of live session records.
///
/// Every accessor runs its closure inside one critical section, so a closure
/// sees and leaves a consistent record. Closures must not block or await.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record; returns false if the id is already present
    pub fn insert(&self, record: SessionRecord) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(record.id()) {
            return false;
        }
        sessions.insert(record.id().to_string(), record);
        true
    }

    pub fn remove(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.lock().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with<R>(&self, id: &str, f: impl FnOnce(&SessionRecord) -> R) -> Option<R> {
        self.sessions.lock().get(id).map(f)
    }

    pub fn with_mut<R>(&self, id: &str, f: impl FnOnce(&mut SessionRecord) -> R) -> Option<R> {
        self.sessions.lock().get_mut(id).map(f)
    }

    /// Atomic section across several sessions (parent/child bookkeeping)
    pub fn with_all<R>(&self, f: impl FnOnce(&mut HashMap<String, SessionRecord>) -> R) -> R {
        f(&mut self.sessions.lock())
    }

    pub fn generation(&self, id: &str) -> Option<u64> {
        self.with(id, |s| s.processing_generation)
    }

    pub fn info(&self, id: &str) -> Option<SessionInfo> {
        self.with(id, |s| SessionInfo::from(s))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.lock().values().map(SessionInfo::from).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }
}

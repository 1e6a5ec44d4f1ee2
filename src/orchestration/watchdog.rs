//! Periodic safety net for waiting orchestrators
//!
//! Completions normally arrive through `child_finished`. If one is lost (a
//! child removed mid-turn, a restart while waiting) the watchdog reconciles
//! the parent until its wait ends.

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::coordinator::Coordinator;

impl Coordinator {
    /// Start (or restart) the watchdog of a waiting parent
    pub(crate) fn arm_watchdog(&self, parent_id: &str) {
        let manager = self.manager.downgrade();
        let period = self.manager.config().watchdog_interval();
        let parent = parent_id.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if !manager.coordinator().watchdog_tick(&parent).await {
                    break;
                }
            }
        });

        if let Some(previous) = self.manager.inner.watchdogs.lock().insert(parent_id.to_string(), task) {
            previous.abort();
        }
        debug!(parent_id, "Watchdog armed");
    }

    pub(crate) fn disarm_watchdog(&self, parent_id: &str) {
        if let Some(task) = self.manager.inner.watchdogs.lock().remove(parent_id) {
            task.abort();
            debug!(parent_id, "Watchdog disarmed");
        }
    }

    /// One watchdog pass; returns whether the parent is still waiting
    pub async fn watchdog_tick(&self, parent_id: &str) -> bool {
        let waiting = self
            .manager
            .inner
            .registry
            .with(parent_id, |s| s.meta.orchestration.as_ref().map_or(false, |o| o.is_waiting()))
            .unwrap_or(false);
        if !waiting {
            return false;
        }

        match self.reconcile(parent_id).await {
            Ok(recovered) if !recovered.is_empty() => {
                warn!(parent_id, count = recovered.len(), "Watchdog recovered missed child completion(s)");
            }
            Ok(_) => {}
            Err(e) => warn!(parent_id, "Watchdog reconcile failed: {:#}", e),
        }

        self.manager
            .inner
            .registry
            .with(parent_id, |s| s.meta.orchestration.as_ref().map_or(false, |o| o.is_waiting()))
            .unwrap_or(false)
    }
}

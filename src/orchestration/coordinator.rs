//! Orchestration coordinator
//!
//! A parent session spawns children, suspends itself until the children it
//! names have finished, and is resumed with a summary of their results.
//! Every completion goes through `reconcile_locked`, which runs inside one
//! registry critical section and is idempotent per child id.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::summary::{resume_message, truncate_summary};
use crate::core::EngineError;
use crate::session::events::AbortReason;
use crate::session::manager::{not_found, SessionManager, SubmitOptions};
use crate::session::notify::EngineEvent;
use crate::session::types::{
    ChildStatus, CompletionRecord, OrchestrationState, PauseReason, PermissionMode, SessionMeta,
    SessionRecord,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnChildRequest {
    /// Display name; spawning the same name twice returns the existing child
    pub name: String,
    /// First message sent to the child
    pub instruction: String,
    #[serde(default)]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default)]
    pub model: Option<String>,
    /// Approve this child's plans without asking the parent
    #[serde(default)]
    pub auto_approve: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpawnedChild {
    pub child_id: String,
    pub name: String,
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WaitOutcome {
    /// Nothing left to wait for
    Ready { results: Vec<CompletionRecord> },
    /// The parent is suspended until these children finish
    Waiting { pending: Vec<String> },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChildInfo {
    pub child_id: String,
    pub name: String,
    pub sibling_order: Option<u32>,
    pub is_processing: bool,
    pub paused: Option<PauseReason>,
    pub result: Option<CompletionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PlanDecision {
    /// Continue with the plan; the child switches to `mode` (default allow-all)
    Approve {
        #[serde(default)]
        mode: Option<PermissionMode>,
    },
    Reject { feedback: String },
}

const PLAN_APPROVED: &str = "The plan has been approved. Proceed with the implementation.";

#[derive(Debug, Default)]
struct Reconciled {
    recorded: Vec<CompletionRecord>,
    resume: Option<Vec<CompletionRecord>>,
}

/// Completion record for a finished child, or `None` while it is still running
fn completion_for(
    child: &SessionRecord,
    spawn_failure: Option<&String>,
    now: i64,
    summary_chars: usize,
) -> Option<CompletionRecord> {
    let name = child.meta.name.clone().unwrap_or_else(|| child.meta.id.clone());

    if let Some(failure) = spawn_failure {
        return Some(CompletionRecord {
            child_id: child.meta.id.clone(),
            name,
            status: ChildStatus::Error,
            summary: truncate_summary(failure, summary_chars),
            usage: child.meta.usage.clone(),
            completed_at: now,
        });
    }

    if child.is_processing || !child.pending.is_empty() || child.paused.is_some() {
        return None;
    }
    let status = child.meta.last_turn_status?;
    let summary = child
        .final_output()
        .map(|m| truncate_summary(&m.content, summary_chars))
        .unwrap_or_default();

    Some(CompletionRecord {
        child_id: child.meta.id.clone(),
        name,
        status,
        summary,
        usage: child.meta.usage.clone(),
        completed_at: now,
    })
}

/// Append a record unless the child is already recorded
fn push_record(orch: &mut OrchestrationState, record: CompletionRecord) -> bool {
    if orch.is_recorded(&record.child_id) {
        return false;
    }
    orch.completed_results.push(record);
    true
}

/// Drop recorded ids from the wait set; if that ends the wait, the results to resume with
fn settle_wait(orch: &mut OrchestrationState) -> Option<Vec<CompletionRecord>> {
    if !orch.is_waiting() {
        return None;
    }
    let recorded: HashSet<String> = orch.completed_results.iter().map(|r| r.child_id.clone()).collect();
    orch.waiting_for.retain(|id| !recorded.contains(id));
    if orch.is_waiting() {
        return None;
    }

    let targets = std::mem::take(&mut orch.wait_targets);
    let results = targets
        .iter()
        .filter_map(|id| orch.result_for(id).cloned())
        .collect();
    Some(results)
}

fn children_of<'a>(
    sessions: &'a HashMap<String, SessionRecord>,
    parent_id: &'a str,
) -> impl Iterator<Item = &'a SessionRecord> + 'a {
    sessions
        .values()
        .filter(move |s| s.meta.parent_id.as_deref() == Some(parent_id))
}

fn sorted_child_ids(sessions: &HashMap<String, SessionRecord>, parent_id: &str) -> Vec<String> {
    let mut children: Vec<&SessionRecord> = children_of(sessions, parent_id).collect();
    children.sort_by_key(|s| (s.meta.sibling_order, s.meta.created_at));
    children.into_iter().map(|s| s.meta.id.clone()).collect()
}

/// Record every finished-but-unrecorded child of `parent_id` and settle the wait.
///
/// Must run inside `SessionRegistry::with_all`.
fn reconcile_locked(
    sessions: &mut HashMap<String, SessionRecord>,
    parent_id: &str,
    spawn_failures: &HashMap<String, String>,
    now: i64,
    summary_chars: usize,
) -> Reconciled {
    let Some(parent) = sessions.get(parent_id) else {
        return Reconciled::default();
    };
    let orch = parent.meta.orchestration.clone().unwrap_or_default();

    let mut candidates = sorted_child_ids(sessions, parent_id);
    for id in &orch.waiting_for {
        if !candidates.contains(id) {
            candidates.push(id.clone());
        }
    }

    let mut recorded = Vec::new();
    for child_id in candidates {
        if orch.is_recorded(&child_id) {
            continue;
        }
        let record = match sessions.get(&child_id) {
            Some(child) => completion_for(child, spawn_failures.get(&child_id), now, summary_chars),
            None => Some(CompletionRecord {
                name: child_id.clone(),
                child_id,
                status: ChildStatus::Cancelled,
                summary: "Child session no longer exists".to_string(),
                usage: Default::default(),
                completed_at: now,
            }),
        };
        recorded.extend(record);
    }

    let Some(parent) = sessions.get_mut(parent_id) else {
        return Reconciled::default();
    };
    if recorded.is_empty() && parent.meta.orchestration.is_none() {
        return Reconciled::default();
    }
    let orch = parent.meta.orchestration.get_or_insert_with(Default::default);
    recorded.retain(|r| push_record(orch, r.clone()));
    let resume = settle_wait(orch);

    Reconciled { recorded, resume }
}

/// Orchestration operations over a `SessionManager`
#[derive(Clone)]
pub struct Coordinator {
    pub(crate) manager: SessionManager,
}

impl Coordinator {
    pub(crate) fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    fn summary_chars(&self) -> usize {
        self.manager.config().child_summary_chars
    }

    /// Create (or reuse, by name) a child session and send it its instruction
    pub async fn spawn_child(&self, parent_id: &str, request: SpawnChildRequest) -> Result<SpawnedChild> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::invalid_state(parent_id, "child name must not be empty").into());
        }

        let now = self.manager.now();
        let spawned = self.manager.inner.registry.with_all(|sessions| -> Result<(String, bool)> {
            let parent = sessions.get(parent_id).ok_or_else(|| not_found(parent_id))?;
            if parent.is_child() {
                return Err(EngineError::invalid_state(parent_id, "child sessions cannot spawn children").into());
            }

            if let Some(existing) = children_of(sessions, parent_id).find(|s| s.meta.name.as_deref() == Some(name.as_str())) {
                return Ok((existing.meta.id.clone(), true));
            }

            let meta = SessionMeta {
                id: Uuid::new_v4().to_string(),
                workspace_id: parent.meta.workspace_id.clone(),
                name: Some(name.clone()),
                created_at: now,
                updated_at: now,
                permission_mode: request.permission_mode.unwrap_or(parent.meta.permission_mode),
                model: request.model.clone().or_else(|| parent.meta.model.clone()),
                connection: parent.meta.connection.clone(),
                parent_id: Some(parent_id.to_string()),
                sibling_order: Some(children_of(sessions, parent_id).count() as u32),
                enabled_sources: parent.meta.enabled_sources.clone(),
                ..Default::default()
            };
            let child_id = meta.id.clone();
            sessions.insert(child_id.clone(), SessionRecord::new(meta));

            if let Some(parent) = sessions.get_mut(parent_id) {
                let orch = parent.meta.orchestration.get_or_insert_with(Default::default);
                if request.auto_approve && !orch.auto_approve_children.contains(&child_id) {
                    orch.auto_approve_children.push(child_id.clone());
                }
            }
            Ok((child_id, false))
        })?;

        let (child_id, reused) = spawned;
        if reused {
            info!(parent_id, child_id = %child_id, name = %name, "Reusing existing child");
            return Ok(SpawnedChild { child_id, name, reused });
        }

        self.manager.persist(parent_id);
        self.manager.persist(&child_id);
        self.manager.emit(&child_id, EngineEvent::SessionCreated);
        info!(parent_id, child_id = %child_id, name = %name, "Spawned child session");

        let manager = self.manager.clone();
        let target = child_id.clone();
        let instruction = request.instruction;
        let task: JoinHandle<Result<()>> =
            tokio::spawn(async move { manager.send_message(&target, instruction).await.map(|_| ()) });
        self.manager.inner.supervised.lock().insert(child_id.clone(), task);

        Ok(SpawnedChild { child_id, name, reused })
    }

    /// Suspend the parent until the given children (default: every child not
    /// yet recorded) have finished
    pub async fn wait_for_children(&self, parent_id: &str, child_ids: Option<Vec<String>>) -> Result<WaitOutcome> {
        let failures = self.reap_supervised().await;
        self.load_children(parent_id).await;

        let now = self.manager.now();
        let summary_chars = self.summary_chars();
        let (outcome, reconciled, others) = self.manager.inner.registry.with_all(|sessions| -> Result<_> {
            let parent = sessions.get(parent_id).ok_or_else(|| not_found(parent_id))?;
            if parent.is_child() {
                return Err(EngineError::NotAnOrchestrator(parent_id.to_string()).into());
            }

            let children = sorted_child_ids(sessions, parent_id);
            if let Some(ids) = &child_ids {
                if let Some(unknown) = ids.iter().find(|id| !children.contains(id)) {
                    return Err(EngineError::ChildNotFound {
                        parent: parent_id.to_string(),
                        child: unknown.clone(),
                    }
                    .into());
                }
            }

            let others = Self::record_foreign_failures(sessions, parent_id, &failures, now, summary_chars);
            let reconciled = reconcile_locked(sessions, parent_id, &failures, now, summary_chars);

            let Some(parent) = sessions.get_mut(parent_id) else {
                return Err(not_found(parent_id));
            };
            let orch = parent.meta.orchestration.get_or_insert_with(Default::default);

            let targets: Vec<String> = match child_ids {
                Some(ids) => {
                    let mut seen = HashSet::new();
                    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
                }
                None => children.into_iter().filter(|id| !orch.is_recorded(id)).collect(),
            };
            let pending: Vec<String> = targets.iter().filter(|id| !orch.is_recorded(id)).cloned().collect();

            if pending.is_empty() {
                let results = if targets.is_empty() {
                    orch.completed_results.clone()
                } else {
                    targets.iter().filter_map(|id| orch.result_for(id).cloned()).collect()
                };
                return Ok((WaitOutcome::Ready { results }, reconciled, others));
            }

            orch.waiting_for = pending.iter().cloned().collect::<BTreeSet<_>>();
            orch.wait_targets = targets;
            Ok((WaitOutcome::Waiting { pending }, reconciled, others))
        })?;

        for (other_parent, result) in others {
            self.apply(&other_parent, result);
        }
        self.apply(parent_id, reconciled);

        if let WaitOutcome::Waiting { pending } = &outcome {
            info!(parent_id, pending = ?pending, "Orchestrator waiting for children");
            self.manager.persist(parent_id);
            self.manager.emit(
                parent_id,
                EngineEvent::OrchestratorWaiting {
                    waiting_for: pending.clone(),
                },
            );
            self.manager.abort_turn(parent_id, AbortReason::WaitingForChildren);
            self.arm_watchdog(parent_id);
        }
        Ok(outcome)
    }

    /// Record a child's outcome on its parent; returns false if it was already recorded
    pub async fn record_completion(&self, parent_id: &str, record: CompletionRecord) -> Result<bool> {
        let reconciled = self
            .manager
            .inner
            .registry
            .with_mut(parent_id, |parent| {
                let orch = parent.meta.orchestration.get_or_insert_with(Default::default);
                if !push_record(orch, record.clone()) {
                    return Reconciled::default();
                }
                Reconciled {
                    recorded: vec![record],
                    resume: settle_wait(orch),
                }
            })
            .ok_or_else(|| not_found(parent_id))?;

        Ok(!self.apply(parent_id, reconciled).is_empty())
    }

    /// Record any child of `parent_id` that finished without being recorded.
    ///
    /// Safe to call at any time and from several places at once; returns the
    /// records this call added.
    pub async fn reconcile(&self, parent_id: &str) -> Result<Vec<CompletionRecord>> {
        let failures = self.reap_supervised().await;
        self.load_children(parent_id).await;

        let now = self.manager.now();
        let summary_chars = self.summary_chars();
        let (reconciled, others) = self.manager.inner.registry.with_all(|sessions| {
            if !sessions.contains_key(parent_id) {
                return Err(not_found(parent_id));
            }
            let others = Self::record_foreign_failures(sessions, parent_id, &failures, now, summary_chars);
            Ok((reconcile_locked(sessions, parent_id, &failures, now, summary_chars), others))
        })?;

        for (other_parent, result) in others {
            self.apply(&other_parent, result);
        }
        Ok(self.apply(parent_id, reconciled))
    }

    /// Result of one child, reconciling first
    pub async fn get_child_result(&self, parent_id: &str, child_id: &str) -> Result<ChildInfo> {
        self.reconcile(parent_id).await?;

        self.manager
            .inner
            .registry
            .with_all(|sessions| -> Result<ChildInfo> {
                let result = sessions
                    .get(parent_id)
                    .and_then(|p| p.meta.orchestration.as_ref())
                    .and_then(|o| o.result_for(child_id).cloned());

                match sessions.get(child_id) {
                    Some(child) if child.meta.parent_id.as_deref() == Some(parent_id) => {
                        Ok(child_info(child, result))
                    }
                    // Deleted children are still known through their record
                    None if result.is_some() => Ok(ChildInfo {
                        child_id: child_id.to_string(),
                        name: result.as_ref().map(|r| r.name.clone()).unwrap_or_default(),
                        sibling_order: None,
                        is_processing: false,
                        paused: None,
                        result,
                    }),
                    _ => Err(EngineError::ChildNotFound {
                        parent: parent_id.to_string(),
                        child: child_id.to_string(),
                    }
                    .into()),
                }
            })
    }

    /// Children of a parent in spawn order, reconciling first
    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<ChildInfo>> {
        self.reconcile(parent_id).await?;

        Ok(self.manager.inner.registry.with_all(|sessions| {
            let orch = sessions.get(parent_id).and_then(|p| p.meta.orchestration.clone());
            sorted_child_ids(sessions, parent_id)
                .iter()
                .filter_map(|id| sessions.get(id))
                .map(|child| {
                    let result = orch.as_ref().and_then(|o| o.result_for(&child.meta.id).cloned());
                    child_info(child, result)
                })
                .collect()
        }))
    }

    /// Approve or reject a plan a child submitted for review
    pub async fn review_child_plan(&self, parent_id: &str, child_id: &str, decision: PlanDecision) -> Result<()> {
        self.manager
            .inner
            .registry
            .with(child_id, |child| {
                if child.meta.parent_id.as_deref() != Some(parent_id) {
                    return Err(EngineError::ChildNotFound {
                        parent: parent_id.to_string(),
                        child: child_id.to_string(),
                    });
                }
                if child.paused != Some(PauseReason::PlanReview) {
                    return Err(EngineError::invalid_state(child_id, "no plan is awaiting review"));
                }
                Ok(())
            })
            .ok_or_else(|| not_found(child_id))??;

        let prompt = match decision {
            PlanDecision::Approve { mode } => {
                let mode = mode.unwrap_or(PermissionMode::AllowAll);
                info!(parent_id, child_id, mode = mode.as_str(), "Plan approved");
                self.manager.set_permission_mode(child_id, mode)?;
                PLAN_APPROVED.to_string()
            }
            PlanDecision::Reject { feedback } => {
                info!(parent_id, child_id, "Plan rejected");
                format!(
                    "The plan was rejected. Revise it and submit a new plan.\n\nFeedback: {}",
                    feedback
                )
            }
        };

        self.manager.submit(child_id, prompt, SubmitOptions::default()).await?;
        Ok(())
    }

    // ---- engine hooks ------------------------------------------------------

    /// A child's turn ended terminally
    pub(crate) async fn child_finished(&self, child_id: &str) {
        let Some(parent_id) = self
            .manager
            .inner
            .registry
            .with(child_id, |s| s.meta.parent_id.clone())
            .flatten()
        else {
            return;
        };
        if let Err(e) = self.reconcile(&parent_id).await {
            warn!(parent_id = %parent_id, child_id, "Failed to record child completion: {:#}", e);
        }
    }

    /// A child was deleted; its parent must not wait for it forever
    pub(crate) async fn child_removed(&self, child: &SessionRecord) {
        let Some(parent_id) = child.meta.parent_id.as_deref() else {
            return;
        };
        let summary = child
            .final_output()
            .map(|m| truncate_summary(&m.content, self.summary_chars()))
            .unwrap_or_default();
        let record = CompletionRecord {
            child_id: child.meta.id.clone(),
            name: child.meta.name.clone().unwrap_or_else(|| child.meta.id.clone()),
            status: child
                .meta
                .last_turn_status
                .filter(|_| !child.is_processing)
                .unwrap_or(ChildStatus::Cancelled),
            summary,
            usage: child.meta.usage.clone(),
            completed_at: self.manager.now(),
        };
        if let Err(e) = self.record_completion(parent_id, record).await {
            warn!(parent_id, child_id = %child.meta.id, "Failed to record deleted child: {:#}", e);
        }
    }

    /// A child paused on a plan; approve it straight away if the parent opted in
    pub(crate) async fn plan_submitted(&self, parent_id: &str, child_id: &str) {
        let auto_approve = self
            .manager
            .inner
            .registry
            .with(parent_id, |p| {
                p.meta
                    .orchestration
                    .as_ref()
                    .map_or(false, |o| o.auto_approve_children.iter().any(|c| c == child_id))
            })
            .unwrap_or(false);

        if !auto_approve {
            return;
        }
        info!(parent_id, child_id, "Fast-tracking child plan");
        if let Err(e) = self
            .review_child_plan(parent_id, child_id, PlanDecision::Approve { mode: None })
            .await
        {
            warn!(parent_id, child_id, "Plan fast-track failed: {:#}", e);
        }
    }

    // ---- internals -----------------------------------------------------------

    /// Persist and announce what a reconciliation changed; start the resume if the wait ended
    fn apply(&self, parent_id: &str, reconciled: Reconciled) -> Vec<CompletionRecord> {
        if reconciled.recorded.is_empty() && reconciled.resume.is_none() {
            return reconciled.recorded;
        }

        self.manager.persist(parent_id);
        for record in &reconciled.recorded {
            info!(
                parent_id,
                child_id = %record.child_id,
                status = record.status.as_str(),
                "Recorded child completion"
            );
        }

        if let Some(results) = reconciled.resume {
            let coordinator = self.clone();
            let parent = parent_id.to_string();
            tokio::spawn(async move { coordinator.resume_parent(&parent, results).await });
            // Last: this may be running on the watchdog task itself.
            self.disarm_watchdog(parent_id);
        }
        reconciled.recorded
    }

    async fn resume_parent(&self, parent_id: &str, results: Vec<CompletionRecord>) {
        info!(parent_id, children = results.len(), "Resuming orchestrator");
        self.manager.emit(
            parent_id,
            EngineEvent::OrchestratorResumed {
                results: results.clone(),
            },
        );

        let summary = resume_message(&results);
        let options = SubmitOptions { allow_steer: false };
        if let Err(e) = self.manager.submit(parent_id, summary.clone(), options).await {
            warn!(parent_id, "Resume failed, retrying once: {:#}", e);
            tokio::time::sleep(self.manager.config().resume_retry_delay()).await;
            if let Err(e) = self.manager.submit(parent_id, summary, options).await {
                error!(parent_id, "Failed to resume orchestrator: {:#}", e);
            }
        }
    }

    /// Collect supervised spawn tasks that have ended; returns the failed ones
    async fn reap_supervised(&self) -> HashMap<String, String> {
        let finished: Vec<(String, JoinHandle<Result<()>>)> = {
            let mut supervised = self.manager.inner.supervised.lock();
            let done: Vec<String> = supervised
                .iter()
                .filter(|(_, task)| task.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            done.into_iter()
                .filter_map(|id| supervised.remove(&id).map(|task| (id, task)))
                .collect()
        };

        let mut failures = HashMap::new();
        for (child_id, task) in finished {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(child_id = %child_id, "Child never started: {:#}", e);
                    failures.insert(child_id, format!("Failed to start: {:#}", e));
                }
                Err(e) => {
                    warn!(child_id = %child_id, "Child spawn task ended abnormally: {}", e);
                    failures.insert(child_id, format!("Spawn task failed: {}", e));
                }
            }
        }
        failures
    }

    /// Spawn failures reaped on behalf of other parents must still be recorded there
    fn record_foreign_failures(
        sessions: &mut HashMap<String, SessionRecord>,
        parent_id: &str,
        failures: &HashMap<String, String>,
        now: i64,
        summary_chars: usize,
    ) -> Vec<(String, Reconciled)> {
        let mut parents: Vec<String> = failures
            .keys()
            .filter_map(|child| sessions.get(child).and_then(|c| c.meta.parent_id.clone()))
            .filter(|p| p != parent_id)
            .collect();
        parents.sort();
        parents.dedup();

        parents
            .into_iter()
            .map(|p| {
                let reconciled = reconcile_locked(sessions, &p, failures, now, summary_chars);
                (p, reconciled)
            })
            .collect()
    }

    /// Make sure children's histories are in memory so summaries can be built
    async fn load_children(&self, parent_id: &str) {
        let ids = self
            .manager
            .inner
            .registry
            .with_all(|sessions| sorted_child_ids(sessions, parent_id));
        for id in ids {
            if let Err(e) = self.manager.ensure_loaded(&id).await {
                warn!(child_id = %id, "Failed to load child history: {:#}", e);
            }
        }
    }
}

fn child_info(child: &SessionRecord, result: Option<CompletionRecord>) -> ChildInfo {
    ChildInfo {
        child_id: child.meta.id.clone(),
        name: child.meta.name.clone().unwrap_or_else(|| child.meta.id.clone()),
        sibling_order: child.meta.sibling_order,
        is_processing: child.is_processing,
        paused: child.paused,
        result,
    }
}

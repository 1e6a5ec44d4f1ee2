// Parent/child orchestration: spawn, wait, resume, plan review, watchdog

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{FakeTurn, Harness};
use conductor::core::EngineError;
use conductor::db::SessionStore;
use conductor::orchestration::{PlanDecision, SpawnChildRequest, WaitOutcome};
use conductor::session::types::{
    ChildStatus, CompletionRecord, Message, MessageRole, OrchestrationState, PermissionMode, SessionMeta,
    StoredSession, TokenUsage,
};
use conductor::session::{AbortReason, EngineEvent, PauseReason, TurnEvent};

fn request(name: &str, instruction: &str) -> SpawnChildRequest {
    SpawnChildRequest {
        name: name.to_string(),
        instruction: instruction.to_string(),
        ..Default::default()
    }
}

fn engine_error(err: &anyhow::Error) -> &EngineError {
    err.downcast_ref::<EngineError>().expect("not an engine error")
}

/// Collect `n` turns and key them by session
async fn turns_by_session(h: &mut Harness, n: usize) -> HashMap<String, FakeTurn> {
    let mut turns = HashMap::new();
    for _ in 0..n {
        let turn = h.next_turn().await;
        turns.insert(turn.session_id.clone(), turn);
    }
    turns
}

#[tokio::test]
async fn test_parent_resumes_after_all_children_finish() {
    let mut h = Harness::new();
    let coordinator = h.manager.coordinator();
    let parent = h.create("lead");

    h.manager.send_message(&parent, "split the work").await.unwrap();
    let _lead_turn = h.next_turn().await;

    let a = coordinator.spawn_child(&parent, request("A", "write the parser")).await.unwrap();
    let b = coordinator.spawn_child(&parent, request("B", "write the tests")).await.unwrap();
    assert!(!a.reused && !b.reused);

    let mut turns = turns_by_session(&mut h, 2).await;
    assert_eq!(turns[&a.child_id].input, "write the parser");
    assert_eq!(turns[&b.child_id].input, "write the tests");

    let child = h.manager.session_info(&b.child_id).unwrap();
    assert_eq!(child.parent_id.as_deref(), Some(parent.as_str()));
    assert_eq!(child.sibling_order, Some(1));

    let outcome = coordinator
        .wait_for_children(&parent, Some(vec![a.child_id.clone(), b.child_id.clone()]))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WaitOutcome::Waiting {
            pending: vec![a.child_id.clone(), b.child_id.clone()]
        }
    );
    let lead_backend = h.factory.backend_for(&parent).unwrap();
    assert_eq!(*lead_backend.aborts.lock(), vec![AbortReason::WaitingForChildren]);

    // One child done: still waiting on the other
    turns.remove(&a.child_id).unwrap().finish("parser done");
    let waiting_b = vec![b.child_id.clone()];
    h.wait_until("A is recorded", |m| m.session_info(&parent).unwrap().waiting_for == waiting_b)
        .await;
    h.no_turn_within(Duration::from_millis(60)).await;
    assert!(!h.manager.session_info(&parent).unwrap().is_processing);

    turns.remove(&b.child_id).unwrap().finish("tests done");
    let resumed = h.next_turn().await;
    assert_eq!(resumed.session_id, parent);
    let a_line = resumed.input.find("**A** (completed): parser done").unwrap();
    let b_line = resumed.input.find("**B** (completed): tests done").unwrap();
    assert!(a_line < b_line);

    let info = h.manager.session_info(&parent).unwrap();
    assert!(info.waiting_for.is_empty());
    assert!(info.is_processing);

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|n| n.session_id == parent && matches!(n.event, EngineEvent::OrchestratorWaiting { .. })));
    assert!(events
        .iter()
        .any(|n| n.session_id == parent && matches!(n.event, EngineEvent::OrchestratorResumed { .. })));

    resumed.finish("all merged");
    h.wait_idle(&parent).await;
}

#[tokio::test]
async fn test_wait_on_finished_children_returns_ready() {
    let mut h = Harness::new();
    let coordinator = h.manager.coordinator();
    let parent = h.create("lead");

    let a = coordinator.spawn_child(&parent, request("A", "go")).await.unwrap();
    h.next_turn().await.finish("went");
    h.wait_until("A is recorded", |m| {
        m.session_info(&a.child_id).unwrap().last_turn_status == Some(ChildStatus::Completed)
    })
    .await;

    match coordinator.wait_for_children(&parent, None).await.unwrap() {
        WaitOutcome::Ready { results } => {
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].child_id, a.child_id);
            assert_eq!(results[0].summary, "went");
        }
        other => panic!("expected ready, got {:?}", other),
    }
    assert!(h.manager.session_info(&parent).unwrap().waiting_for.is_empty());
}

#[tokio::test]
async fn test_spawn_reuses_child_by_name() {
    let mut h = Harness::new();
    let coordinator = h.manager.coordinator();
    let parent = h.create("lead");

    let first = coordinator.spawn_child(&parent, request("docs", "write docs")).await.unwrap();
    let _turn = h.next_turn().await;
    let second = coordinator.spawn_child(&parent, request("docs", "write more docs")).await.unwrap();

    assert!(second.reused);
    assert_eq!(second.child_id, first.child_id);
    h.no_turn_within(Duration::from_millis(50)).await;
    assert_eq!(coordinator.list_children(&parent).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_children_cannot_orchestrate() {
    let mut h = Harness::new();
    let coordinator = h.manager.coordinator();
    let parent = h.create("lead");
    let child = coordinator.spawn_child(&parent, request("A", "go")).await.unwrap();
    let _turn = h.next_turn().await;

    let err = coordinator.wait_for_children(&child.child_id, None).await.unwrap_err();
    assert!(matches!(engine_error(&err), EngineError::NotAnOrchestrator(_)));

    let err = coordinator
        .spawn_child(&child.child_id, request("grandchild", "go"))
        .await
        .unwrap_err();
    assert!(matches!(engine_error(&err), EngineError::InvalidState { .. }));

    let err = coordinator
        .wait_for_children(&parent, Some(vec!["missing".to_string()]))
        .await
        .unwrap_err();
    assert!(matches!(engine_error(&err), EngineError::ChildNotFound { .. }));

    let err = coordinator.get_child_result(&parent, "missing").await.unwrap_err();
    assert!(matches!(engine_error(&err), EngineError::ChildNotFound { .. }));
}

#[tokio::test]
async fn test_auto_approved_plan_is_fast_tracked() {
    let mut h = Harness::new();
    let coordinator = h.manager.coordinator();
    let parent = h.create("lead");

    let child = coordinator
        .spawn_child(
            &parent,
            SpawnChildRequest {
                name: "planner".to_string(),
                instruction: "plan the migration".to_string(),
                permission_mode: Some(PermissionMode::Safe),
                auto_approve: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let turn = h.next_turn().await;
    assert_eq!(
        h.manager.session_info(&child.child_id).unwrap().permission_mode,
        PermissionMode::Safe
    );
    turn.send(TurnEvent::PlanSubmitted {
        content: "1. add column".to_string(),
        plan_path: None,
    });

    let approved = h.next_turn().await;
    assert_eq!(approved.session_id, child.child_id);
    assert_eq!(approved.input, "The plan has been approved. Proceed with the implementation.");

    let info = h.manager.session_info(&child.child_id).unwrap();
    assert_eq!(info.permission_mode, PermissionMode::AllowAll);
    assert_eq!(info.paused, None);
    approved.finish("migrated");
}

#[tokio::test]
async fn test_rejected_plan_sends_feedback() {
    let mut h = Harness::new();
    let coordinator = h.manager.coordinator();
    let parent = h.create("lead");

    let child = coordinator.spawn_child(&parent, request("planner", "plan it")).await.unwrap();
    let turn = h.next_turn().await;

    // Nothing to review yet
    let err = coordinator
        .review_child_plan(&parent, &child.child_id, PlanDecision::Approve { mode: None })
        .await
        .unwrap_err();
    assert!(matches!(engine_error(&err), EngineError::InvalidState { .. }));

    turn.send(TurnEvent::PlanSubmitted {
        content: "rewrite everything".to_string(),
        plan_path: None,
    });
    h.wait_until("plan awaits review", |m| {
        m.session_info(&child.child_id).unwrap().paused == Some(PauseReason::PlanReview)
    })
    .await;

    // A paused child is not finished
    let children = coordinator.list_children(&parent).await.unwrap();
    assert_eq!(children[0].paused, Some(PauseReason::PlanReview));
    assert!(children[0].result.is_none());

    coordinator
        .review_child_plan(
            &parent,
            &child.child_id,
            PlanDecision::Reject {
                feedback: "too broad".to_string(),
            },
        )
        .await
        .unwrap();

    let revised = h.next_turn().await;
    assert!(revised.input.starts_with("The plan was rejected."));
    assert!(revised.input.ends_with("Feedback: too broad"));
    assert_eq!(
        h.manager.session_info(&child.child_id).unwrap().permission_mode,
        PermissionMode::Ask
    );
}

#[tokio::test]
async fn test_watchdog_recovers_completion_after_restart() {
    let mut h = Harness::new();

    let now = chrono::Utc::now().timestamp_millis();
    let mut answer = Message::new(MessageRole::Assistant, "C out", now);
    answer.turn_id = Some("t1".to_string());

    let parent_meta = SessionMeta {
        id: "parent".to_string(),
        workspace_id: "ws".to_string(),
        name: Some("lead".to_string()),
        created_at: now,
        updated_at: now,
        orchestration: Some(OrchestrationState {
            waiting_for: ["child".to_string()].into_iter().collect(),
            wait_targets: vec!["child".to_string()],
            ..Default::default()
        }),
        ..Default::default()
    };
    let child_meta = SessionMeta {
        id: "child".to_string(),
        workspace_id: "ws".to_string(),
        name: Some("C".to_string()),
        created_at: now,
        updated_at: now,
        parent_id: Some("parent".to_string()),
        sibling_order: Some(0),
        model_locked: true,
        last_turn_status: Some(ChildStatus::Completed),
        ..Default::default()
    };

    h.store
        .save(&StoredSession {
            meta: parent_meta,
            messages: Some(Vec::new()),
        })
        .await
        .unwrap();
    h.store
        .save(&StoredSession {
            meta: child_meta,
            messages: Some(vec![Message::user("do C", now), answer]),
        })
        .await
        .unwrap();

    assert_eq!(h.manager.load_persisted().await.unwrap(), 2);
    assert_eq!(h.manager.session_info("parent").unwrap().waiting_for, vec!["child".to_string()]);

    let resumed = h.next_turn().await;
    assert_eq!(resumed.session_id, "parent");
    assert!(resumed.input.contains("**C** (completed): C out"));
    assert!(h.manager.session_info("parent").unwrap().waiting_for.is_empty());

    // Nothing left to recover
    assert!(!h.manager.coordinator().watchdog_tick("parent").await);
}

#[tokio::test]
async fn test_completion_is_recorded_once() {
    let h = Harness::new();
    let coordinator = h.manager.coordinator();
    let parent = h.create("lead");

    let record = CompletionRecord {
        child_id: "c1".to_string(),
        name: "worker".to_string(),
        status: ChildStatus::Completed,
        summary: "done".to_string(),
        usage: TokenUsage::default(),
        completed_at: 1,
    };

    let attempts = (0..8).map(|_| coordinator.record_completion(&parent, record.clone()));
    let recorded = futures::future::join_all(attempts).await;
    let firsts = recorded.into_iter().filter(|r| *r.as_ref().unwrap()).count();
    assert_eq!(firsts, 1);

    let again = coordinator.record_completion(&parent, record).await.unwrap();
    assert!(!again);
    assert!(coordinator.reconcile(&parent).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finish_and_watchdog_record_child_once() {
    let mut h = Harness::new();
    let coordinator = h.manager.coordinator();
    let parent = h.create("lead");

    let child = coordinator.spawn_child(&parent, request("W", "do the work")).await.unwrap();
    let child_turn = h.next_turn().await;
    let outcome = coordinator.wait_for_children(&parent, None).await.unwrap();
    assert_eq!(
        outcome,
        WaitOutcome::Waiting {
            pending: vec![child.child_id.clone()]
        }
    );

    // Watchdog ticks race the child's own finish
    let tickers: Vec<_> = (0..3)
        .map(|_| {
            let coordinator = coordinator.clone();
            let parent = parent.clone();
            tokio::spawn(async move {
                while coordinator.watchdog_tick(&parent).await {
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    child_turn.finish("work done");

    let resumed = h.next_turn().await;
    assert_eq!(resumed.session_id, parent);
    assert!(resumed.input.contains("**W** (completed): work done"));
    for ticker in tickers {
        tokio::time::timeout(common::WAIT, ticker).await.unwrap().unwrap();
    }
    assert!(!coordinator.watchdog_tick(&parent).await);
    h.no_turn_within(Duration::from_millis(80)).await;

    h.manager.flush_all().await;
    let stored = h
        .store
        .list()
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.id == parent)
        .unwrap();
    let results = stored.orchestration.unwrap().completed_results;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].child_id, child.child_id);

    resumed.finish("merged");
    h.wait_idle(&parent).await;
}

#[tokio::test]
async fn test_deleting_waited_child_resumes_parent() {
    let mut h = Harness::new();
    let coordinator = h.manager.coordinator();
    let parent = h.create("lead");

    let child = coordinator.spawn_child(&parent, request("flaky", "try it")).await.unwrap();
    let _child_turn = h.next_turn().await;

    let outcome = coordinator.wait_for_children(&parent, None).await.unwrap();
    assert_eq!(
        outcome,
        WaitOutcome::Waiting {
            pending: vec![child.child_id.clone()]
        }
    );

    h.manager.delete_session(&child.child_id).await.unwrap();

    let resumed = h.next_turn().await;
    assert_eq!(resumed.session_id, parent);
    assert!(resumed.input.contains("**flaky** (cancelled)"));

    let result = coordinator.get_child_result(&parent, &child.child_id).await.unwrap();
    assert_eq!(result.result.unwrap().status, ChildStatus::Cancelled);
    resumed.finish("moving on");
    h.wait_idle(&parent).await;
}

// Message queue, redirect, steering and stop behavior

mod common;

use std::time::Duration;

use common::{FakeOptions, Harness};
use conductor::session::{
    AbortReason, ChildStatus, EngineEvent, MessageRole, Notification, UserMessageStatus,
};

fn stop_transitions(events: &[Notification], id: &str) -> usize {
    events
        .iter()
        .filter(|n| n.session_id == id)
        .filter(|n| matches!(n.event, EngineEvent::Complete { .. } | EngineEvent::Interrupted { .. }))
        .count()
}

#[tokio::test]
async fn test_idle_send_starts_turn() {
    let mut h = Harness::new();
    let id = h.create("solo");

    let outcome = h.manager.send_message(&id, "hello").await.unwrap();
    assert_eq!(outcome.status, UserMessageStatus::Processing);

    let turn = h.next_turn().await;
    assert_eq!(turn.input, "hello");
    assert!(h.manager.session_info(&id).unwrap().is_processing);

    turn.finish("hi there");
    h.wait_idle(&id).await;

    let info = h.manager.session_info(&id).unwrap();
    assert_eq!(info.processing_generation, 1);
    assert_eq!(info.last_turn_status, Some(ChildStatus::Completed));
    assert!(info.model_locked);

    let messages = h.manager.messages(&id).await.unwrap();
    let roles: Vec<MessageRole> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
    assert_eq!(messages[1].content, "hi there");
}

#[tokio::test]
async fn test_redirect_queues_in_submission_order() {
    let mut h = Harness::new();
    let id = h.create("redirect");

    h.manager.send_message(&id, "first").await.unwrap();
    let first = h.next_turn().await;

    let outcome = h.manager.send_message(&id, "second").await.unwrap();
    assert_eq!(outcome.status, UserMessageStatus::Queued);

    // Still queued until the first turn has drained
    let messages = h.manager.messages(&id).await.unwrap();
    let users: Vec<(&str, bool)> = messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .map(|m| (m.content.as_str(), m.is_queued))
        .collect();
    assert_eq!(users, vec![("first", false), ("second", true)]);

    let backend = h.factory.backend_for(&id).unwrap();
    assert_eq!(*backend.aborts.lock(), vec![AbortReason::Redirect]);

    let second = h.next_turn().await;
    assert_eq!(second.input, "second");
    drop(first);

    let messages = h.manager.messages(&id).await.unwrap();
    let second_message = messages.iter().find(|m| m.content == "second").unwrap();
    assert!(!second_message.is_queued);
    assert!(h.manager.session_info(&id).unwrap().was_interrupted);

    second.finish("done");
    h.wait_idle(&id).await;

    let info = h.manager.session_info(&id).unwrap();
    assert_eq!(info.processing_generation, 2);
    assert!(!info.was_interrupted);

    let events = h.drain_events();
    assert_eq!(stop_transitions(&events, &id), 2);
    assert!(events.iter().any(|n| n.event
        == EngineEvent::Interrupted {
            reason: AbortReason::Redirect
        }));
}

#[tokio::test]
async fn test_steering_keeps_turn_running() {
    let mut h = Harness::with_options(FakeOptions {
        steerable: true,
        ..Default::default()
    });
    let id = h.create("steer");

    h.manager.send_message(&id, "build it").await.unwrap();
    let turn = h.next_turn().await;

    let outcome = h.manager.send_message(&id, "use tabs").await.unwrap();
    assert_eq!(outcome.status, UserMessageStatus::Accepted);

    let backend = h.factory.backend_for(&id).unwrap();
    assert_eq!(*backend.steered.lock(), vec!["use tabs".to_string()]);
    assert!(backend.aborts.lock().is_empty());

    let info = h.manager.session_info(&id).unwrap();
    assert!(info.is_processing);
    assert_eq!(info.pending_count, 0);

    turn.finish("built with tabs");
    h.wait_idle(&id).await;
    h.no_turn_within(Duration::from_millis(50)).await;
    assert_eq!(h.manager.session_info(&id).unwrap().processing_generation, 1);
}

#[tokio::test]
async fn test_steer_into_finished_turn_starts_new_turn() {
    let mut h = Harness::with_options(FakeOptions {
        steerable: true,
        steer_ends_turn: true,
        ..Default::default()
    });
    let id = h.create("late-steer");

    h.manager.send_message(&id, "first").await.unwrap();
    let _first = h.next_turn().await;

    // The turn completes while the steer is still in flight
    let outcome = h.manager.send_message(&id, "second").await.unwrap();
    assert_eq!(outcome.status, UserMessageStatus::Processing);

    let second = h.next_turn().await;
    assert_eq!(second.input, "second");
    assert_eq!(h.manager.session_info(&id).unwrap().processing_generation, 2);

    second.finish("done");
    h.wait_idle(&id).await;

    let messages = h.manager.messages(&id).await.unwrap();
    let users: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(users, vec!["first", "second"]);
    assert!(messages.iter().all(|m| !m.is_queued));
}

#[tokio::test]
async fn test_stop_discards_queued_messages() {
    let mut h = Harness::new();
    let id = h.create("stop");

    h.manager.send_message(&id, "first").await.unwrap();
    let _turn = h.next_turn().await;
    h.manager.send_message(&id, "queued one").await.unwrap();
    h.manager.send_message(&id, "queued two").await.unwrap();

    h.manager.cancel(&id).await.unwrap();
    h.wait_idle(&id).await;
    h.no_turn_within(Duration::from_millis(80)).await;

    let info = h.manager.session_info(&id).unwrap();
    assert_eq!(info.pending_count, 0);
    assert_eq!(info.last_turn_status, Some(ChildStatus::Cancelled));

    let contents: Vec<String> = h
        .manager
        .messages(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["first".to_string()]);

    h.manager.flush_all().await;
    let stored = h.store.stored_messages(&id).unwrap();
    assert!(stored.iter().all(|m| !m.content.starts_with("queued")));

    let events = h.drain_events();
    assert_eq!(stop_transitions(&events, &id), 1);
    assert!(events.iter().any(|n| n.event
        == EngineEvent::Interrupted {
            reason: AbortReason::UserStop
        }));
}

#[tokio::test]
async fn test_stop_timeout_forces_completion() {
    let mut h = Harness::with_options(FakeOptions {
        ignore_abort: true,
        ..Default::default()
    });
    let id = h.create("stuck");

    h.manager.send_message(&id, "loop forever").await.unwrap();
    let stuck = h.next_turn().await;

    h.manager.cancel(&id).await.unwrap();
    assert!(h.manager.session_info(&id).unwrap().stop_requested);
    h.wait_idle(&id).await;

    // Output of the abandoned turn is dropped
    stuck.finish("too late");
    tokio::time::sleep(Duration::from_millis(30)).await;
    let messages = h.manager.messages(&id).await.unwrap();
    assert!(messages.iter().all(|m| m.content != "too late"));

    // The stuck backend was discarded; the next turn gets a fresh one
    h.manager.send_message(&id, "again").await.unwrap();
    let next = h.next_turn().await;
    assert_eq!(next.input, "again");
    assert_eq!(h.factory.created(), 2);
    next.finish("ok");
    h.wait_idle(&id).await;
    assert_eq!(h.manager.session_info(&id).unwrap().processing_generation, 2);
}

#[tokio::test]
async fn test_idle_send_after_stop_keeps_order() {
    let mut h = Harness::new();
    let id = h.create("order");

    h.manager.send_message(&id, "one").await.unwrap();
    let one = h.next_turn().await;
    one.finish("1");
    h.wait_idle(&id).await;

    h.manager.send_message(&id, "two").await.unwrap();
    let two = h.next_turn().await;
    assert_eq!(two.input, "two");
    two.finish("2");
    h.wait_idle(&id).await;

    let contents: Vec<String> = h
        .manager
        .messages(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["one", "1", "two", "2"]);
}

#[tokio::test]
async fn test_unread_and_viewing() {
    let mut h = Harness::new();
    let watched = h.create("watched");
    let background = h.create("background");
    h.manager.set_viewing(Some(watched.as_str())).unwrap();

    h.manager.send_message(&watched, "a").await.unwrap();
    h.next_turn().await.finish("A");
    h.wait_idle(&watched).await;

    h.manager.send_message(&background, "b").await.unwrap();
    h.next_turn().await.finish("B");
    h.wait_idle(&background).await;

    assert!(!h.manager.session_info(&watched).unwrap().has_unread);
    assert!(h.manager.session_info(&background).unwrap().has_unread);

    h.manager.mark_read(&background).unwrap();
    assert!(!h.manager.session_info(&background).unwrap().has_unread);
}

#[tokio::test]
async fn test_model_locked_after_first_turn() {
    let mut h = Harness::new();
    let id = h.create("model");

    h.manager
        .set_model(&id, Some("opus".to_string()), None)
        .unwrap();
    h.manager.send_message(&id, "go").await.unwrap();
    h.next_turn().await.finish("ok");
    h.wait_idle(&id).await;

    let err = h
        .manager
        .set_model(&id, Some("haiku".to_string()), None)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<conductor::core::EngineError>(),
        Some(conductor::core::EngineError::ModelLocked(_))
    ));
    assert_eq!(h.manager.session_info(&id).unwrap().model.as_deref(), Some("opus"));
}

#[tokio::test]
async fn test_delete_cleans_up() {
    let mut h = Harness::new();
    let id = h.create("doomed");

    h.manager.send_message(&id, "work").await.unwrap();
    let _turn = h.next_turn().await;

    h.manager.delete_session(&id).await.unwrap();

    assert!(h.manager.session_info(&id).is_err());
    assert!(h.manager.list_sessions(None).is_empty());
    h.manager.flush_all().await;
    assert!(h.store.stored_meta(&id).is_none());

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|n| n.session_id == id && n.event == EngineEvent::SessionDeleted));

    let err = h.manager.send_message(&id, "hello?").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<conductor::core::EngineError>(),
        Some(conductor::core::EngineError::SessionNotFound(_))
    ));
}

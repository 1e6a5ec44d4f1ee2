//! Coalesces streaming text fragments into periodic notifications

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::notify::{EngineEvent, EventBus};

#[derive(Debug)]
struct DeltaChunk {
    turn_id: Option<String>,
    text: String,
}

#[derive(Default)]
struct DeltaBuffer {
    workspace_id: String,
    chunks: Vec<DeltaChunk>,
    timer: Option<JoinHandle<()>>,
}

type Buffers = Arc<Mutex<HashMap<String, DeltaBuffer>>>;

/// Per-session text delta buffers with a single scheduled flush each
pub struct DeltaBatcher {
    interval: Duration,
    buffers: Buffers,
    bus: EventBus,
}

impl DeltaBatcher {
    pub fn new(interval: Duration, bus: EventBus) -> Self {
        Self {
            interval,
            buffers: Arc::new(Mutex::new(HashMap::new())),
            bus,
        }
    }

    /// Buffer a fragment, scheduling a flush if none is pending
    pub fn push(&self, workspace_id: &str, session_id: &str, turn_id: Option<String>, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(session_id.to_string()).or_default();
        buffer.workspace_id = workspace_id.to_string();

        match buffer.chunks.last_mut() {
            Some(last) if last.turn_id == turn_id => last.text.push_str(text),
            _ => buffer.chunks.push(DeltaChunk {
                turn_id,
                text: text.to_string(),
            }),
        }

        if buffer.timer.is_none() {
            let buffers = self.buffers.clone();
            let bus = self.bus.clone();
            let interval = self.interval;
            let session_id = session_id.to_string();
            buffer.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                let mut buffers = buffers.lock();
                if let Some(b) = buffers.get_mut(&session_id) {
                    b.timer = None;
                    let chunks = std::mem::take(&mut b.chunks);
                    emit(&bus, &b.workspace_id, &session_id, chunks);
                }
            }));
        }
    }

    /// Emit anything buffered right now (before a final message goes out).
    ///
    /// Publishing happens under the buffers lock, same as the timer, so once
    /// this returns no earlier fragment can still be on its way out.
    pub fn flush(&self, session_id: &str) {
        let mut buffers = self.buffers.lock();
        if let Some(b) = buffers.get_mut(session_id) {
            if let Some(timer) = b.timer.take() {
                timer.abort();
            }
            let chunks = std::mem::take(&mut b.chunks);
            emit(&self.bus, &b.workspace_id, session_id, chunks);
        }
    }

    /// Drop a session's buffer and timer without emitting
    pub fn clear(&self, session_id: &str) {
        if let Some(buffer) = self.buffers.lock().remove(session_id) {
            if let Some(timer) = buffer.timer {
                timer.abort();
            }
        }
    }

    pub fn has_buffer(&self, session_id: &str) -> bool {
        self.buffers.lock().contains_key(session_id)
    }
}

fn emit(bus: &EventBus, workspace_id: &str, session_id: &str, chunks: Vec<DeltaChunk>) {
    for chunk in chunks {
        bus.publish(
            workspace_id,
            session_id,
            EngineEvent::TextDelta {
                delta: chunk.text,
                turn_id: chunk.turn_id,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::notify::Notification;
    use tokio::sync::broadcast;

    fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<(String, Option<String>)> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            if let EngineEvent::TextDelta { delta, turn_id } = n.event {
                out.push((delta, turn_id));
            }
        }
        out
    }

    #[tokio::test]
    async fn fragments_within_window_coalesce() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let batcher = DeltaBatcher::new(Duration::from_millis(30), bus);

        batcher.push("ws", "s1", None, "Hel");
        batcher.push("ws", "s1", None, "lo ");
        batcher.push("ws", "s1", None, "world");
        assert!(drain(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(drain(&mut rx), vec![("Hello world".to_string(), None)]);
    }

    #[tokio::test]
    async fn forced_flush_emits_immediately_and_cancels_timer() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let batcher = DeltaBatcher::new(Duration::from_millis(30), bus);

        batcher.push("ws", "s1", None, "partial");
        batcher.flush("s1");
        assert_eq!(drain(&mut rx), vec![("partial".to_string(), None)]);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn different_turns_keep_their_own_correlation_id() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let batcher = DeltaBatcher::new(Duration::from_secs(5), bus);

        batcher.push("ws", "s1", Some("t1".into()), "one ");
        batcher.push("ws", "s1", Some("t2".into()), "two");
        batcher.flush("s1");

        assert_eq!(
            drain(&mut rx),
            vec![
                ("one ".to_string(), Some("t1".to_string())),
                ("two".to_string(), Some("t2".to_string())),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timer_flush_never_lands_after_forced_flush() {
        let bus = EventBus::new(4096);
        let mut rx = bus.subscribe();
        let batcher = DeltaBatcher::new(Duration::from_millis(1), bus.clone());

        for round in 0..200 {
            batcher.push("ws", "s1", None, "x");
            // Land the forced flush as close to the timer as possible.
            tokio::time::sleep(Duration::from_millis(1)).await;
            batcher.flush("s1");
            bus.publish(
                "ws",
                "s1",
                EngineEvent::Status {
                    message: format!("final {}", round),
                },
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Every fragment pushed before a final marker is out before it.
        let mut delivered = 0;
        let mut markers = 0;
        while let Ok(n) = rx.try_recv() {
            match n.event {
                EngineEvent::TextDelta { delta, .. } => delivered += delta.len(),
                EngineEvent::Status { .. } => {
                    markers += 1;
                    assert_eq!(delivered, markers, "fragment delivered after final marker {}", markers);
                }
                _ => {}
            }
        }
        assert_eq!(markers, 200);
    }

    #[tokio::test]
    async fn clear_discards_buffer() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let batcher = DeltaBatcher::new(Duration::from_millis(20), bus);

        batcher.push("ws", "s1", None, "gone");
        batcher.clear("s1");
        assert!(!batcher.has_buffer("s1"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(drain(&mut rx).is_empty());
    }
}

//! Streaming coordinator — ordered fan-out of workflow events.
//!
//! Emission order equals bus order per session (single writer: the
//! executor). The coordinator assigns sequence numbers, appends to the
//! session's replay history, and fans out to any connected subscribers.
//! Replay on reconnect starts from the first sequence number no
//! connection has been given yet.
//!
//! Backpressure: a subscriber whose buffer stays full sheds TTS chunks
//! first, then progress events; chat messages and terminals are never
//! shed — a connection too stalled to take them is dropped and recovers
//! the events through replay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};

use td_domain::config::SessionConfig;
use td_domain::event::{Event, EventPayload, ShedClass, StageId};

use crate::sessions::SessionStore;

struct Subscriber {
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct Fanout {
    subscribers: Vec<Subscriber>,
}

pub struct StreamingCoordinator {
    sessions: Arc<SessionStore>,
    /// Per-session fan-out state; the async mutex serializes emit and
    /// subscribe so replay never interleaves with live events.
    fanouts: RwLock<HashMap<String, Arc<Mutex<Fanout>>>>,
    config: SessionConfig,
}

impl StreamingCoordinator {
    pub fn new(sessions: Arc<SessionStore>, config: SessionConfig) -> Self {
        Self {
            sessions,
            fanouts: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Emit one event on behalf of a session: assign its sequence number,
    /// append it to the replay history, and fan it out.
    pub async fn emit(&self, session_id: &str, stage: StageId, payload: EventPayload) {
        let Some(handle) = self.sessions.get(session_id) else {
            tracing::warn!(session_id = %session_id, "emit for unknown session dropped");
            return;
        };

        let event = {
            let mut data = handle.data.lock();
            let seq = data.next_seq();
            let event = Event::new(session_id, seq, stage, payload);
            data.events.push(event.clone());
            data.touch();
            event
        };

        let fanout = self.fanout(session_id);
        let mut fanout = fanout.lock().await;

        let mut delivered_any = false;
        let mut keep = Vec::with_capacity(fanout.subscribers.len());
        for subscriber in fanout.subscribers.drain(..) {
            match self.deliver(&subscriber, &event).await {
                Delivery::Sent => {
                    delivered_any = true;
                    keep.push(subscriber);
                }
                Delivery::Shed => keep.push(subscriber),
                Delivery::Dead => {}
            }
        }
        fanout.subscribers = keep;

        if delivered_any {
            let mut data = handle.data.lock();
            data.delivered_seq = data.delivered_seq.max(event.seq);
        }
    }

    /// Attach a new connection. Events past the replay cursor are queued
    /// first, so the connection sees history and live events in one
    /// ordered stream.
    pub async fn subscribe(&self, session_id: &str) -> mpsc::Receiver<Event> {
        let fanout = self.fanout(session_id);
        let mut fanout = fanout.lock().await;

        let replay: Vec<Event> = match self.sessions.get(session_id) {
            Some(handle) => {
                let data = handle.data.lock();
                data.events
                    .iter()
                    .filter(|e| e.seq > data.delivered_seq)
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        };

        // Capacity covers the whole replay so these sends cannot fail.
        let (tx, rx) = mpsc::channel(replay.len() + self.config.subscriber_buffer);
        let mut max_seq = 0;
        for event in replay {
            max_seq = max_seq.max(event.seq);
            let _ = tx.try_send(event);
        }
        if max_seq > 0 {
            if let Some(handle) = self.sessions.get(session_id) {
                let mut data = handle.data.lock();
                data.delivered_seq = data.delivered_seq.max(max_seq);
            }
        }

        fanout.subscribers.push(Subscriber { tx });
        rx
    }

    /// Number of live subscribers (test and health introspection).
    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        let fanout = self.fanout(session_id);
        let fanout = fanout.lock().await;
        fanout.subscribers.len()
    }

    fn fanout(&self, session_id: &str) -> Arc<Mutex<Fanout>> {
        if let Some(f) = self.fanouts.read().get(session_id) {
            return Arc::clone(f);
        }
        let mut fanouts = self.fanouts.write();
        Arc::clone(fanouts.entry(session_id.to_string()).or_default())
    }

    async fn deliver(&self, subscriber: &Subscriber, event: &Event) -> Delivery {
        let stall = Duration::from_millis(self.config.send_stall_ms);
        match event.payload.shed_class() {
            ShedClass::Speech => match subscriber.tx.try_send(event.clone()) {
                Ok(()) => Delivery::Sent,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(seq = event.seq, "tts chunk shed under backpressure");
                    Delivery::Shed
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Dead,
            },
            ShedClass::Progress => match subscriber.tx.try_send(event.clone()) {
                Ok(()) => Delivery::Sent,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    match tokio::time::timeout(stall, subscriber.tx.send(event.clone())).await {
                        Ok(Ok(())) => Delivery::Sent,
                        Ok(Err(_)) => Delivery::Dead,
                        Err(_) => {
                            tracing::debug!(seq = event.seq, "progress event shed under backpressure");
                            Delivery::Shed
                        }
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Dead,
            },
            // Chat and terminals are never shed. A connection that cannot
            // take one within the stall window is dropped; replay covers
            // it on reconnect.
            ShedClass::Essential => {
                match tokio::time::timeout(stall, subscriber.tx.send(event.clone())).await {
                    Ok(Ok(())) => Delivery::Sent,
                    Ok(Err(_)) => Delivery::Dead,
                    Err(_) => {
                        tracing::warn!(
                            seq = event.seq,
                            "subscriber stalled on essential event, dropping connection"
                        );
                        Delivery::Dead
                    }
                }
            }
        }
    }
}

enum Delivery {
    Sent,
    Shed,
    Dead,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use td_domain::event::TerminalOutcome;

    fn setup(buffer: usize, stall_ms: u64) -> (Arc<SessionStore>, StreamingCoordinator) {
        let mut config = SessionConfig::default();
        config.subscriber_buffer = buffer;
        config.send_stall_ms = stall_ms;
        let sessions = Arc::new(SessionStore::new(config.clone()));
        let coordinator = StreamingCoordinator::new(Arc::clone(&sessions), config);
        (sessions, coordinator)
    }

    fn chat(text: &str) -> EventPayload {
        EventPayload::Chat { text: text.into() }
    }

    fn progress(message: &str) -> EventPayload {
        EventPayload::Progress {
            item_id: None,
            status: None,
            message: message.into(),
            todo: None,
        }
    }

    #[tokio::test]
    async fn events_are_sequenced_and_ordered() {
        let (sessions, coordinator) = setup(16, 100);
        sessions.resolve_or_create(Some("s1"));
        let mut rx = coordinator.subscribe("s1").await;

        for i in 0..3 {
            coordinator
                .emit("s1", StageId::Plan, progress(&format!("step {i}")))
                .await;
        }

        let seqs: Vec<u64> = vec![
            rx.recv().await.unwrap().seq,
            rx.recv().await.unwrap().seq,
            rx.recv().await.unwrap().seq,
        ];
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn late_subscriber_replays_undelivered_history() {
        let (sessions, coordinator) = setup(16, 100);
        sessions.resolve_or_create(Some("s1"));

        coordinator.emit("s1", StageId::Mode, chat("hello")).await;
        coordinator.emit("s1", StageId::Plan, progress("planning")).await;

        let mut rx = coordinator.subscribe("s1").await;
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 2);

        // A second connection does not see already-delivered events.
        let mut rx2 = coordinator.subscribe("s1").await;
        coordinator.emit("s1", StageId::Plan, progress("more")).await;
        assert_eq!(rx2.recv().await.unwrap().seq, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn tts_is_shed_first_under_backpressure() {
        let (sessions, coordinator) = setup(1, 50);
        sessions.resolve_or_create(Some("s1"));
        let mut rx = coordinator.subscribe("s1").await;

        // Fill the single-slot buffer.
        coordinator.emit("s1", StageId::Execute, progress("fills buffer")).await;
        // TTS cannot fit: shed immediately, subscriber stays.
        coordinator
            .emit("s1", StageId::Execute, EventPayload::TtsChunk { text: "speech".into() })
            .await;
        assert_eq!(coordinator.subscriber_count("s1").await, 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        // The shed TTS chunk is not delivered to this connection.
        coordinator.emit("s1", StageId::Execute, progress("after")).await;
        let next = rx.recv().await.unwrap();
        assert_eq!(next.seq, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_subscriber_is_dropped_on_essential_events() {
        let (sessions, coordinator) = setup(1, 50);
        sessions.resolve_or_create(Some("s1"));
        let _rx = coordinator.subscribe("s1").await;

        coordinator.emit("s1", StageId::Summary, progress("fills buffer")).await;
        // The terminal cannot be shed; the stalled connection is dropped.
        coordinator
            .emit(
                "s1",
                StageId::Summary,
                EventPayload::Terminal {
                    outcome: TerminalOutcome::Completed,
                    message: None,
                    error_kind: None,
                },
            )
            .await;
        assert_eq!(coordinator.subscriber_count("s1").await, 0);

        // History retains the terminal for replay.
        let handle = sessions.get("s1").unwrap();
        let events = handle.data.lock().events.clone();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1].payload, EventPayload::Terminal { .. }));
    }

    #[tokio::test]
    async fn emit_for_unknown_session_is_a_noop() {
        let (_sessions, coordinator) = setup(4, 100);
        coordinator.emit("ghost", StageId::Mode, chat("hi")).await;
        assert_eq!(coordinator.subscriber_count("ghost").await, 0);
    }
}

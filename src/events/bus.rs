use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Event, EventType};

/// How long a publisher will wait on a full subscriber queue for a terminal
/// event before dropping that subscriber. Publishers never block longer.
const TERMINAL_SEND_WINDOW: Duration = Duration::from_millis(250);

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// What a subscriber wants to see. Empty filter means everything.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub project: Option<String>,
    pub event_types: Option<Vec<EventType>>,
}

impl SubscriptionFilter {
    pub fn for_project(project: impl Into<String>) -> Self {
        Self { project: Some(project.into()), event_types: None }
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(ref project) = self.project {
            if event.project() != Some(project.as_str()) {
                return false;
            }
        }
        if let Some(ref types) = self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    id: u64,
    filter: SubscriptionFilter,
    tx: mpsc::Sender<Event>,
}

/// In-process pub/sub with per-subscriber bounded queues.
///
/// Delivery semantics:
/// - terminal events (`phase_change`, `score_update`, `project_complete`,
///   `project_failed`) are delivered in publish order per project; a
///   subscriber that stays full past a bounded window is disconnected
///   rather than blocking the producer;
/// - `conversation_chunk` is lossy: a full queue drops the chunk, and the
///   final `conversation_update` carries the complete text anyway;
/// - everything else is dropped on overflow with a debug log.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    /// Register a subscriber; the returned receiver yields matching events
    /// until the subscriber falls too far behind or drops the receiver.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(Subscriber { id, filter, tx });
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber lock poisoned").len()
    }

    /// Publish a typed payload under `event_type` to every matching
    /// subscriber. Never blocks past the bounded terminal-send window.
    pub async fn publish<T: Serialize>(&self, event_type: EventType, data: T) {
        self.publish_event(Event::new(event_type, data)).await;
    }

    pub async fn publish_event(&self, event: Event) {
        // Snapshot matching senders so the lock is not held across awaits.
        let targets: Vec<(u64, mpsc::Sender<Event>)> = {
            let mut subs = self.subscribers.lock().expect("subscriber lock poisoned");
            subs.retain(|s| !s.tx.is_closed());
            subs.iter()
                .filter(|s| s.filter.matches(&event))
                .map(|s| (s.id, s.tx.clone()))
                .collect()
        };

        let mut to_drop = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => to_drop.push(id),
                Err(mpsc::error::TrySendError::Full(ev)) => {
                    if ev.event_type.is_lossy() {
                        debug!(subscriber = id, "Dropping chunk for slow subscriber");
                    } else if ev.event_type.is_terminal() {
                        // Block briefly for ordering-critical events, then
                        // cut the slow subscriber loose.
                        match tokio::time::timeout(TERMINAL_SEND_WINDOW, tx.send(ev)).await {
                            Ok(Ok(())) => {}
                            _ => {
                                warn!(
                                    subscriber = id,
                                    event = event.event_type.as_str(),
                                    "Subscriber queue stayed full, disconnecting"
                                );
                                to_drop.push(id);
                            }
                        }
                    } else {
                        debug!(
                            subscriber = id,
                            event = event.event_type.as_str(),
                            "Dropping event for slow subscriber"
                        );
                    }
                }
            }
        }

        if !to_drop.is_empty() {
            let mut subs = self.subscribers.lock().expect("subscriber lock poisoned");
            subs.retain(|s| !to_drop.contains(&s.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ConversationChunkData, LogData, PhaseChangeData};

    fn phase_event(project: &str, phase: &str) -> Event {
        Event::new(
            EventType::PhaseChange,
            PhaseChangeData { project: project.into(), phase: phase.into(), iteration: None },
        )
    }

    #[tokio::test]
    async fn test_fan_out_to_matching_subscribers() {
        let bus = EventBus::default();
        let mut all = bus.subscribe(SubscriptionFilter::default());
        let mut only_a = bus.subscribe(SubscriptionFilter::for_project("a"));

        bus.publish_event(phase_event("a", "planning")).await;
        bus.publish_event(phase_event("b", "planning")).await;

        assert_eq!(all.recv().await.unwrap().project(), Some("a"));
        assert_eq!(all.recv().await.unwrap().project(), Some("b"));
        assert_eq!(only_a.recv().await.unwrap().project(), Some("a"));
        assert!(only_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_type_filter() {
        let bus = EventBus::default();
        let mut scores = bus.subscribe(SubscriptionFilter {
            project: None,
            event_types: Some(vec![EventType::Log]),
        });
        bus.publish_event(phase_event("a", "planning")).await;
        bus.publish(
            EventType::Log,
            LogData { project: "a".into(), message: "hi".into(), level: "info".into() },
        )
        .await;
        assert_eq!(scores.recv().await.unwrap().event_type, EventType::Log);
        assert!(scores.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_terminal_events_in_publish_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe(SubscriptionFilter::for_project("a"));
        for phase in ["planning", "engineering", "verifying", "completed"] {
            bus.publish_event(phase_event("a", phase)).await;
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap().data["phase"].as_str().unwrap().to_string());
        }
        assert_eq!(seen, ["planning", "engineering", "verifying", "completed"]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_chunks_not_updates() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe(SubscriptionFilter::default());

        for i in 0..10 {
            bus.publish(
                EventType::ConversationChunk,
                ConversationChunkData {
                    project: "a".into(),
                    agent: "engineer".into(),
                    chunk: format!("c{i}"),
                },
            )
            .await;
        }
        // Queue holds only 2; the rest were dropped without disconnecting us.
        assert_eq!(bus.subscriber_count(), 1);
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[tokio::test]
    async fn test_stuck_subscriber_dropped_on_terminal_event() {
        let bus = EventBus::new(1);
        let rx = bus.subscribe(SubscriptionFilter::default());
        // Never drained: first event fills the queue, second forces the
        // bounded wait and then the disconnect.
        bus.publish_event(phase_event("a", "planning")).await;
        bus.publish_event(phase_event("a", "engineering")).await;
        assert_eq!(bus.subscriber_count(), 0);
        drop(rx);
    }

    #[tokio::test]
    async fn test_closed_receivers_pruned() {
        let bus = EventBus::default();
        let rx = bus.subscribe(SubscriptionFilter::default());
        drop(rx);
        bus.publish_event(phase_event("a", "planning")).await;
        assert_eq!(bus.subscriber_count(), 0);
    }
}

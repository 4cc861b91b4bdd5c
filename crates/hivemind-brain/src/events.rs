// ABOUTME: Event bus fanning hub occurrences out to independently filtered subscribers.
// ABOUTME: Per-subscriber bounded buffers with coalesced wake-ups feed long-poll retrieval.

use crate::error::BrainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

/// Per-subscriber buffer cap used when none is configured.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Data key compared against [`EventFilter::parent_title`].
pub const TOPIC_KEY: &str = "parent_title";

/// Kind of occurrence. Unknown names pushed by a supervising process are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    StatusChanged,
    MessageReceived,
    AgentRemoved,
    WorkflowDefined,
    TaskCompleted,
    TaskTriggered,
    InstanceStatusChanged,
    InstanceCreated,
    InstanceKilled,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::StatusChanged => "status_changed",
            EventType::MessageReceived => "message_received",
            EventType::AgentRemoved => "agent_removed",
            EventType::WorkflowDefined => "workflow_defined",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskTriggered => "task_triggered",
            EventType::InstanceStatusChanged => "instance_status_changed",
            EventType::InstanceCreated => "instance_created",
            EventType::InstanceKilled => "instance_killed",
            EventType::Other(name) => name,
        }
    }

    pub fn from_wire(name: &str) -> Self {
        match name {
            "status_changed" => EventType::StatusChanged,
            "message_received" => EventType::MessageReceived,
            "agent_removed" => EventType::AgentRemoved,
            "workflow_defined" => EventType::WorkflowDefined,
            "task_completed" => EventType::TaskCompleted,
            "task_triggered" => EventType::TaskTriggered,
            "instance_status_changed" => EventType::InstanceStatusChanged,
            "instance_created" => EventType::InstanceCreated,
            "instance_killed" => EventType::InstanceKilled,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(EventType::from_wire(&name))
    }
}

/// A single immutable occurrence. `sequence` is assigned by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub repo_path: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub sequence: u64,
}

impl Event {
    /// New event with no timestamp; [`EventBus::emit`] stamps it.
    pub fn new(event_type: EventType, repo_path: &str, source: &str) -> Self {
        Self {
            event_type,
            timestamp: DateTime::<Utc>::default(),
            repo_path: repo_path.to_string(),
            source: source.to_string(),
            data: Map::new(),
            sequence: 0,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

/// Which events a subscriber receives. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<EventType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_title: String,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if !self.types.is_empty() && !self.types.contains(&event.event_type) {
            return false;
        }
        if !self.instances.is_empty() && !self.instances.contains(&event.source) {
            return false;
        }
        if !self.parent_title.is_empty() {
            let topic = event.data.get(TOPIC_KEY).and_then(Value::as_str);
            if topic != Some(self.parent_title.as_str()) {
                return false;
            }
        }
        true
    }
}

struct Inbox {
    events: VecDeque<Event>,
    last_poll: Instant,
}

impl Inbox {
    fn drain(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }
}

/// One consumer. The inbox lock is separate from the bus's table lock so an
/// emit only contends with polls of the subscribers it delivers to.
struct Subscriber {
    filter: EventFilter,
    inbox: Mutex<Inbox>,
    /// Holds at most one permit: repeated emits before a poll coalesce.
    ready: Notify,
}

/// Fan-out of events to filtered, buffered subscribers.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Arc<Subscriber>>>,
    sequence: AtomicU64,
    max_buffer: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl EventBus {
    /// `max_buffer` caps each subscriber's queue; zero selects the default.
    pub fn new(max_buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            max_buffer: if max_buffer == 0 {
                DEFAULT_BUFFER_CAPACITY
            } else {
                max_buffer
            },
        }
    }

    /// Register a subscriber and return its id.
    pub async fn subscribe(&self, filter: EventFilter) -> String {
        let id = format!("sub_{}", hex::encode(rand::random::<[u8; 8]>()));
        let subscriber = Arc::new(Subscriber {
            filter,
            inbox: Mutex::new(Inbox {
                events: VecDeque::new(),
                last_poll: Instant::now(),
            }),
            ready: Notify::new(),
        });

        self.subscribers
            .write()
            .await
            .insert(id.clone(), subscriber);
        debug!(subscriber_id = %id, "Subscriber registered");
        id
    }

    /// Stamp `event` with the next sequence number and deliver it to every
    /// matching subscriber. Returns the assigned sequence.
    pub async fn emit(&self, mut event: Event) -> u64 {
        if event.timestamp == DateTime::<Utc>::default() {
            event.timestamp = Utc::now();
        }

        // Emits are serialized on the table lock so every buffer sees
        // sequence numbers in increasing order.
        let subscribers = self.subscribers.write().await;
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        for subscriber in subscribers.values() {
            if !subscriber.filter.matches(&event) {
                continue;
            }

            {
                let mut inbox = subscriber.inbox.lock().await;
                inbox.events.push_back(event.clone());
                while inbox.events.len() > self.max_buffer {
                    inbox.events.pop_front();
                }
            }
            subscriber.ready.notify_one();
        }

        event.sequence
    }

    /// Drain the subscriber's buffer, waiting up to `timeout` for events if it is empty.
    pub async fn poll(&self, subscriber_id: &str, timeout: Duration) -> Result<Vec<Event>, BrainError> {
        let subscriber = self
            .subscribers
            .read()
            .await
            .get(subscriber_id)
            .cloned()
            .ok_or(BrainError::SubscriberNotFound)?;

        let deadline = tokio::time::Instant::now() + timeout;
        {
            let mut inbox = subscriber.inbox.lock().await;
            inbox.last_poll = Instant::now();
            if !inbox.events.is_empty() {
                return Ok(inbox.drain());
            }
        }

        loop {
            let woke = tokio::time::timeout_at(deadline, subscriber.ready.notified())
                .await
                .is_ok();

            let mut inbox = subscriber.inbox.lock().await;
            // A stale permit from events an earlier poll already drained wakes
            // us with nothing to hand back; keep waiting out the deadline.
            if !woke || !inbox.events.is_empty() {
                return Ok(inbox.drain());
            }
        }
    }

    /// Remove a subscriber. Returns whether it existed.
    pub async fn unsubscribe(&self, subscriber_id: &str) -> bool {
        let removed = self.subscribers.write().await.remove(subscriber_id).is_some();
        if removed {
            debug!(subscriber_id = %subscriber_id, "Subscriber removed");
        }
        removed
    }

    /// Drop subscribers that have not polled within `max_age`. Returns how many were removed.
    pub async fn prune_stale(&self, max_age: Duration) -> usize {
        let mut stale = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, subscriber) in subscribers.iter() {
                if subscriber.inbox.lock().await.last_poll.elapsed() > max_age {
                    stale.push(id.clone());
                }
            }
        }

        if stale.is_empty() {
            return 0;
        }

        let mut subscribers = self.subscribers.write().await;
        for id in &stale {
            subscribers.remove(id);
        }
        debug!(count = stale.len(), "Pruned stale subscribers");
        stale.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Sequence number of the most recently emitted event.
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_types(types: &[EventType]) -> EventFilter {
        EventFilter {
            types: types.to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_emit_and_poll() {
        let bus = EventBus::default();
        let id = bus.subscribe(EventFilter::default()).await;

        bus.emit(Event::new(EventType::StatusChanged, "/repo", "agent-1").with("feature", "auth"))
            .await;

        let events = bus.poll(&id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::StatusChanged);
        assert_eq!(events[0].source, "agent-1");
        assert_eq!(events[0].sequence, 1);
        assert_ne!(events[0].timestamp, DateTime::<Utc>::default());
    }

    #[tokio::test]
    async fn test_filter_by_type_keeps_order() {
        let bus = EventBus::default();
        let id = bus.subscribe(filter_types(&[EventType::TaskCompleted])).await;

        bus.emit(Event::new(EventType::StatusChanged, "/repo", "a")).await;
        bus.emit(Event::new(EventType::TaskCompleted, "/repo", "t1")).await;
        bus.emit(Event::new(EventType::MessageReceived, "/repo", "a")).await;
        bus.emit(Event::new(EventType::TaskCompleted, "/repo", "t2")).await;
        bus.emit(Event::new(EventType::TaskCompleted, "/repo", "t3")).await;

        let events = bus.poll(&id, Duration::from_secs(1)).await.unwrap();
        let sources: Vec<&str> = events.iter().map(|e| e.source.as_str()).collect();
        assert_eq!(sources, vec!["t1", "t2", "t3"]);
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn test_filter_by_instance() {
        let bus = EventBus::default();
        let id = bus
            .subscribe(EventFilter {
                instances: vec!["agent-2".into()],
                ..Default::default()
            })
            .await;

        bus.emit(Event::new(EventType::StatusChanged, "/repo", "agent-1")).await;
        bus.emit(Event::new(EventType::StatusChanged, "/repo", "agent-2")).await;

        let events = bus.poll(&id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "agent-2");
    }

    #[tokio::test]
    async fn test_filter_by_parent_topic() {
        let bus = EventBus::default();
        let id = bus
            .subscribe(EventFilter {
                parent_title: "lead".into(),
                ..Default::default()
            })
            .await;

        bus.emit(Event::new(EventType::InstanceCreated, "/repo", "w1").with(TOPIC_KEY, "lead"))
            .await;
        bus.emit(Event::new(EventType::InstanceCreated, "/repo", "w2").with(TOPIC_KEY, "other"))
            .await;
        bus.emit(Event::new(EventType::InstanceCreated, "/repo", "w3")).await;

        let events = bus.poll(&id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "w1");
    }

    #[tokio::test]
    async fn test_poll_times_out_empty() {
        let bus = EventBus::default();
        let id = bus.subscribe(EventFilter::default()).await;

        let start = Instant::now();
        let events = bus.poll(&id, Duration::from_millis(100)).await.unwrap();
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_poll_returns_buffered_immediately() {
        let bus = EventBus::default();
        let id = bus.subscribe(EventFilter::default()).await;
        bus.emit(Event::new(EventType::AgentRemoved, "/repo", "a")).await;

        let start = Instant::now();
        let events = bus.poll(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_poll_wakes_on_emit() {
        let bus = Arc::new(EventBus::default());
        let id = bus.subscribe(EventFilter::default()).await;

        let emitter = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            emitter
                .emit(Event::new(EventType::TaskTriggered, "/repo", "t1"))
                .await;
        });

        let start = Instant::now();
        let events = bus.poll(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_stale_wakeup_does_not_end_poll_early() {
        let bus = EventBus::default();
        let id = bus.subscribe(EventFilter::default()).await;

        // Two emits leave a pending permit after the buffer is drained.
        bus.emit(Event::new(EventType::StatusChanged, "/repo", "a")).await;
        bus.emit(Event::new(EventType::StatusChanged, "/repo", "a")).await;
        assert_eq!(bus.poll(&id, Duration::from_secs(1)).await.unwrap().len(), 2);

        let start = Instant::now();
        let events = bus.poll(&id, Duration::from_millis(100)).await.unwrap();
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_buffer_cap_drops_oldest() {
        let bus = EventBus::new(3);
        let id = bus.subscribe(EventFilter::default()).await;

        for i in 0..5 {
            bus.emit(Event::new(EventType::StatusChanged, "/repo", &format!("a{i}")))
                .await;
        }

        let events = bus.poll(&id, Duration::from_secs(1)).await.unwrap();
        let sources: Vec<&str> = events.iter().map(|e| e.source.as_str()).collect();
        assert_eq!(sources, vec!["a2", "a3", "a4"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_then_poll_fails() {
        let bus = EventBus::default();
        let id = bus.subscribe(EventFilter::default()).await;
        assert!(bus.unsubscribe(&id).await);
        assert!(!bus.unsubscribe(&id).await);

        let err = bus.poll(&id, Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, BrainError::SubscriberNotFound);
    }

    #[tokio::test]
    async fn test_prune_stale() {
        let bus = EventBus::default();
        let stale = bus.subscribe(EventFilter::default()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = bus.subscribe(EventFilter::default()).await;

        assert_eq!(bus.prune_stale(Duration::from_millis(20)).await, 1);
        assert_eq!(bus.subscriber_count().await, 1);
        assert!(bus.poll(&stale, Duration::from_millis(10)).await.is_err());
        assert!(bus.poll(&fresh, Duration::from_millis(10)).await.is_ok());

        assert_eq!(bus.prune_stale(Duration::from_secs(300)).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_emit_and_poll() {
        let bus = Arc::new(EventBus::default());
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(bus.subscribe(EventFilter::default()).await);
        }

        let mut emitters = Vec::new();
        for n in 0..200 {
            let bus = bus.clone();
            emitters.push(tokio::spawn(async move {
                bus.emit(Event::new(EventType::MessageReceived, "/repo", &format!("e{n}")))
                    .await
            }));
        }
        for emitter in emitters {
            emitter.await.unwrap();
        }

        for id in &ids {
            let events = bus.poll(id, Duration::from_millis(200)).await.unwrap();
            assert_eq!(events.len(), 200);
            assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
        }
        assert_eq!(bus.last_sequence(), 200);
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&EventType::InstanceStatusChanged).unwrap();
        assert_eq!(json, r#""instance_status_changed""#);

        let custom: EventType = serde_json::from_str(r#""deploy_started""#).unwrap();
        assert_eq!(custom, EventType::Other("deploy_started".into()));
        assert_eq!(custom.to_string(), "deploy_started");
    }
}

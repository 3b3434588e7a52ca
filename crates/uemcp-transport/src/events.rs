use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::error;

use uemcp_core::RuntimeMetrics;

pub const DEFAULT_MAX_EVENTS_PER_REQUEST: usize = 200;
pub const DEFAULT_MAX_GLOBAL_EVENTS: usize = 2_000;
pub const DEFAULT_SUBSCRIPTION_QUEUE: usize = 256;

/// Classification derived from the downstream `event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Progress,
    Log,
    Artifact,
    JobStatus,
    Changeset,
    Other,
}

impl NotificationKind {
    fn from_event_type(event_type: &str) -> Self {
        match event_type {
            "event.progress" => Self::Progress,
            "event.log" => Self::Log,
            "event.artifact" => Self::Artifact,
            "event.job.status" => Self::JobStatus,
            "event.changeset.created" => Self::Changeset,
            _ => Self::Other,
        }
    }
}

/// A downstream event in the shape the bridge fans out.
///
/// Normalization is a fixed point: normalizing the serialized form of a
/// `NormalizedEvent` yields the same event.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub event_type: String,
    pub request_id: String,
    pub timestamp_ms: i64,
    pub payload: Map<String, Value>,
    pub notification_kind: NotificationKind,
}

impl NormalizedEvent {
    pub fn from_value(event: &Value) -> Self {
        let event_type = event
            .get("event_type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let payload = event
            .get("payload")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        Self {
            event_id: event
                .get("event_id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            notification_kind: NotificationKind::from_event_type(&event_type),
            event_type,
            request_id: event
                .get("request_id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            timestamp_ms: event.get("timestamp_ms").and_then(Value::as_i64).unwrap_or(0),
            payload,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut out = json!({
            "type": "ue.event",
            "event_id": self.event_id,
            "event_type": self.event_type,
            "request_id": self.request_id,
            "timestamp_ms": self.timestamp_ms,
            "payload": self.payload,
            "notification_kind": serde_json::to_value(self.notification_kind).expect("kind"),
        });
        let object = out.as_object_mut().expect("event object");
        match self.notification_kind {
            NotificationKind::Progress => {
                object.insert(
                    "percent".into(),
                    self.payload.get("percent").cloned().unwrap_or(Value::Null),
                );
                object.insert(
                    "phase".into(),
                    self.payload.get("phase").cloned().unwrap_or(Value::Null),
                );
            }
            NotificationKind::Log => {
                object.insert(
                    "level".into(),
                    self.payload.get("level").cloned().unwrap_or(Value::Null),
                );
                object.insert(
                    "message".into(),
                    self.payload.get("message").cloned().unwrap_or(Value::Null),
                );
            }
            _ => {}
        }
        out
    }
}

pub type EventListener = Arc<dyn Fn(&NormalizedEvent) + Send + Sync>;

struct SubscriptionState {
    request_id: Option<String>,
    sender: mpsc::Sender<NormalizedEvent>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct RouterState {
    global_events: VecDeque<NormalizedEvent>,
    events_by_request: HashMap<String, VecDeque<NormalizedEvent>>,
    listeners: Vec<(u64, EventListener)>,
    subscriptions: HashMap<u64, SubscriptionState>,
    next_token: u64,
}

/// Fan-out hub for downstream events.
///
/// Publishing never blocks: bounded subscription queues drop on overflow
/// (counted per subscription), and listener panics are contained.
pub struct EventRouter {
    max_events_per_request: usize,
    max_global_events: usize,
    state: Arc<Mutex<RouterState>>,
    metrics: Option<Arc<RuntimeMetrics>>,
}

impl EventRouter {
    pub fn new(metrics: Option<Arc<RuntimeMetrics>>) -> Self {
        Self::with_capacity(
            DEFAULT_MAX_EVENTS_PER_REQUEST,
            DEFAULT_MAX_GLOBAL_EVENTS,
            metrics,
        )
    }

    pub fn with_capacity(
        max_events_per_request: usize,
        max_global_events: usize,
        metrics: Option<Arc<RuntimeMetrics>>,
    ) -> Self {
        Self {
            max_events_per_request,
            max_global_events,
            state: Arc::new(Mutex::new(RouterState::default())),
            metrics,
        }
    }

    pub fn publish(&self, event: &Value) {
        let normalized = NormalizedEvent::from_value(event);
        let event_type = if normalized.event_type.is_empty() {
            "unknown"
        } else {
            normalized.event_type.as_str()
        };

        let (listeners, subscriptions, global_len) = {
            let mut state = self.state.lock().expect("event router lock poisoned");

            if state.global_events.len() == self.max_global_events {
                state.global_events.pop_front();
            }
            state.global_events.push_back(normalized.clone());

            if !normalized.request_id.is_empty() {
                let max_per_request = self.max_events_per_request;
                let ring = state
                    .events_by_request
                    .entry(normalized.request_id.clone())
                    .or_default();
                if ring.len() == max_per_request {
                    ring.pop_front();
                }
                ring.push_back(normalized.clone());
            }

            let listeners: Vec<EventListener> = state
                .listeners
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect();
            let subscriptions: Vec<(Option<String>, mpsc::Sender<NormalizedEvent>, Arc<AtomicU64>)> =
                state
                    .subscriptions
                    .values()
                    .map(|sub| (sub.request_id.clone(), sub.sender.clone(), sub.dropped.clone()))
                    .collect();
            (listeners, subscriptions, state.global_events.len())
        };

        if let Some(metrics) = &self.metrics {
            metrics.inc("event_router.event_published");
            metrics.inc(&format!("event_router.event_type.{event_type}"));
            metrics.set_gauge("event_router.global_buffer_size", global_len as f64);
        }

        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(&normalized)));
            if outcome.is_err() {
                error!("Event listener panicked.");
            }
        }

        for (filter, sender, dropped) in subscriptions {
            if let Some(filter) = &filter {
                if *filter != normalized.request_id {
                    continue;
                }
            }
            match sender.try_send(normalized.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        metrics.inc("event_router.subscription_dropped");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn add_listener(&self, listener: EventListener) -> u64 {
        let mut state = self.state.lock().expect("event router lock poisoned");
        state.next_token += 1;
        let token = state.next_token;
        state.listeners.push((token, listener));
        token
    }

    pub fn remove_listener(&self, token: u64) {
        let mut state = self.state.lock().expect("event router lock poisoned");
        state.listeners.retain(|(existing, _)| *existing != token);
    }

    /// Open a bounded subscription; `request_id` of `None` receives all
    /// events, otherwise only events correlated to that request.
    pub fn subscribe(&self, request_id: Option<&str>, queue_size: usize) -> EventSubscription {
        assert!(queue_size > 0, "queue_size must be > 0");

        let (sender, receiver) = mpsc::channel(queue_size);
        let dropped = Arc::new(AtomicU64::new(0));
        let (token, subscription_count) = {
            let mut state = self.state.lock().expect("event router lock poisoned");
            state.next_token += 1;
            let token = state.next_token;
            state.subscriptions.insert(
                token,
                SubscriptionState {
                    request_id: request_id.map(str::to_string),
                    sender,
                    dropped: dropped.clone(),
                },
            );
            (token, state.subscriptions.len())
        };

        if let Some(metrics) = &self.metrics {
            metrics.inc("event_router.subscription_created");
            metrics.set_gauge("event_router.subscriptions", subscription_count as f64);
        }

        EventSubscription {
            state: Arc::downgrade(&self.state),
            metrics: self.metrics.clone(),
            token,
            request_id: request_id.map(str::to_string),
            receiver,
            dropped,
            closed: false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .expect("event router lock poisoned")
            .subscriptions
            .len()
    }

    pub fn events_for(&self, request_id: &str) -> Vec<NormalizedEvent> {
        let state = self.state.lock().expect("event router lock poisoned");
        state
            .events_by_request
            .get(request_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<NormalizedEvent> {
        if limit == 0 {
            return Vec::new();
        }
        let state = self.state.lock().expect("event router lock poisoned");
        let skip = state.global_events.len().saturating_sub(limit);
        state.global_events.iter().skip(skip).cloned().collect()
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

/// Bounded, optionally request-filtered queue of normalized events.
pub struct EventSubscription {
    state: Weak<Mutex<RouterState>>,
    metrics: Option<Arc<RuntimeMetrics>>,
    token: u64,
    request_id: Option<String>,
    receiver: mpsc::Receiver<NormalizedEvent>,
    dropped: Arc<AtomicU64>,
    closed: bool,
}

impl EventSubscription {
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Events discarded because this subscription's queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Next event, waiting at most `timeout` when one is given.
    pub async fn recv(&mut self, timeout: Option<Duration>) -> Option<NormalizedEvent> {
        if self.closed {
            return None;
        }
        match timeout {
            None => self.receiver.recv().await,
            Some(timeout) => match tokio::time::timeout(timeout, self.receiver.recv()).await {
                Ok(event) => event,
                Err(_elapsed) => None,
            },
        }
    }

    pub fn try_recv(&mut self) -> Option<NormalizedEvent> {
        if self.closed {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let Some(state) = self.state.upgrade() else {
            return;
        };
        let (removed, remaining) = {
            let mut state = state.lock().expect("event router lock poisoned");
            let removed = state.subscriptions.remove(&self.token).is_some();
            (removed, state.subscriptions.len())
        };
        if removed {
            if let Some(metrics) = &self.metrics {
                metrics.inc("event_router.subscription_closed");
                metrics.set_gauge("event_router.subscriptions", remaining as f64);
            }
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

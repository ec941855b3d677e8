//! In-process typed publish/subscribe.
//!
//! The bus is the only signaling channel between runtime components.
//! Delivery is synchronous on the publishing task; handlers must be
//! non-blocking and hand real work off to their own tasks. A panicking
//! handler is logged and does not stop delivery to later handlers.

use crate::{Result, StrandError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::Duration;
use tracing::{debug, error};

/// The closed set of topics the runtime publishes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    AgentCreated,
    AgentStarted,
    AgentStopped,
    AgentError,
    AgentStatusChanged,
    AgentHeartbeat,
    AgentHeartbeatTimeout,
    AgentReady,
    TaskCreated,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskSkipped,
    /// Abort request sent to the agent running a task.
    TaskCancel,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowStopped,
    WorkflowProgress,
    PoolCreated,
    PoolScaled,
    ProcessExit,
    ProcessError,
    AgentsUpdated,
    TasksUpdated,
    WorkflowsUpdated,
    ArchivedUpdated,
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventTopic::AgentCreated => "agent:created",
            EventTopic::AgentStarted => "agent:started",
            EventTopic::AgentStopped => "agent:stopped",
            EventTopic::AgentError => "agent:error",
            EventTopic::AgentStatusChanged => "agent:status-changed",
            EventTopic::AgentHeartbeat => "agent:heartbeat",
            EventTopic::AgentHeartbeatTimeout => "agent:heartbeat-timeout",
            EventTopic::AgentReady => "agent:ready",
            EventTopic::TaskCreated => "task:created",
            EventTopic::TaskAssigned => "task:assigned",
            EventTopic::TaskCompleted => "task:completed",
            EventTopic::TaskFailed => "task:failed",
            EventTopic::TaskCancelled => "task:cancelled",
            EventTopic::TaskSkipped => "task:skipped",
            EventTopic::TaskCancel => "task:cancel",
            EventTopic::WorkflowStarted => "workflow:started",
            EventTopic::WorkflowCompleted => "workflow:completed",
            EventTopic::WorkflowFailed => "workflow:failed",
            EventTopic::WorkflowStopped => "workflow:stopped",
            EventTopic::WorkflowProgress => "workflow:progress",
            EventTopic::PoolCreated => "pool:created",
            EventTopic::PoolScaled => "pool:scaled",
            EventTopic::ProcessExit => "process:exit",
            EventTopic::ProcessError => "process:error",
            EventTopic::AgentsUpdated => "agents:updated",
            EventTopic::TasksUpdated => "tasks:updated",
            EventTopic::WorkflowsUpdated => "workflows:updated",
            EventTopic::ArchivedUpdated => "archived:updated",
        };
        write!(f, "{name}")
    }
}

/// A published event as seen by handlers.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: EventTopic,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

/// Per-topic emission statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicStats {
    pub publish_count: u64,
    pub last_emitted_at: Option<DateTime<Utc>>,
}

/// Handle returned by `subscribe`; pass back to `unsubscribe` to cancel.
#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    topic: EventTopic,
    id: u64,
}

/// An armed one-shot watch created by [`EventBus::watch`].
pub struct EventWatch {
    topic: EventTopic,
    id: u64,
    rx: oneshot::Receiver<Value>,
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    once: bool,
    handler: Handler,
}

struct Waiter {
    id: u64,
    predicate: Box<dyn Fn(&Value) -> bool + Send>,
    sender: oneshot::Sender<Value>,
}

struct Inner {
    handlers: RwLock<HashMap<EventTopic, Vec<HandlerEntry>>>,
    waiters: Mutex<HashMap<EventTopic, Vec<Waiter>>>,
    stats: RwLock<HashMap<EventTopic, TopicStats>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
                stats: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Deliver `payload` to every handler and waiter registered on `topic`.
    ///
    /// Handlers run on the publishing task against a snapshot of the
    /// handler list, so registration during delivery takes effect on the
    /// next publish.
    pub async fn publish(&self, topic: EventTopic, payload: Value) {
        let event = Event {
            topic,
            payload,
            emitted_at: Utc::now(),
        };

        {
            let mut stats = self.inner.stats.write().await;
            let entry = stats.entry(topic).or_default();
            entry.publish_count += 1;
            entry.last_emitted_at = Some(event.emitted_at);
        }

        let snapshot: Vec<(u64, bool, Handler)> = {
            let handlers = self.inner.handlers.read().await;
            handlers
                .get(&topic)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|e| (e.id, e.once, e.handler.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        debug!("publish {topic} to {} handler(s)", snapshot.len());

        let mut fired_once = Vec::new();
        for (id, once, handler) in &snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if result.is_err() {
                error!("event handler {id} panicked on {topic}");
            }
            if *once {
                fired_once.push(*id);
            }
        }

        if !fired_once.is_empty() {
            let mut handlers = self.inner.handlers.write().await;
            if let Some(entries) = handlers.get_mut(&topic) {
                entries.retain(|e| !fired_once.contains(&e.id));
            }
        }

        let mut woken = Vec::new();
        {
            let mut waiters = self.inner.waiters.lock().await;
            if let Some(list) = waiters.get_mut(&topic) {
                let mut remaining = Vec::new();
                for waiter in list.drain(..) {
                    if (waiter.predicate)(&event.payload) {
                        woken.push(waiter.sender);
                    } else {
                        remaining.push(waiter);
                    }
                }
                *list = remaining;
            }
        }
        for sender in woken {
            // Receiver may have timed out already; nothing to do then.
            let _ = sender.send(event.payload.clone());
        }
    }

    /// Register a handler; returns a cancellation handle.
    pub async fn subscribe<F>(&self, topic: EventTopic, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(topic, handler, false).await
    }

    /// Register a handler that is removed after its first delivery.
    pub async fn subscribe_once<F>(&self, topic: EventTopic, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(topic, handler, true).await
    }

    async fn register<F>(&self, topic: EventTopic, handler: F, once: bool) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.inner.handlers.write().await;
        handlers.entry(topic).or_default().push(HandlerEntry {
            id,
            once,
            handler: Arc::new(handler),
        });
        Subscription { topic, id }
    }

    pub async fn unsubscribe(&self, subscription: Subscription) {
        let mut handlers = self.inner.handlers.write().await;
        if let Some(entries) = handlers.get_mut(&subscription.topic) {
            entries.retain(|e| e.id != subscription.id);
        }
    }

    /// Register interest in the next matching event without waiting yet.
    ///
    /// Use this when the event may fire as a consequence of an action taken
    /// between registration and the wait (e.g. a spawned process signalling
    /// readiness): the watch is armed before the action starts.
    pub async fn watch<P>(&self, topic: EventTopic, predicate: P) -> EventWatch
    where
        P: Fn(&Value) -> bool + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.inner.waiters.lock().await;
            waiters.entry(topic).or_default().push(Waiter {
                id,
                predicate: Box::new(predicate),
                sender: tx,
            });
        }
        EventWatch { topic, id, rx }
    }

    /// Wait on an armed watch, up to `timeout`.
    pub async fn wait(&self, watch: EventWatch, timeout: Duration) -> Result<Value> {
        let EventWatch { topic, id, rx } = watch;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            // Sender dropped without firing; treat as a timeout as well.
            Ok(Err(_)) => Err(StrandError::Timeout(format!("await_event on {topic}"))),
            Err(_) => {
                let mut waiters = self.inner.waiters.lock().await;
                if let Some(list) = waiters.get_mut(&topic) {
                    list.retain(|w| w.id != id);
                }
                Err(StrandError::Timeout(format!("await_event on {topic}")))
            }
        }
    }

    /// Wait for the next event on `topic` whose payload satisfies
    /// `predicate`, up to `timeout`.
    pub async fn await_event<P>(
        &self,
        topic: EventTopic,
        predicate: P,
        timeout: Duration,
    ) -> Result<Value>
    where
        P: Fn(&Value) -> bool + Send + 'static,
    {
        let watch = self.watch(topic, predicate).await;
        self.wait(watch, timeout).await
    }

    pub async fn topic_stats(&self, topic: EventTopic) -> TopicStats {
        let stats = self.inner.stats.read().await;
        stats.get(&topic).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn publish_reaches_all_handlers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            bus.subscribe(EventTopic::AgentCreated, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        bus.publish(EventTopic::AgentCreated, json!({"agentId": "a"}))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let sub = bus
            .subscribe(EventTopic::TaskCompleted, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        bus.publish(EventTopic::TaskCompleted, json!({})).await;
        bus.unsubscribe(sub).await;
        bus.publish(EventTopic::TaskCompleted, json!({})).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribe_once_fires_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        bus.subscribe_once(EventTopic::AgentReady, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        bus.publish(EventTopic::AgentReady, json!({})).await;
        bus.publish(EventTopic::AgentReady, json!({})).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventTopic::AgentError, |_| panic!("boom"))
            .await;
        let counter = count.clone();
        bus.subscribe(EventTopic::AgentError, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        bus.publish(EventTopic::AgentError, json!({})).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn await_event_matches_predicate() {
        let bus = EventBus::new();

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.await_event(
                    EventTopic::AgentReady,
                    |payload| payload["agentId"] == "a-2",
                    Duration::from_secs(1),
                )
                .await
            })
        };

        // Give the waiter time to register before publishing.
        tokio::task::yield_now().await;
        bus.publish(EventTopic::AgentReady, json!({"agentId": "a-1"}))
            .await;
        bus.publish(EventTopic::AgentReady, json!({"agentId": "a-2"}))
            .await;

        let payload = waiter.await.unwrap().unwrap();
        assert_eq!(payload["agentId"], "a-2");
    }

    #[tokio::test]
    async fn await_event_times_out() {
        let bus = EventBus::new();
        let result = bus
            .await_event(EventTopic::AgentReady, |_| true, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(StrandError::Timeout(_))));
    }

    #[tokio::test]
    async fn stats_track_emissions() {
        let bus = EventBus::new();
        assert_eq!(
            bus.topic_stats(EventTopic::PoolCreated).await.publish_count,
            0
        );

        bus.publish(EventTopic::PoolCreated, json!({})).await;
        bus.publish(EventTopic::PoolCreated, json!({})).await;

        let stats = bus.topic_stats(EventTopic::PoolCreated).await;
        assert_eq!(stats.publish_count, 2);
        assert!(stats.last_emitted_at.is_some());
    }
}

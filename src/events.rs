//! Event broadcaster: fans task state changes out to subscribers.
//!
//! Every subscriber gets its own bounded queue and its own delivery task, so
//! a slow observer never blocks producers. A subscriber whose queue fills up
//! is dropped; what it already had queued is still delivered.
//!
//! Sequence numbers are assigned under the subscriber lock, so each
//! subscriber sees events in production order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::tasks::model::TaskStatus;

/// What produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A task status change.
    Transition,
    /// The task moved to another worker without a status change.
    Reassigned,
    /// The task was removed.
    Deleted,
    /// A workflow step changed state.
    Step,
}

/// A published state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub sequence: u64,
    pub task_id: Uuid,
    pub previous_state: TaskStatus,
    pub new_state: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

/// Receives events on a subscriber's delivery task.
#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, event: TaskEvent);
}

pub type SubscriberId = u64;

/// Handle to an observer subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriberId,
    delivery: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// True once the delivery loop has ended (unsubscribed or dropped).
    pub fn is_finished(&self) -> bool {
        self.delivery.is_finished()
    }

    /// Wait for the delivery loop to drain and exit.
    pub async fn join(self) {
        let _ = self.delivery.await;
    }
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<TaskEvent>,
}

pub struct EventBroadcaster {
    backlog: usize,
    next_sequence: AtomicU64,
    next_subscriber: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBroadcaster {
    /// Create a broadcaster buffering at most `backlog` events per subscriber.
    pub fn new(backlog: usize) -> Arc<Self> {
        Arc::new(Self {
            backlog: backlog.max(1),
            next_sequence: AtomicU64::new(1),
            next_subscriber: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Register a raw receiver.
    pub async fn subscribe_channel(&self) -> (SubscriberId, mpsc::Receiver<TaskEvent>) {
        let (tx, rx) = mpsc::channel(self.backlog);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().await.push(Subscriber { id, tx });
        debug!(subscriber_id = id, "Subscriber added");
        (id, rx)
    }

    /// Subscribe as a `Stream` of events.
    pub async fn subscribe_stream(&self) -> (SubscriberId, ReceiverStream<TaskEvent>) {
        let (id, rx) = self.subscribe_channel().await;
        (id, ReceiverStream::new(rx))
    }

    /// Subscribe an observer. Its events are delivered on a dedicated task.
    pub async fn subscribe(&self, observer: Arc<dyn EventObserver>) -> SubscriptionHandle {
        let (id, mut rx) = self.subscribe_channel().await;
        let delivery = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                observer.on_event(event).await;
            }
            debug!(subscriber_id = id, "Delivery loop finished");
        });
        SubscriptionHandle { id, delivery }
    }

    /// Remove a subscriber. Already queued events are still delivered.
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Publish an event to every subscriber without waiting on any of them.
    pub async fn publish(
        &self,
        task_id: Uuid,
        previous_state: TaskStatus,
        new_state: TaskStatus,
        kind: EventKind,
        extra: serde_json::Value,
    ) -> TaskEvent {
        let mut subscribers = self.subscribers.lock().await;

        let event = TaskEvent {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            task_id,
            previous_state,
            new_state,
            timestamp: Utc::now(),
            kind,
            extra,
        };

        subscribers.retain(|s| match s.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    subscriber_id = s.id,
                    backlog = self.backlog,
                    "Subscriber lagged past its backlog, dropping"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                info!(subscriber_id = s.id, "Subscriber went away");
                false
            }
        });

        debug!(
            task_id = %task_id,
            sequence = event.sequence,
            from = %previous_state,
            to = %new_state,
            kind = ?kind,
            "Event published"
        );
        event
    }
}

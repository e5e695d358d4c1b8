use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::RwLock;
use saga_core::SagaEvent;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, trace, warn};
use uuid::Uuid;

use crate::panic_message;

/// Subscribes a handler to every event type.
pub const ALL_EVENTS: &str = "*";

pub type EventHandler = Arc<dyn Fn(&SagaEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

#[derive(Default)]
struct HandlerRegistry {
    handlers: RwLock<IndexMap<String, Vec<(SubscriptionId, EventHandler)>>>,
}

impl HandlerRegistry {
    fn handlers_for(&self, event_type: &str) -> Vec<EventHandler> {
        let handlers = self.handlers.read();
        [event_type, ALL_EVENTS]
            .iter()
            .filter_map(|key| handlers.get(*key))
            .flatten()
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }

    /// Runs every matching handler; a panicking handler is logged and skipped.
    fn dispatch(&self, event: &SagaEvent) -> usize {
        let mut delivered = 0;
        for handler in self.handlers_for(event.event_type.as_str()) {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => error!(
                    event_type = %event.event_type,
                    saga_id = %event.saga_execution_id,
                    panic = %panic_message(panic.as_ref()),
                    "event handler panicked"
                ),
            }
        }
        delivered
    }
}

/// Observability fan-out for saga events.
///
/// Never on the correctness path: `publish_async` drops events when the queue
/// is full rather than applying backpressure.
pub struct EventBus {
    registry: Arc<HandlerRegistry>,
    sender: mpsc::Sender<SagaEvent>,
    dropped: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Creates the bus and spawns its background dispatcher.
    ///
    /// The dispatcher stops once the bus is dropped and the queue drained.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime or with a zero capacity.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<SagaEvent>(queue_capacity);
        let registry = Arc::new(HandlerRegistry::default());

        let dispatcher_registry = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                dispatcher_registry.dispatch(&event);
            }
            trace!("event dispatcher stopped");
        });

        Self {
            registry,
            sender,
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers `handler` for `event_type`, or for everything with [`ALL_EVENTS`].
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&SagaEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        self.registry
            .handlers
            .write()
            .entry(event_type.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns false when the subscription was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.registry.handlers.write();
        let mut removed = false;
        for subscribers in handlers.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|(sub_id, _)| *sub_id != id);
            removed |= subscribers.len() != before;
        }
        handlers.retain(|_, subscribers| !subscribers.is_empty());
        removed
    }

    /// Delivers synchronously on the caller's task. Returns how many handlers
    /// completed without panicking.
    pub fn publish(&self, event: &SagaEvent) -> usize {
        self.registry.dispatch(event)
    }

    /// Queues the event for the background dispatcher.
    ///
    /// Returns false when the event was dropped because the queue is full.
    pub fn publish_async(&self, event: SagaEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_type = %event.event_type,
                    saga_id = %event.saga_execution_id,
                    "event queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Total events discarded by `publish_async`.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

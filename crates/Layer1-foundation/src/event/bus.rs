//! Event Bus - asynchronous broadcast of typed events

use super::types::EventRecord;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

// ============================================================================
// EventListener Trait
// ============================================================================

/// Listener registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Observer for one event type
#[async_trait]
pub trait EventListener<E>: Send + Sync {
    /// Listener name (for debugging)
    fn name(&self) -> &str;

    async fn on_event(&self, event: &EventRecord<E>);
}

// ============================================================================
// EventBus
// ============================================================================

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast channel capacity; slow receivers lag past this
    pub channel_capacity: usize,

    /// Events kept for late subscribers
    pub history_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            history_size: 100,
        }
    }
}

/// Publish/subscribe hub for events of type `E`
pub struct EventBus<E> {
    source: String,

    config: EventBusConfig,

    sender: broadcast::Sender<EventRecord<E>>,

    listeners: RwLock<HashMap<ListenerId, Arc<dyn EventListener<E>>>>,

    listener_counter: AtomicU64,

    history: RwLock<VecDeque<EventRecord<E>>>,

    event_count: AtomicU64,
}

impl<E> EventBus<E>
where
    E: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    /// Create a bus for events published by `source`
    pub fn new(source: impl Into<String>) -> Self {
        Self::with_config(source, EventBusConfig::default())
    }

    pub fn with_config(source: impl Into<String>, config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));

        Self {
            source: source.into(),
            config,
            sender,
            listeners: RwLock::new(HashMap::new()),
            listener_counter: AtomicU64::new(0),
            history: RwLock::new(VecDeque::new()),
            event_count: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Register a listener
    pub async fn subscribe(&self, listener: Arc<dyn EventListener<E>>) -> ListenerId {
        let id = ListenerId(self.listener_counter.fetch_add(1, Ordering::SeqCst));

        debug!(
            source = %self.source,
            listener_name = listener.name(),
            listener_id = %id,
            "Registering event listener"
        );

        self.listeners.write().await.insert(id, listener);
        id
    }

    /// Remove a listener; returns whether it was registered
    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        let removed = self.listeners.write().await.remove(&id).is_some();
        if removed {
            debug!(source = %self.source, listener_id = %id, "Unregistered event listener");
        }
        removed
    }

    /// Stream-style receiver for every event published from now on
    pub fn receiver(&self) -> broadcast::Receiver<EventRecord<E>> {
        self.sender.subscribe()
    }

    /// Publish an event to the history, the broadcast channel and all listeners
    pub async fn publish(&self, payload: E) {
        let record = EventRecord::new(self.source.clone(), payload);
        let count = self.event_count.fetch_add(1, Ordering::SeqCst) + 1;

        trace!(
            source = %self.source,
            event_id = %record.id,
            payload = ?record.payload,
            "Publishing event #{}", count
        );

        {
            let mut history = self.history.write().await;
            history.push_back(record.clone());
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }

        // No receivers is fine
        let _ = self.sender.send(record.clone());

        let listeners: Vec<Arc<dyn EventListener<E>>> =
            self.listeners.read().await.values().cloned().collect();
        for listener in listeners {
            listener.on_event(&record).await;
        }
    }

    /// Recent events, oldest first
    pub async fn history(&self) -> Vec<EventRecord<E>> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::SeqCst)
    }
}

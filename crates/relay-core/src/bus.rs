use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub event_type: String,
    pub properties: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusEventDef {
    pub event_type: &'static str,
}

impl BusEventDef {
    pub const fn new(event_type: &'static str) -> Self {
        Self { event_type }
    }
}

type BoxedCallback = Box<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

struct Subscription {
    id: u64,
    callback: BoxedCallback,
}

/// In-process event bus.
///
/// Publishing never blocks: callback subscribers run inline on the
/// publisher's thread and channel subscribers receive a copy through a
/// bounded broadcast channel (lagging receivers lose the oldest events).
pub struct Bus {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<String, Vec<Subscription>>>,
    wildcard_subscribers: RwLock<Vec<Subscription>>,
    tx: broadcast::Sender<BusEvent>,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            next_id: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
            wildcard_subscribers: RwLock::new(Vec::new()),
            tx,
        }
    }

    pub fn publish(&self, def: &BusEventDef, properties: serde_json::Value) {
        tracing::trace!(event_type = def.event_type, "publishing event");

        if let Some(subs) = self.subscribers.read().get(def.event_type) {
            for sub in subs {
                (sub.callback)(def.event_type, &properties);
            }
        }

        for sub in self.wildcard_subscribers.read().iter() {
            (sub.callback)(def.event_type, &properties);
        }

        // No receivers is not an error.
        let _ = self.tx.send(BusEvent {
            event_type: def.event_type.to_string(),
            properties,
        });
    }

    pub fn subscribe<F>(&self, def: &BusEventDef, callback: F) -> u64
    where
        F: Fn(&str, &serde_json::Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribers
            .write()
            .entry(def.event_type.to_string())
            .or_default()
            .push(Subscription {
                id,
                callback: Box::new(callback),
            });
        id
    }

    pub fn unsubscribe(&self, event_type: &str, id: u64) {
        if let Some(subs) = self.subscribers.write().get_mut(event_type) {
            subs.retain(|s| s.id != id);
        }
    }

    pub fn subscribe_all<F>(&self, callback: F) -> u64
    where
        F: Fn(&str, &serde_json::Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.wildcard_subscribers.write().push(Subscription {
            id,
            callback: Box::new(callback),
        });
        id
    }

    pub fn unsubscribe_all(&self, id: u64) {
        self.wildcard_subscribers.write().retain(|s| s.id != id);
    }

    pub fn subscribe_channel(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("topics", &self.subscribers.read().len())
            .field("wildcard", &self.wildcard_subscribers.read().len())
            .finish()
    }
}

pub const fn define_event(event_type: &'static str) -> BusEventDef {
    BusEventDef::new(event_type)
}

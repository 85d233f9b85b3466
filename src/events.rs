use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A domain event published on the [`EventBus`]. Plain record with an id,
/// timestamp, type tag, and a JSON payload — the core never interprets the
/// payload itself, only subscribers do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: String,
    pub occurred_on: DateTime<Utc>,
    pub event_type: String,
    pub payload: Value,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        DomainEvent {
            event_id: Uuid::new_v4().to_string(),
            occurred_on: Utc::now(),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Event type tags the core itself publishes.
pub mod event_types {
    pub const EXECUTION_COMPLETED: &str = "ExecutionCompleted";
    pub const EXECUTION_ABORTED: &str = "ExecutionAborted";
    pub const SINGLE_LEG_DETECTED: &str = "SingleLegDetected";
    pub const REBALANCE_DECIDED: &str = "RebalanceDecided";
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent);
}

/// In-process typed publish/subscribe, per §4.2.
///
/// `publish` iterates handlers in registration order and awaits each
/// sequentially — a slow handler delays the others, which is an accepted
/// tradeoff per §9's design notes rather than a bug. A handler is never
/// allowed to abort the dispatch loop: this bus has no notion of a handler
/// "throwing", since `EventHandler::handle` returns `()`; a handler that needs
/// fallible behaviour catches its own errors and narrates them itself, the way
/// the teacher's venues log-and-continue rather than propagate (see e.g.
/// `venues/perps/hyperliquid.rs`'s `eprintln!`-on-`Err` reconciliation paths).
pub struct EventBus {
    handlers: Mutex<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.lock().await;
        handlers.entry(event_type.into()).or_default().push(handler);
    }

    /// Remove the first handler pointer-equal to `handler` for `event_type`, if any.
    pub async fn unsubscribe(&self, event_type: &str, handler: &Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.lock().await;
        if let Some(list) = handlers.get_mut(event_type) {
            list.retain(|h| !Arc::ptr_eq(h, handler));
        }
    }

    pub async fn publish(&self, event: DomainEvent) {
        let subscribers = {
            let handlers = self.handlers.lock().await;
            handlers.get(&event.event_type).cloned().unwrap_or_default()
        };
        for handler in subscribers {
            handler.handle(&event).await;
        }
    }
}

//! Event dispatch - routes worker events to listeners and subscribers
//!
//! Workers never call listener code directly. They push events into an
//! unbounded channel consumed by one dispatch task, which fans each event
//! out to the broadcast channel and to the transfer's [`Listeners`].

use crate::engine::TransferRegistry;
use crate::listener::Listeners;
use parking_lot::Mutex;
use rdm_types::{EngineEvent, TransferEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

/// Handle used to emit events and manage listeners
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<EngineEvent>,
    broadcast: broadcast::Sender<EngineEvent>,
    listeners: Arc<Mutex<HashMap<Uuid, Arc<Listeners>>>>,
}

impl EventBus {
    /// Spawn the dispatch task
    ///
    /// When `retain_terminal` is false, completed and failed transfers are
    /// dropped from `registry` once their listeners have been notified.
    pub fn spawn(registry: TransferRegistry, retain_terminal: bool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();
        let (broadcast, _) = broadcast::channel(1000);
        let listeners: Arc<Mutex<HashMap<Uuid, Arc<Listeners>>>> = Arc::default();

        let subscribers = broadcast.clone();
        let handlers = listeners.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let _ = subscribers.send(event.clone());

                let handler = handlers.lock().get(&event.id).cloned();
                if let Some(handler) = handler {
                    handler.notify(event.id, &event.event);
                }

                if event.event.is_terminal() {
                    handlers.lock().remove(&event.id);
                    if !retain_terminal && registry.status(event.id).is_terminal() {
                        registry.remove(event.id);
                    }
                }
            }
            debug!("Event dispatcher stopped");
        });

        Self {
            tx,
            broadcast,
            listeners,
        }
    }

    pub fn emit(&self, id: Uuid, event: TransferEvent) {
        let _ = self.tx.send(EngineEvent { id, event });
    }

    /// Attach listeners to a transfer, replacing any previous set
    pub fn register(&self, id: Uuid, listeners: Listeners) {
        self.listeners.lock().insert(id, Arc::new(listeners));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.broadcast.subscribe()
    }
}

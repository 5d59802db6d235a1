//! Change notifications for UI surfaces.
//!
//! The engine emits a `SidebarEvent` whenever a view a surface may be showing
//! changes. Surfaces re-read through the engine's getters; events carry ids,
//! not data. Events raised while a batch is applied are collected in an
//! [`EventBuffer`] and delivered once, de-duplicated, after the batch.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SidebarEvent {
    /// A directory entry or its cached session page changed.
    DirectoryChanged {
        #[serde(rename = "directoryId")]
        directory_id: String,
    },
    RecentIndexChanged,
    RunningIndexChanged,
    /// Runtime status of one session changed.
    RuntimeChanged {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    PreferencesChanged {
        version: u64,
        #[serde(rename = "updatedAt")]
        updated_at: u64,
    },
    /// Ownership could not be resolved locally; every view should reload.
    FullRefreshRequested,
    /// The patch stream is out of sync and a bootstrap is needed.
    ResyncRequired {
        /// The backend discarded its timeline.
        reset: bool,
    },
}

type Listener = Arc<dyn Fn(&SidebarEvent) + Send + Sync>;

/// Keeps a listener registered until dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

/// Fan-out of sidebar events. Share it as `Arc<EventBus>`.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(usize, Listener)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&SidebarEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn remove(&self, id: usize) {
        // try_write: a Subscription dropped from inside a listener must not deadlock.
        if let Ok(mut listeners) = self.listeners.try_write() {
            listeners.retain(|(existing, _)| *existing != id);
        }
    }

    fn snapshot(&self) -> Vec<Listener> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    pub fn emit(&self, event: SidebarEvent) {
        for listener in self.snapshot() {
            listener(&event);
        }
    }

    /// Deliver buffered events in the order they were first raised.
    pub fn flush(&self, buffer: &mut EventBuffer) {
        if buffer.is_empty() {
            return;
        }
        let listeners = self.snapshot();
        for event in buffer.drain() {
            for listener in &listeners {
                listener(&event);
            }
        }
    }
}

/// Ordered, de-duplicated events awaiting delivery.
#[derive(Debug, Default, Clone)]
pub struct EventBuffer {
    events: Vec<SidebarEvent>,
}

impl EventBuffer {
    pub fn push(&mut self, event: SidebarEvent) {
        if !self.events.contains(&event) {
            self.events.push(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn drain(&mut self) -> Vec<SidebarEvent> {
        std::mem::take(&mut self.events)
    }
}

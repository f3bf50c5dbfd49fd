//! Shared fixtures for integration tests.

use std::sync::{Arc, Mutex};

use canaryd::engine::EngineHandle;
use canaryd::lifecycle::CanaryService;
use canaryd::notify::{Notifier, NotifyKind};
use canaryd::store::Canary;
use canaryd::store::memory::MemoryStore;

/// Captures notifications instead of sending them.
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, NotifyKind)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self { events: Mutex::new(Vec::new()) }
    }

    /// Notified canary ids, in order.
    pub fn ids(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn kinds(&self) -> Vec<NotifyKind> {
        self.events.lock().unwrap().iter().map(|(_, kind)| *kind).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, canary: &Canary, kind: NotifyKind) {
        self.events.lock().unwrap().push((canary.id.clone(), kind));
    }
}

/// A service over a fresh in-memory store, with no engine attached.
pub fn service() -> (Arc<CanaryService>, Arc<MemoryStore>, Arc<RecordingNotifier>) {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let service = Arc::new(CanaryService::new(
        store.clone(),
        notifier.clone(),
        EngineHandle::disconnected(),
    ));
    (service, store, notifier)
}

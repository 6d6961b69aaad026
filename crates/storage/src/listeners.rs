use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{CollectionSubscription, Document, DocumentSubscription, ListenerHandle, Subscription};

type ListenerId = u64;

#[derive(Default)]
struct RegistryState {
    next_id: ListenerId,
    collections: HashMap<ListenerId, (String, mpsc::UnboundedSender<Vec<Document>>)>,
    documents: HashMap<ListenerId, (String, mpsc::UnboundedSender<Option<Document>>)>,
}

/// In-process fan-out of snapshots to subscribed listeners, shared by the store backends.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_collection(&self, path: &str, initial: Vec<Document>) -> CollectionSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(initial);
        let id = {
            let mut state = self.inner.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.collections.insert(id, (path.to_string(), tx));
            id
        };
        debug!(listener_id = id, path, "store: collection listener registered");
        Subscription::new(rx, self.release_handle(id))
    }

    pub fn register_document(&self, path: &str, initial: Option<Document>) -> DocumentSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(initial);
        let id = {
            let mut state = self.inner.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.documents.insert(id, (path.to_string(), tx));
            id
        };
        debug!(listener_id = id, path, "store: document listener registered");
        Subscription::new(rx, self.release_handle(id))
    }

    fn release_handle(&self, id: ListenerId) -> ListenerHandle {
        let registry: Weak<Mutex<RegistryState>> = Arc::downgrade(&self.inner);
        ListenerHandle::new(move || {
            if let Some(registry) = registry.upgrade() {
                let mut state = registry.lock();
                let removed = state.collections.remove(&id).is_some()
                    || state.documents.remove(&id).is_some();
                if removed {
                    debug!(listener_id = id, "store: listener released");
                }
            }
        })
    }

    pub fn watches_collection(&self, path: &str) -> bool {
        self.inner
            .lock()
            .collections
            .values()
            .any(|(watched, _)| watched == path)
    }

    pub fn watches_document(&self, path: &str) -> bool {
        self.inner
            .lock()
            .documents
            .values()
            .any(|(watched, _)| watched == path)
    }

    pub fn notify_collection(&self, path: &str, snapshot: &[Document]) {
        let state = self.inner.lock();
        for (watched, tx) in state.collections.values() {
            if watched == path {
                let _ = tx.send(snapshot.to_vec());
            }
        }
    }

    pub fn notify_document(&self, path: &str, snapshot: &Option<Document>) {
        let state = self.inner.lock();
        for (watched, tx) in state.documents.values() {
            if watched == path {
                let _ = tx.send(snapshot.clone());
            }
        }
    }

    /// Listeners currently registered on `path` (collection or document).
    pub fn active_listeners(&self, path: &str) -> usize {
        let state = self.inner.lock();
        state
            .collections
            .values()
            .filter(|(watched, _)| watched == path)
            .count()
            + state
                .documents
                .values()
                .filter(|(watched, _)| watched == path)
                .count()
    }

    pub fn total_listeners(&self) -> usize {
        let state = self.inner.lock();
        state.collections.len() + state.documents.len()
    }
}

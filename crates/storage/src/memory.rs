use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::{
    is_direct_child, parent_collection, CollectionSubscription, Document, DocumentStore,
    DocumentSubscription, FieldUpdate, ListenerRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Fields,
    Delete,
}

/// One attempted mutation, recorded whether or not it succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub path: String,
    pub kind: WriteKind,
    pub succeeded: bool,
}

#[derive(Default)]
struct FaultPlan {
    write_failures: Vec<(String, usize)>,
    read_failures: Vec<(String, usize)>,
}

impl FaultPlan {
    fn take(entries: &mut Vec<(String, usize)>, path: &str) -> bool {
        let Some(index) = entries
            .iter()
            .position(|(prefix, remaining)| *remaining > 0 && path.starts_with(prefix.as_str()))
        else {
            return false;
        };
        entries[index].1 -= 1;
        if entries[index].1 == 0 {
            entries.remove(index);
        }
        true
    }
}

#[derive(Default)]
struct MemoryState {
    documents: Mutex<BTreeMap<String, Map<String, Value>>>,
    listeners: ListenerRegistry,
    faults: Mutex<FaultPlan>,
    writes: Mutex<Vec<WriteRecord>>,
}

/// Process-local document store. Writes are applied and fanned out synchronously, so
/// listeners observe snapshots in write order.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<MemoryState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` writes to paths starting with `path_prefix` fail.
    pub fn fail_next_writes(&self, path_prefix: impl Into<String>, count: usize) {
        self.inner
            .faults
            .lock()
            .write_failures
            .push((path_prefix.into(), count));
    }

    /// The next `count` reads of paths starting with `path_prefix` fail.
    pub fn fail_next_reads(&self, path_prefix: impl Into<String>, count: usize) {
        self.inner
            .faults
            .lock()
            .read_failures
            .push((path_prefix.into(), count));
    }

    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.inner.writes.lock().clone()
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    pub fn document(&self, path: &str) -> Option<Map<String, Value>> {
        self.inner.documents.lock().get(path).cloned()
    }

    fn check_read(&self, path: &str) -> Result<()> {
        if FaultPlan::take(&mut self.inner.faults.lock().read_failures, path) {
            return Err(anyhow!("injected read failure for {path}"));
        }
        Ok(())
    }

    fn check_write(&self, path: &str, kind: WriteKind) -> Result<()> {
        let failed = FaultPlan::take(&mut self.inner.faults.lock().write_failures, path);
        self.inner.writes.lock().push(WriteRecord {
            path: path.to_string(),
            kind,
            succeeded: !failed,
        });
        if failed {
            return Err(anyhow!("injected write failure for {path}"));
        }
        Ok(())
    }

    fn collection_snapshot(documents: &BTreeMap<String, Map<String, Value>>, path: &str) -> Vec<Document> {
        let prefix = format!("{path}/");
        documents
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| is_direct_child(path, key))
            .map(|(key, fields)| Document::new(key.clone(), fields.clone()))
            .collect()
    }

    fn publish(&self, documents: &BTreeMap<String, Map<String, Value>>, path: &str) {
        let listeners = &self.inner.listeners;
        if listeners.watches_document(path) {
            let snapshot = documents
                .get(path)
                .map(|fields| Document::new(path, fields.clone()));
            listeners.notify_document(path, &snapshot);
        }
        if let Some(parent) = parent_collection(path) {
            if listeners.watches_collection(parent) {
                listeners.notify_collection(parent, &Self::collection_snapshot(documents, parent));
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_document(&self, path: &str) -> Result<Option<Document>> {
        self.check_read(path)?;
        Ok(self
            .inner
            .documents
            .lock()
            .get(path)
            .map(|fields| Document::new(path, fields.clone())))
    }

    async fn get_collection(&self, path: &str) -> Result<Vec<Document>> {
        self.check_read(path)?;
        Ok(Self::collection_snapshot(&self.inner.documents.lock(), path))
    }

    async fn subscribe_collection(&self, path: &str) -> Result<CollectionSubscription> {
        let documents = self.inner.documents.lock();
        let initial = Self::collection_snapshot(&documents, path);
        Ok(self.inner.listeners.register_collection(path, initial))
    }

    async fn subscribe_document(&self, path: &str) -> Result<DocumentSubscription> {
        let documents = self.inner.documents.lock();
        let initial = documents
            .get(path)
            .map(|fields| Document::new(path, fields.clone()));
        Ok(self.inner.listeners.register_document(path, initial))
    }

    async fn write_fields(&self, path: &str, update: FieldUpdate) -> Result<()> {
        self.check_write(path, WriteKind::Fields)?;
        let mut documents = self.inner.documents.lock();
        update.apply_to(documents.entry(path.to_string()).or_default());
        self.publish(&documents, path);
        Ok(())
    }

    async fn delete_document(&self, path: &str) -> Result<()> {
        self.check_write(path, WriteKind::Delete)?;
        let mut documents = self.inner.documents.lock();
        if documents.remove(path).is_some() {
            self.publish(&documents, path);
        }
        Ok(())
    }
}

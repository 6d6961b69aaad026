use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use shared::{domain::AttachmentRef, paths};
use tokio::sync::mpsc;

mod blob;
mod listeners;
mod memory;
mod sqlite;

pub use blob::{HttpBlobStore, MemoryBlobStore, MissingBlobStore};
pub use listeners::ListenerRegistry;
pub use memory::{MemoryDocumentStore, WriteKind, WriteRecord};
pub use sqlite::SqliteDocumentStore;

/// A document as delivered by the store: its full path, its id (last path segment),
/// and its untyped fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: String,
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(path: impl Into<String>, fields: Map<String, Value>) -> Self {
        let path = path.into();
        let id = paths::split_parent(&path)
            .map(|(_, id)| id.to_string())
            .unwrap_or_else(|| path.clone());
        Self { path, id, fields }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Set(Value),
    Delete,
}

/// Field-level write. Keys are dotted paths into the document (`messages.m1.content`);
/// missing intermediate objects are created on set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdate {
    entries: Vec<(String, FieldValue)>,
}

impl FieldUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.entries.push((field.into(), FieldValue::Set(value)));
        self
    }

    pub fn delete(mut self, field: impl Into<String>) -> Self {
        self.entries.push((field.into(), FieldValue::Delete));
        self
    }

    /// Sets every top-level key of `fields`.
    pub fn merge(fields: Map<String, Value>) -> Self {
        fields
            .into_iter()
            .fold(Self::new(), |update, (key, value)| update.set(key, value))
    }

    pub fn entries(&self) -> &[(String, FieldValue)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply_to(&self, fields: &mut Map<String, Value>) {
        for (path, value) in &self.entries {
            let segments: Vec<&str> = path.split('.').collect();
            match value {
                FieldValue::Set(value) => set_nested(fields, &segments, value.clone()),
                FieldValue::Delete => delete_nested(fields, &segments),
            }
        }
    }
}

fn set_nested(fields: &mut Map<String, Value>, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = fields;
    for segment in parents {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

fn delete_nested(fields: &mut Map<String, Value>, segments: &[&str]) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = fields;
    for segment in parents {
        let Some(Value::Object(next)) = current.get_mut(*segment) else {
            return;
        };
        current = next;
    }
    current.remove(*last);
}

/// Releases a store listener exactly once, either explicitly or on drop.
pub struct ListenerHandle {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Live stream of snapshots. The current snapshot is delivered first, then one per change.
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    handle: ListenerHandle,
}

impl<T> Subscription<T> {
    pub fn new(receiver: mpsc::UnboundedReceiver<T>, handle: ListenerHandle) -> Self {
        Self { receiver, handle }
    }

    pub async fn next(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<T>, ListenerHandle) {
        (self.receiver, self.handle)
    }
}

pub type CollectionSubscription = Subscription<Vec<Document>>;
pub type DocumentSubscription = Subscription<Option<Document>>;

/// Remote change source: point reads, field writes, and snapshot subscriptions over
/// `/`-separated document paths.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, path: &str) -> Result<Option<Document>>;
    async fn get_collection(&self, path: &str) -> Result<Vec<Document>>;
    async fn subscribe_collection(&self, path: &str) -> Result<CollectionSubscription>;
    async fn subscribe_document(&self, path: &str) -> Result<DocumentSubscription>;
    async fn write_fields(&self, path: &str, update: FieldUpdate) -> Result<()>;
    async fn delete_document(&self, path: &str) -> Result<()>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn delete_by_reference(&self, reference: &AttachmentRef) -> Result<()>;
}

pub(crate) fn parent_collection(path: &str) -> Option<&str> {
    paths::split_parent(path).map(|(parent, _)| parent)
}

pub(crate) fn is_direct_child(collection: &str, path: &str) -> bool {
    parent_collection(path) == Some(collection)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

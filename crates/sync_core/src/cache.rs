//! Per-conversation message cache rebuilt from store snapshots.
//!
//! Every snapshot produces a fresh immutable view. The view replaces the previous one,
//! and `ConversationChanged` is published, only when it differs structurally; the store
//! re-delivers unchanged snapshots often enough that forwarding them all would flood the UI.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use serde_json::{Map, Value};
use shared::{
    domain::{Conversation, MessageId},
    paths::{self, PRIVATE_MESSAGES_FIELD},
    protocol::Message,
};
use storage::Document;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::SyncEvent;

/// Undecoded message as found in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl From<Document> for RawMessage {
    fn from(document: Document) -> Self {
        Self {
            id: document.id,
            fields: document.fields,
        }
    }
}

pub fn raw_from_collection(documents: Vec<Document>) -> Vec<RawMessage> {
    documents.into_iter().map(RawMessage::from).collect()
}

/// Messages held in one owner's private chat document. An absent document is an empty chat.
/// Keys that cannot be addressed as a single field segment are skipped.
pub fn raw_from_private_chat(document: Option<Document>) -> Vec<RawMessage> {
    let Some(mut document) = document else {
        return Vec::new();
    };
    match document.fields.remove(PRIVATE_MESSAGES_FIELD) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(messages)) => messages
            .into_iter()
            .filter_map(|(id, value)| match value {
                _ if !paths::is_field_segment(&id) => {
                    warn!(path = %document.path, message_id = %id, "cache: skipping message id that is not a single field segment");
                    None
                }
                Value::Object(fields) => Some(RawMessage { id, fields }),
                _ => {
                    warn!(path = %document.path, message_id = %id, "cache: skipping non-object message entry");
                    None
                }
            })
            .collect(),
        Some(_) => {
            warn!(path = %document.path, "cache: messages field is not a map; treating chat as empty");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
    pub conversation: Conversation,
    pub messages: BTreeMap<MessageId, Message>,
}

impl ConversationView {
    pub fn empty(conversation: Conversation) -> Self {
        Self {
            conversation,
            messages: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Messages in display order: creation time, then id.
    pub fn ordered(&self) -> Vec<&Message> {
        let mut ordered: Vec<&Message> = self.messages.values().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        ordered
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Replies under one parent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    pub conversation: Conversation,
    pub parent_id: MessageId,
    pub replies: BTreeMap<MessageId, Message>,
}

impl ThreadView {
    pub fn empty(conversation: Conversation, parent_id: MessageId) -> Self {
        Self {
            conversation,
            parent_id,
            replies: BTreeMap::new(),
        }
    }

    pub fn ordered(&self) -> Vec<&Message> {
        let mut ordered: Vec<&Message> = self.replies.values().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        ordered
    }
}

type ThreadKey = (Conversation, MessageId);

pub struct MessageCache {
    conversations: RwLock<HashMap<Conversation, Arc<ConversationView>>>,
    threads: RwLock<HashMap<ThreadKey, Arc<ThreadView>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl MessageCache {
    pub fn new(events: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            threads: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Replaces the conversation's messages with `raw`. Returns whether anything changed;
    /// only then is `ConversationChanged` published.
    pub fn apply_snapshot(&self, conversation: &Conversation, raw: Vec<RawMessage>) -> bool {
        self.publish_snapshot(conversation, raw, None)
    }

    /// Like [`MessageCache::apply_snapshot`], but drops the snapshot once `live` is cleared.
    /// The flag is checked under the cache lock, so a snapshot racing a close either lands
    /// before the conversation is forgotten or not at all.
    pub fn apply_live_snapshot(
        &self,
        conversation: &Conversation,
        raw: Vec<RawMessage>,
        live: &AtomicBool,
    ) -> bool {
        self.publish_snapshot(conversation, raw, Some(live))
    }

    fn publish_snapshot(
        &self,
        conversation: &Conversation,
        raw: Vec<RawMessage>,
        live: Option<&AtomicBool>,
    ) -> bool {
        let view = ConversationView {
            conversation: conversation.clone(),
            messages: decode_messages(conversation, raw, None),
        };

        let mut conversations = self.conversations.write();
        if live.is_some_and(|live| !live.load(Ordering::Acquire)) {
            debug!(%conversation, "cache: snapshot for a closed conversation dropped");
            return false;
        }
        if conversations
            .get(conversation)
            .is_some_and(|previous| **previous == view)
        {
            debug!(%conversation, "cache: snapshot unchanged");
            return false;
        }
        let view = Arc::new(view);
        conversations.insert(conversation.clone(), Arc::clone(&view));
        debug!(%conversation, messages = view.len(), "cache: snapshot applied");
        let _ = self.events.send(SyncEvent::ConversationChanged {
            conversation: conversation.clone(),
            view,
        });
        true
    }

    /// Replaces the replies under `parent_id`. Returns whether anything changed.
    pub fn apply_thread_snapshot(
        &self,
        conversation: &Conversation,
        parent_id: &MessageId,
        raw: Vec<RawMessage>,
    ) -> bool {
        let view = ThreadView {
            conversation: conversation.clone(),
            parent_id: parent_id.clone(),
            replies: decode_messages(conversation, raw, Some(parent_id)),
        };
        let key = (conversation.clone(), parent_id.clone());
        let mut threads = self.threads.write();
        if threads.get(&key).is_some_and(|previous| **previous == view) {
            return false;
        }
        debug!(%conversation, parent_id = %parent_id, replies = view.replies.len(), "cache: thread snapshot applied");
        threads.insert(key, Arc::new(view));
        true
    }

    pub fn conversation(&self, conversation: &Conversation) -> Arc<ConversationView> {
        self.conversations
            .read()
            .get(conversation)
            .cloned()
            .unwrap_or_else(|| Arc::new(ConversationView::empty(conversation.clone())))
    }

    pub fn thread(&self, conversation: &Conversation, parent_id: &MessageId) -> Arc<ThreadView> {
        self.threads
            .read()
            .get(&(conversation.clone(), parent_id.clone()))
            .cloned()
            .unwrap_or_else(|| Arc::new(ThreadView::empty(conversation.clone(), parent_id.clone())))
    }

    pub fn has_thread(&self, conversation: &Conversation, parent_id: &MessageId) -> bool {
        self.threads
            .read()
            .contains_key(&(conversation.clone(), parent_id.clone()))
    }

    pub fn message(&self, conversation: &Conversation, id: &MessageId) -> Option<Message> {
        self.conversations
            .read()
            .get(conversation)
            .and_then(|view| view.get(id).cloned())
    }

    pub fn reply(
        &self,
        conversation: &Conversation,
        parent_id: &MessageId,
        id: &MessageId,
    ) -> Option<Message> {
        self.threads
            .read()
            .get(&(conversation.clone(), parent_id.clone()))
            .and_then(|view| view.replies.get(id).cloned())
    }

    /// Drops a conversation and all of its threads.
    pub fn forget(&self, conversation: &Conversation) {
        self.conversations.write().remove(conversation);
        self.threads
            .write()
            .retain(|(thread_conversation, _), _| thread_conversation != conversation);
    }
}

fn decode_messages(
    conversation: &Conversation,
    raw: Vec<RawMessage>,
    parent_id: Option<&MessageId>,
) -> BTreeMap<MessageId, Message> {
    let mut messages = BTreeMap::new();
    for RawMessage { id, fields } in raw {
        let id = MessageId::new(id);
        match Message::decode(id.clone(), conversation.clone(), &fields) {
            Ok(message) if message.author_id.as_str().is_empty() => {
                warn!(%conversation, message_id = %id, "cache: skipping message without an author");
            }
            Ok(mut message) => {
                if message.parent_message_id.is_none() {
                    message.parent_message_id = parent_id.cloned();
                }
                if messages.insert(id.clone(), message).is_some() {
                    debug!(%conversation, message_id = %id, "cache: duplicate message id in snapshot; keeping the later one");
                }
            }
            Err(err) => {
                warn!(%conversation, message_id = %id, %err, "cache: skipping malformed message");
            }
        }
    }
    messages
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;

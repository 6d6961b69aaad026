//! Message synchronization core: a de-duplicated cache of conversations fed by store
//! snapshots, a single live thread subscription, reaction aggregation, and dual-write
//! replication of private chats. `ChatSync` wires these together for one viewer.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde_json::{json, Map, Value};
use shared::{
    domain::{
        AttachmentRef, ChannelId, Conversation, MessageId, ParticipantsError, PrivateChatId,
        UserId,
    },
    error::{ApiError, ErrorCode},
    paths,
    protocol::{EditTransition, Message},
};
use storage::{BlobStore, DocumentStore, FieldUpdate};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

pub mod cache;
pub mod config;
mod listener;
pub mod reactions;
pub mod replicator;
pub mod thread;

pub use cache::{ConversationView, MessageCache, ThreadView};
pub use config::{load_settings, Settings};
pub use reactions::{EmptyReaction, ReactionPolicy};
pub use replicator::{
    PendingRepair, PrivateChatReplicator, PrivateMutation, ReplicaWrite, ReplicationError,
    ReplicationReport, RetryPolicy,
};
pub use thread::ThreadSubscriptionManager;

use cache::{raw_from_collection, raw_from_private_chat};
use listener::ListenerGuard;

/// Notifications for the presentation layer. Every payload is an immutable value.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ConversationChanged {
        conversation: Conversation,
        view: Arc<ConversationView>,
    },
    ActiveThreadChanged(Option<Arc<ThreadView>>),
    ReactionUpdated {
        conversation: Conversation,
        message: Message,
    },
    /// An edit did not reach the store; `message` is the state to restore.
    EditRolledBack { message: Message, reason: String },
    /// One private chat copy missed a write. The caller may retry with [`ChatSync::repair`].
    ReplicationDegraded {
        chat_id: PrivateChatId,
        message_id: MessageId,
        failed_owner: UserId,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{viewer} is not a participant of {chat_id}")]
    NotParticipant {
        viewer: UserId,
        chat_id: PrivateChatId,
    },
    #[error("message has neither content nor attachments")]
    EmptyMessage,
    #[error(transparent)]
    InvalidConversation(#[from] ParticipantsError),
    #[error("store operation failed: {0:#}")]
    Store(anyhow::Error),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

impl From<&SyncError> for ApiError {
    fn from(err: &SyncError) -> Self {
        let code = match err {
            SyncError::NotParticipant { .. }
            | SyncError::EmptyMessage
            | SyncError::InvalidConversation(_)
            | SyncError::Replication(ReplicationError::InvalidConversation(_)) => {
                ErrorCode::Validation
            }
            SyncError::Replication(
                ReplicationError::Partial { .. } | ReplicationError::RepairFailed { .. },
            ) => ErrorCode::PartialReplication,
            SyncError::Store(_) | SyncError::Replication(ReplicationError::Total { .. }) => {
                ErrorCode::Unavailable
            }
        };
        ApiError::new(code, err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The message is not in the local cache, or no copy in the store still holds it.
    MissingMessage,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Deleted,
    Skipped(SkipReason),
}

/// Addresses one message for edit, delete, and react.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageRef {
    Channel {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    Reply {
        channel_id: ChannelId,
        parent_id: MessageId,
        reply_id: MessageId,
    },
    Private {
        chat_id: PrivateChatId,
        message_id: MessageId,
    },
}

impl MessageRef {
    pub fn conversation(&self) -> Conversation {
        match self {
            MessageRef::Channel { channel_id, .. } | MessageRef::Reply { channel_id, .. } => {
                Conversation::Channel(channel_id.clone())
            }
            MessageRef::Private { chat_id, .. } => Conversation::Private(chat_id.clone()),
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            MessageRef::Channel { message_id, .. } | MessageRef::Private { message_id, .. } => {
                message_id
            }
            MessageRef::Reply { reply_id, .. } => reply_id,
        }
    }

    /// Document path for channel messages and replies; private messages live inside
    /// their owners' chat documents instead.
    fn document_path(&self) -> Option<String> {
        match self {
            MessageRef::Channel {
                channel_id,
                message_id,
            } => Some(paths::channel_message(channel_id, message_id)),
            MessageRef::Reply {
                channel_id,
                parent_id,
                reply_id,
            } => Some(paths::thread_reply(channel_id, parent_id, reply_id)),
            MessageRef::Private { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatSyncOptions {
    pub retry: RetryPolicy,
    pub empty_reactions: EmptyReaction,
    pub event_capacity: usize,
}

impl Default for ChatSyncOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ChatSyncOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            retry: settings.retry_policy(),
            empty_reactions: settings.empty_reactions(),
            event_capacity: settings.event_capacity.max(1),
        }
    }
}

/// Live subscription of one open conversation. `live` is cleared before the cached view
/// is forgotten so a snapshot already being delivered cannot bring it back.
struct OpenConversation {
    live: Arc<AtomicBool>,
    _listener: ListenerGuard,
}

impl OpenConversation {
    fn close(self) {
        self.live.store(false, Ordering::Release);
    }
}

pub struct ChatSync {
    viewer: UserId,
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<MessageCache>,
    threads: ThreadSubscriptionManager,
    replicator: PrivateChatReplicator,
    empty_reactions: EmptyReaction,
    open: Mutex<HashMap<Conversation, OpenConversation>>,
    events: broadcast::Sender<SyncEvent>,
}

impl ChatSync {
    pub fn new(
        viewer: UserId,
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        options: ChatSyncOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(options.event_capacity);
        let cache = Arc::new(MessageCache::new(events.clone()));
        Arc::new(Self {
            threads: ThreadSubscriptionManager::new(
                Arc::clone(&store),
                Arc::clone(&cache),
                events.clone(),
            ),
            replicator: PrivateChatReplicator::new(
                Arc::clone(&store),
                Arc::clone(&blobs),
                options.retry,
            ),
            viewer,
            store,
            blobs,
            cache,
            empty_reactions: options.empty_reactions,
            open: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn viewer(&self) -> &UserId {
        &self.viewer
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn conversation(&self, conversation: &Conversation) -> Arc<ConversationView> {
        self.cache.conversation(conversation)
    }

    /// Starts the live subscription for `conversation` and returns its first snapshot.
    /// Opening an already open conversation returns the cached view.
    pub async fn open_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Arc<ConversationView>, SyncError> {
        let mut open = self.open.lock().await;
        if open.contains_key(conversation) {
            return Ok(self.cache.conversation(conversation));
        }

        let live = Arc::new(AtomicBool::new(true));
        let listener = match conversation {
            Conversation::Channel(channel_id) => {
                let path = paths::channel_messages(channel_id);
                let mut subscription = self
                    .store
                    .subscribe_collection(&path)
                    .await
                    .map_err(SyncError::Store)?;
                if let Some(documents) = subscription.next().await {
                    self.cache
                        .apply_snapshot(conversation, raw_from_collection(documents));
                }
                ListenerGuard::spawn(subscription, {
                    let cache = Arc::clone(&self.cache);
                    let conversation = conversation.clone();
                    let live = Arc::clone(&live);
                    move |documents| {
                        cache.apply_live_snapshot(
                            &conversation,
                            raw_from_collection(documents),
                            &live,
                        );
                    }
                })
            }
            Conversation::Private(chat_id) => {
                self.ensure_participant(chat_id)?;
                let path = paths::private_chat(&self.viewer, chat_id);
                let mut subscription = self
                    .store
                    .subscribe_document(&path)
                    .await
                    .map_err(SyncError::Store)?;
                if let Some(document) = subscription.next().await {
                    self.cache
                        .apply_snapshot(conversation, raw_from_private_chat(document));
                }
                ListenerGuard::spawn(subscription, {
                    let cache = Arc::clone(&self.cache);
                    let conversation = conversation.clone();
                    let live = Arc::clone(&live);
                    move |document| {
                        cache.apply_live_snapshot(
                            &conversation,
                            raw_from_private_chat(document),
                            &live,
                        );
                    }
                })
            }
        };

        open.insert(
            conversation.clone(),
            OpenConversation {
                live,
                _listener: listener,
            },
        );
        info!(viewer = %self.viewer, %conversation, "sync: conversation opened");
        Ok(self.cache.conversation(conversation))
    }

    /// Releases the conversation's listener, its active thread, and its cached messages.
    pub async fn close_conversation(&self, conversation: &Conversation) -> bool {
        let Some(open) = self.open.lock().await.remove(conversation) else {
            return false;
        };
        open.close();
        if let Conversation::Channel(channel_id) = conversation {
            self.threads.deselect_if_in(channel_id).await;
        }
        self.cache.forget(conversation);
        info!(viewer = %self.viewer, %conversation, "sync: conversation closed");
        true
    }

    pub async fn send_message(
        &self,
        conversation: &Conversation,
        content: impl Into<String>,
        attachment_refs: Vec<AttachmentRef>,
    ) -> Result<Message, SyncError> {
        let content = content.into();
        if content.trim().is_empty() && attachment_refs.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let message = Message::new(
            conversation.clone(),
            self.viewer.clone(),
            content,
            attachment_refs,
        );

        match conversation {
            Conversation::Channel(channel_id) => {
                self.store
                    .write_fields(
                        &paths::channel_message(channel_id, &message.id),
                        FieldUpdate::merge(record_fields(&message)),
                    )
                    .await
                    .map_err(SyncError::Store)?;
            }
            Conversation::Private(chat_id) => {
                self.replicate(chat_id, &message.id, PrivateMutation::Create(message.clone()))
                    .await?;
            }
        }
        info!(%conversation, message_id = %message.id, "sync: message sent");
        Ok(message)
    }

    pub async fn send_reply(
        &self,
        channel_id: &ChannelId,
        parent_id: &MessageId,
        content: impl Into<String>,
        attachment_refs: Vec<AttachmentRef>,
    ) -> Result<Message, SyncError> {
        let content = content.into();
        if content.trim().is_empty() && attachment_refs.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let reply = Message::new(
            Conversation::Channel(channel_id.clone()),
            self.viewer.clone(),
            content,
            attachment_refs,
        )
        .reply_to(parent_id.clone());

        self.store
            .write_fields(
                &paths::thread_reply(channel_id, parent_id, &reply.id),
                FieldUpdate::merge(record_fields(&reply)),
            )
            .await
            .map_err(SyncError::Store)?;
        info!(channel_id = %channel_id, parent_id = %parent_id, reply_id = %reply.id, "sync: reply sent");
        Ok(reply)
    }

    /// Replaces a message's content. Clearing the content of a message without attachments
    /// deletes it. When the write does not land, `EditRolledBack` carries the original.
    pub async fn edit(&self, target: &MessageRef, content: &str) -> Result<WriteOutcome, SyncError> {
        let Some(original) = self.lookup(target) else {
            debug!(?target, "sync: edit of unknown message ignored");
            return Ok(WriteOutcome::Skipped(SkipReason::MissingMessage));
        };

        let content = match EditTransition::classify(&original, content) {
            EditTransition::Unchanged => return Ok(WriteOutcome::Skipped(SkipReason::Unchanged)),
            EditTransition::DeleteEmpty => {
                info!(message_id = %original.id, "sync: empty edit deletes the message");
                return self.delete_message(target, &original).await;
            }
            EditTransition::Update(content) => content,
        };

        let result = match (target, target.document_path()) {
            (MessageRef::Private { chat_id, message_id }, _) => self
                .replicate(chat_id, message_id, PrivateMutation::EditContent(content))
                .await
                .map(|report| written_or_missing(&report)),
            (_, Some(path)) => self
                .store
                .write_fields(&path, FieldUpdate::new().set("content", json!(content)))
                .await
                .map(|()| WriteOutcome::Applied)
                .map_err(SyncError::Store),
            (_, None) => Ok(WriteOutcome::Applied),
        };

        match result {
            Ok(outcome) => {
                if outcome != WriteOutcome::Applied {
                    debug!(message_id = %original.id, "sync: edited message is already gone from the store");
                }
                Ok(outcome)
            }
            Err(err) => {
                if !matches!(
                    err,
                    SyncError::Replication(ReplicationError::Partial { .. })
                ) {
                    warn!(message_id = %original.id, %err, "sync: edit failed; restoring original");
                    let _ = self.events.send(SyncEvent::EditRolledBack {
                        message: original,
                        reason: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    pub async fn delete(&self, target: &MessageRef) -> Result<WriteOutcome, SyncError> {
        let Some(original) = self.lookup(target) else {
            debug!(?target, "sync: delete of unknown message ignored");
            return Ok(WriteOutcome::Skipped(SkipReason::MissingMessage));
        };
        self.delete_message(target, &original).await
    }

    /// Applies the viewer's reaction. Channel messages and replies only ever add the
    /// viewer; private chats toggle it.
    pub async fn react(&self, target: &MessageRef, emoji: &str) -> Result<WriteOutcome, SyncError> {
        if emoji.is_empty() {
            debug!(?target, "sync: empty emoji ignored");
            return Ok(WriteOutcome::Skipped(SkipReason::Unchanged));
        }
        let Some(original) = self.lookup(target) else {
            debug!(?target, "sync: reaction on unknown message ignored");
            return Ok(WriteOutcome::Skipped(SkipReason::MissingMessage));
        };

        let policy = match target {
            MessageRef::Private { chat_id, .. } => {
                ReactionPolicy::private(chat_id, self.empty_reactions)?
            }
            _ => ReactionPolicy::AddOnce,
        };
        let next = reactions::apply(&original.reactions, emoji, &self.viewer, &policy);
        if next == original.reactions {
            return Ok(WriteOutcome::Skipped(SkipReason::Unchanged));
        }

        match (target, target.document_path()) {
            (MessageRef::Private { chat_id, message_id }, _) => {
                let report = self
                    .replicate(chat_id, message_id, PrivateMutation::SetReactions(next.clone()))
                    .await?;
                if report.replicas.is_empty() {
                    debug!(message_id = %message_id, "sync: reacted message is already gone from the store");
                    return Ok(WriteOutcome::Skipped(SkipReason::MissingMessage));
                }
            }
            (_, Some(path)) => {
                self.store
                    .write_fields(&path, FieldUpdate::new().set("reactions", json!(next)))
                    .await
                    .map_err(SyncError::Store)?;
            }
            (_, None) => {}
        }

        let message = Message {
            reactions: next,
            ..original
        };
        info!(message_id = %message.id, emoji, viewer = %self.viewer, "sync: reaction updated");
        let _ = self.events.send(SyncEvent::ReactionUpdated {
            conversation: target.conversation(),
            message,
        });
        Ok(WriteOutcome::Applied)
    }

    pub async fn select_thread(
        &self,
        channel_id: &ChannelId,
        parent_id: &MessageId,
    ) -> Result<bool, SyncError> {
        self.threads.select_message(channel_id, parent_id).await
    }

    pub async fn deselect_thread(&self) -> bool {
        self.threads.deselect().await
    }

    pub async fn active_thread(&self) -> Option<Arc<ThreadView>> {
        self.threads.current_thread().await
    }

    /// Re-applies an update that one private chat copy missed.
    pub async fn repair(&self, pending: PendingRepair) -> Result<ReplicaWrite, SyncError> {
        Ok(self.replicator.repair(pending).await?)
    }

    /// Releases every listener this instance holds.
    pub async fn shutdown(&self) {
        self.threads.deselect().await;
        let released: Vec<Conversation> = {
            let mut open = self.open.lock().await;
            open.drain()
                .map(|(conversation, open)| {
                    open.close();
                    conversation
                })
                .collect()
        };
        for conversation in &released {
            self.cache.forget(conversation);
        }
        info!(viewer = %self.viewer, released = released.len(), "sync: shut down");
    }

    fn lookup(&self, target: &MessageRef) -> Option<Message> {
        match target {
            MessageRef::Reply {
                channel_id,
                parent_id,
                reply_id,
            } => self
                .cache
                .reply(&Conversation::Channel(channel_id.clone()), parent_id, reply_id),
            _ => self
                .cache
                .message(&target.conversation(), target.message_id()),
        }
    }

    fn ensure_participant(&self, chat_id: &PrivateChatId) -> Result<(), SyncError> {
        let (first, second) = chat_id.participants()?;
        if first == self.viewer || second == self.viewer {
            Ok(())
        } else {
            Err(SyncError::NotParticipant {
                viewer: self.viewer.clone(),
                chat_id: chat_id.clone(),
            })
        }
    }

    async fn replicate(
        &self,
        chat_id: &PrivateChatId,
        message_id: &MessageId,
        mutation: PrivateMutation,
    ) -> Result<ReplicationReport, SyncError> {
        self.ensure_participant(chat_id)?;
        self.replicator
            .write(chat_id, message_id, mutation)
            .await
            .map_err(|err| {
                if let ReplicationError::Partial { owner, reason, .. } = &err {
                    let _ = self.events.send(SyncEvent::ReplicationDegraded {
                        chat_id: chat_id.clone(),
                        message_id: message_id.clone(),
                        failed_owner: owner.clone(),
                        reason: reason.clone(),
                    });
                }
                SyncError::Replication(err)
            })
    }

    async fn delete_message(
        &self,
        target: &MessageRef,
        original: &Message,
    ) -> Result<WriteOutcome, SyncError> {
        match (target, target.document_path()) {
            (MessageRef::Private { chat_id, message_id }, _) => {
                self.replicate(
                    chat_id,
                    message_id,
                    PrivateMutation::Delete {
                        attachment_refs: original.attachment_refs.clone(),
                    },
                )
                .await?;
            }
            (_, Some(path)) => {
                self.store
                    .delete_document(&path)
                    .await
                    .map_err(SyncError::Store)?;
                replicator::delete_attachments(self.blobs.as_ref(), &original.attachment_refs)
                    .await;
            }
            (_, None) => {}
        }
        info!(message_id = %original.id, conversation = %original.conversation, "sync: message deleted");
        Ok(WriteOutcome::Deleted)
    }
}

fn written_or_missing(report: &ReplicationReport) -> WriteOutcome {
    if report.replicas.is_empty() {
        WriteOutcome::Skipped(SkipReason::MissingMessage)
    } else {
        WriteOutcome::Applied
    }
}

fn record_fields(message: &Message) -> Map<String, Value> {
    match message.encode() {
        Value::Object(fields) => fields,
        _ => Map::new(),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

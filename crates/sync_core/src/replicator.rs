//! Dual-write replication of private chat messages.
//!
//! Each participant owns a full copy of the chat at `users/{owner}/privateChats/{chatId}`.
//! Every mutation is turned into one field-level update and applied to both copies
//! concurrently. There is no cross-document transaction: each side is retried on its own,
//! and a side that still fails is reported together with the exact update it is missing.
//!
//! Edits and reaction updates only touch fields inside an existing message, so each copy is
//! read first and left alone once it no longer holds the message. Writing a nested field
//! into an absent message would otherwise recreate it as a partial record.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use serde_json::{json, Value};
use shared::{
    domain::{AttachmentRef, MessageId, ParticipantsError, PrivateChatId, UserId},
    paths,
    protocol::{Message, Reaction},
};
use storage::{BlobStore, Document, DocumentStore, FieldUpdate};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RETRY_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per replica, including the first one.
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrivateMutation {
    Create(Message),
    EditContent(String),
    /// Removes the message; `attachment_refs` are deleted from the blob store afterwards.
    Delete { attachment_refs: Vec<AttachmentRef> },
    SetReactions(Vec<Reaction>),
}

impl PrivateMutation {
    /// The update applied verbatim to every owner copy.
    pub fn field_update(&self, message_id: &MessageId) -> FieldUpdate {
        let field = paths::private_message_field(message_id);
        match self {
            PrivateMutation::Create(message) => FieldUpdate::new().set(field, message.encode()),
            PrivateMutation::EditContent(content) => {
                FieldUpdate::new().set(format!("{field}.content"), json!(content))
            }
            PrivateMutation::Delete { .. } => FieldUpdate::new().delete(field),
            PrivateMutation::SetReactions(reactions) => {
                FieldUpdate::new().set(format!("{field}.reactions"), json!(reactions))
            }
        }
    }

    /// Whether the update only makes sense on a copy that still holds the message.
    pub fn requires_existing(&self) -> bool {
        matches!(
            self,
            PrivateMutation::EditContent(_) | PrivateMutation::SetReactions(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PrivateMutation::Create(_) => "create",
            PrivateMutation::EditContent(_) => "edit",
            PrivateMutation::Delete { .. } => "delete",
            PrivateMutation::SetReactions(_) => "reactions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaWrite {
    pub owner: UserId,
    pub path: String,
    /// Zero when the copy no longer held the message and nothing was written.
    pub attempts: usize,
}

/// Successful sides of one replicated write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationReport {
    pub chat_id: PrivateChatId,
    pub message_id: MessageId,
    pub replicas: Vec<ReplicaWrite>,
    /// Owners whose copy no longer holds the message; nothing was written there.
    pub missing: Vec<UserId>,
    /// Attachments whose blob delete failed. Never fatal.
    pub blob_failures: Vec<AttachmentRef>,
}

/// The update a lagging owner copy still needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRepair {
    pub chat_id: PrivateChatId,
    pub message_id: MessageId,
    pub owner: UserId,
    pub path: String,
    pub update: FieldUpdate,
    pub requires_existing: bool,
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("invalid private chat: {0}")]
    InvalidConversation(#[from] ParticipantsError),
    #[error("copy owned by {owner} was not updated after {attempts} attempts: {reason}")]
    Partial {
        owner: UserId,
        attempts: usize,
        reason: String,
        report: ReplicationReport,
        repair: PendingRepair,
    },
    #[error("no copy of {chat_id} was updated for message {message_id}: {reason}")]
    Total {
        chat_id: PrivateChatId,
        message_id: MessageId,
        reason: String,
    },
    #[error("repair of the copy owned by {owner} failed: {reason}")]
    RepairFailed {
        owner: UserId,
        reason: String,
        repair: PendingRepair,
    },
}

impl ReplicationError {
    pub fn pending_repair(&self) -> Option<&PendingRepair> {
        match self {
            ReplicationError::Partial { repair, .. }
            | ReplicationError::RepairFailed { repair, .. } => Some(repair),
            _ => None,
        }
    }
}

pub struct PrivateChatReplicator {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    retry: RetryPolicy,
}

impl PrivateChatReplicator {
    pub fn new(store: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            blobs,
            retry,
        }
    }

    /// Applies `mutation` to every owner copy of `chat_id`.
    ///
    /// Both sides are written concurrently. `Partial` means one copy is up to date and the
    /// other is not; `Total` means neither changed. Blob deletes for `Delete` run once at
    /// least one copy no longer holds the message.
    pub async fn write(
        &self,
        chat_id: &PrivateChatId,
        message_id: &MessageId,
        mutation: PrivateMutation,
    ) -> Result<ReplicationReport, ReplicationError> {
        let owners = chat_id.owners()?;
        let update = mutation.field_update(message_id);
        let guard = mutation.requires_existing().then_some(message_id);

        let results = join_all(owners.into_iter().map(|owner| {
            let path = paths::private_chat(&owner, chat_id);
            let update = &update;
            async move {
                let outcome = self.write_with_retry(&path, update, guard).await;
                (owner, path, outcome)
            }
        }))
        .await;

        let mut replicas = Vec::new();
        let mut missing = Vec::new();
        let mut failures = Vec::new();
        for (owner, path, outcome) in results {
            match outcome {
                Ok(Some(attempts)) => replicas.push(ReplicaWrite {
                    owner,
                    path,
                    attempts,
                }),
                Ok(None) => missing.push(owner),
                Err((attempts, err)) => failures.push((owner, path, attempts, err)),
            }
        }

        if replicas.is_empty() && failures.is_empty() {
            debug!(
                chat_id = %chat_id,
                message_id = %message_id,
                mutation = mutation.kind(),
                "replicator: message is gone from every copy; nothing written"
            );
            return Ok(ReplicationReport {
                chat_id: chat_id.clone(),
                message_id: message_id.clone(),
                replicas,
                missing,
                blob_failures: Vec::new(),
            });
        }

        if replicas.is_empty() {
            let reason = failures
                .first()
                .map(|(_, _, _, err)| format!("{err:#}"))
                .unwrap_or_default();
            error!(
                chat_id = %chat_id,
                message_id = %message_id,
                mutation = mutation.kind(),
                %reason,
                "replicator: every copy failed"
            );
            return Err(ReplicationError::Total {
                chat_id: chat_id.clone(),
                message_id: message_id.clone(),
                reason,
            });
        }

        let mut report = ReplicationReport {
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
            replicas,
            missing,
            blob_failures: Vec::new(),
        };
        if let PrivateMutation::Delete { attachment_refs } = &mutation {
            report.blob_failures = delete_attachments(self.blobs.as_ref(), attachment_refs).await;
        }

        if let Some((owner, path, attempts, err)) = failures.into_iter().next() {
            let reason = format!("{err:#}");
            warn!(
                chat_id = %chat_id,
                message_id = %message_id,
                owner = %owner,
                attempts,
                mutation = mutation.kind(),
                %reason,
                "replicator: copy left behind; repair pending"
            );
            return Err(ReplicationError::Partial {
                repair: PendingRepair {
                    chat_id: chat_id.clone(),
                    message_id: message_id.clone(),
                    owner: owner.clone(),
                    path,
                    update,
                    requires_existing: guard.is_some(),
                },
                owner,
                attempts,
                reason,
                report,
            });
        }

        info!(
            chat_id = %chat_id,
            message_id = %message_id,
            mutation = mutation.kind(),
            replicas = report.replicas.len(),
            "replicator: write applied"
        );
        Ok(report)
    }

    /// Re-applies a pending update to the copy that missed it. An edit whose message has
    /// since disappeared from that copy is dropped.
    pub async fn repair(&self, repair: PendingRepair) -> Result<ReplicaWrite, ReplicationError> {
        let guard = repair.requires_existing.then_some(&repair.message_id);
        match self
            .write_with_retry(&repair.path, &repair.update, guard)
            .await
        {
            Ok(None) => {
                debug!(
                    chat_id = %repair.chat_id,
                    message_id = %repair.message_id,
                    owner = %repair.owner,
                    "replicator: message already gone from the lagging copy"
                );
                Ok(ReplicaWrite {
                    owner: repair.owner,
                    path: repair.path,
                    attempts: 0,
                })
            }
            Ok(Some(attempts)) => {
                info!(
                    chat_id = %repair.chat_id,
                    message_id = %repair.message_id,
                    owner = %repair.owner,
                    attempts,
                    "replicator: copy repaired"
                );
                Ok(ReplicaWrite {
                    owner: repair.owner,
                    path: repair.path,
                    attempts,
                })
            }
            Err((attempts, err)) => {
                let reason = format!("{err:#}");
                error!(
                    chat_id = %repair.chat_id,
                    owner = %repair.owner,
                    attempts,
                    %reason,
                    "replicator: repair failed"
                );
                Err(ReplicationError::RepairFailed {
                    owner: repair.owner.clone(),
                    reason,
                    repair,
                })
            }
        }
    }

    /// Returns the attempts used, or `None` when `existing` is set and the copy no longer
    /// holds that message.
    async fn write_with_retry(
        &self,
        path: &str,
        update: &FieldUpdate,
        existing: Option<&MessageId>,
    ) -> Result<Option<usize>, (usize, anyhow::Error)> {
        let max_attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write_once(path, update, existing).await {
                Ok(true) => return Ok(Some(attempt)),
                Ok(false) => return Ok(None),
                Err(err) if attempt < max_attempts => {
                    warn!(path, attempt, max_attempts, %err, "replicator: write failed; retrying");
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(err) => return Err((attempt, err)),
            }
        }
    }

    async fn write_once(
        &self,
        path: &str,
        update: &FieldUpdate,
        existing: Option<&MessageId>,
    ) -> anyhow::Result<bool> {
        if let Some(message_id) = existing {
            let document = self.store.get_document(path).await?;
            if !holds_message(document.as_ref(), message_id) {
                return Ok(false);
            }
        }
        self.store.write_fields(path, update.clone()).await?;
        Ok(true)
    }
}

fn holds_message(document: Option<&Document>, message_id: &MessageId) -> bool {
    document
        .and_then(|document| document.fields.get(paths::PRIVATE_MESSAGES_FIELD))
        .and_then(|messages| messages.get(message_id.as_str()))
        .is_some_and(Value::is_object)
}

/// Best-effort blob cleanup. Returns the references whose delete failed.
pub(crate) async fn delete_attachments(
    blobs: &dyn BlobStore,
    references: &[AttachmentRef],
) -> Vec<AttachmentRef> {
    let results = join_all(references.iter().map(|reference| async move {
        (reference, blobs.delete_by_reference(reference).await)
    }))
    .await;

    results
        .into_iter()
        .filter_map(|(reference, result)| match result {
            Ok(()) => None,
            Err(err) => {
                warn!(reference = %reference, %err, "blob delete failed");
                Some(reference.clone())
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/replicator_tests.rs"]
mod tests;

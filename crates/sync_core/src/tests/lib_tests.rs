use super::*;
use std::time::Duration;

use storage::{MemoryBlobStore, MemoryDocumentStore, WriteKind};

fn options() -> ChatSyncOptions {
    ChatSyncOptions {
        retry: RetryPolicy {
            attempts: 3,
            delay: Duration::ZERO,
        },
        empty_reactions: EmptyReaction::Remove,
        event_capacity: 64,
    }
}

fn sync_for(user: &str, store: &MemoryDocumentStore, blobs: &MemoryBlobStore) -> Arc<ChatSync> {
    ChatSync::new(
        UserId::new(user),
        Arc::new(store.clone()),
        Arc::new(blobs.clone()),
        options(),
    )
}

fn general() -> ChannelId {
    ChannelId::new("general")
}

fn channel_ref(id: &str) -> MessageRef {
    MessageRef::Channel {
        channel_id: general(),
        message_id: MessageId::new(id),
    }
}

fn chat() -> PrivateChatId {
    PrivateChatId::for_participants(&UserId::new("u1"), &UserId::new("u2")).expect("chat id")
}

fn private_ref(id: &str) -> MessageRef {
    MessageRef::Private {
        chat_id: chat(),
        message_id: MessageId::new(id),
    }
}

async fn seed_channel_message(store: &MemoryDocumentStore, id: &str, fields: Value) {
    let fields = fields.as_object().cloned().expect("object");
    store
        .write_fields(
            &paths::channel_message(&general(), &MessageId::new(id)),
            FieldUpdate::merge(fields),
        )
        .await
        .expect("seed channel message");
}

async fn seed_private_message(store: &MemoryDocumentStore, id: &str, record: Value) {
    for owner in ["u1", "u2"] {
        store
            .write_fields(
                &paths::private_chat(&UserId::new(owner), &chat()),
                FieldUpdate::new().set(
                    paths::private_message_field(&MessageId::new(id)),
                    record.clone(),
                ),
            )
            .await
            .expect("seed private message");
    }
}

fn stored_private(store: &MemoryDocumentStore, owner: &str, id: &str) -> Option<Value> {
    let document = store.document(&paths::private_chat(&UserId::new(owner), &chat()))?;
    document.get("messages")?.get(id).cloned()
}

async fn wait_for_view(
    events: &mut broadcast::Receiver<SyncEvent>,
    predicate: impl Fn(&ConversationView) -> bool,
) -> Arc<ConversationView> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::ConversationChanged { view, .. }) if predicate(&view) => return view,
                Ok(_) => continue,
                Err(err) => panic!("event stream failed: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for conversation event")
}

#[tokio::test]
async fn open_conversation_returns_the_first_snapshot() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    seed_channel_message(&store, "m1", json!({ "author_id": "u2", "content": "hi" })).await;

    let sync = sync_for("u1", &store, &blobs);
    let view = sync
        .open_conversation(&Conversation::Channel(general()))
        .await
        .expect("open");
    assert_eq!(view.len(), 1);
    assert_eq!(
        store
            .listeners()
            .active_listeners(&paths::channel_messages(&general())),
        1
    );

    let again = sync
        .open_conversation(&Conversation::Channel(general()))
        .await
        .expect("reopen");
    assert_eq!(again.len(), 1);
    assert_eq!(store.listeners().total_listeners(), 1);
}

#[tokio::test]
async fn sent_messages_echo_back_through_the_cache() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    let sync = sync_for("u1", &store, &blobs);
    let conversation = Conversation::Channel(general());
    sync.open_conversation(&conversation).await.expect("open");
    let mut events = sync.subscribe_events();

    let sent = sync
        .send_message(&conversation, "hello", Vec::new())
        .await
        .expect("send");
    let view = wait_for_view(&mut events, |view| view.get(&sent.id).is_some()).await;
    assert_eq!(view.get(&sent.id).expect("echo").content, "hello");
}

#[tokio::test]
async fn empty_messages_are_rejected() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    let sync = sync_for("u1", &store, &blobs);
    let err = sync
        .send_message(&Conversation::Channel(general()), "   ", Vec::new())
        .await
        .expect_err("empty");
    assert!(matches!(err, SyncError::EmptyMessage));
    assert!(store.write_log().is_empty());
}

#[tokio::test]
async fn clearing_content_without_attachments_deletes_the_message() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    seed_channel_message(&store, "m1", json!({ "author_id": "u1", "content": "hi" })).await;
    let sync = sync_for("u1", &store, &blobs);
    sync.open_conversation(&Conversation::Channel(general()))
        .await
        .expect("open");

    let outcome = sync.edit(&channel_ref("m1"), "  ").await.expect("edit");
    assert_eq!(outcome, WriteOutcome::Deleted);

    let last = store.write_log().pop().expect("write recorded");
    assert_eq!(last.kind, WriteKind::Delete);
    assert_eq!(last.path, paths::channel_message(&general(), &MessageId::new("m1")));
    assert!(store
        .document(&paths::channel_message(&general(), &MessageId::new("m1")))
        .is_none());
}

#[tokio::test]
async fn clearing_content_keeps_messages_with_attachments() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    seed_channel_message(
        &store,
        "m1",
        json!({ "author_id": "u1", "content": "look", "attachment_refs": ["a1"] }),
    )
    .await;
    let sync = sync_for("u1", &store, &blobs);
    sync.open_conversation(&Conversation::Channel(general()))
        .await
        .expect("open");

    let outcome = sync.edit(&channel_ref("m1"), "").await.expect("edit");
    assert_eq!(outcome, WriteOutcome::Applied);
    let stored = store
        .document(&paths::channel_message(&general(), &MessageId::new("m1")))
        .expect("still stored");
    assert_eq!(stored["content"], "");
}

#[tokio::test]
async fn edits_of_unknown_or_unchanged_messages_are_skipped() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    seed_channel_message(&store, "m1", json!({ "author_id": "u1", "content": "hi" })).await;
    let sync = sync_for("u1", &store, &blobs);
    sync.open_conversation(&Conversation::Channel(general()))
        .await
        .expect("open");
    let writes_before = store.write_log().len();

    assert_eq!(
        sync.edit(&channel_ref("nope"), "x").await.expect("edit"),
        WriteOutcome::Skipped(SkipReason::MissingMessage)
    );
    assert_eq!(
        sync.edit(&channel_ref("m1"), "hi").await.expect("edit"),
        WriteOutcome::Skipped(SkipReason::Unchanged)
    );
    assert_eq!(
        sync.delete(&channel_ref("nope")).await.expect("delete"),
        WriteOutcome::Skipped(SkipReason::MissingMessage)
    );
    assert_eq!(store.write_log().len(), writes_before);
}

#[tokio::test]
async fn failed_edit_rolls_back_to_the_original() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    seed_channel_message(&store, "m1", json!({ "author_id": "u1", "content": "hi" })).await;
    let sync = sync_for("u1", &store, &blobs);
    sync.open_conversation(&Conversation::Channel(general()))
        .await
        .expect("open");
    let mut events = sync.subscribe_events();

    store.fail_next_writes(paths::channel_message(&general(), &MessageId::new("m1")), 1);
    let err = sync
        .edit(&channel_ref("m1"), "changed")
        .await
        .expect_err("write fails");
    assert!(matches!(err, SyncError::Store(_)));
    assert_eq!(ApiError::from(&err).code, ErrorCode::Unavailable);

    let restored = std::iter::from_fn(|| events.try_recv().ok())
        .find_map(|event| match event {
            SyncEvent::EditRolledBack { message, .. } => Some(message),
            _ => None,
        })
        .expect("rollback event");
    assert_eq!(restored.content, "hi");
    assert_eq!(
        sync.conversation(&Conversation::Channel(general()))
            .get(&MessageId::new("m1"))
            .expect("cached")
            .content,
        "hi"
    );
}

#[tokio::test]
async fn channel_reactions_only_ever_add_the_viewer() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    seed_channel_message(&store, "m1", json!({ "author_id": "u2", "content": "hi" })).await;
    let sync = sync_for("u1", &store, &blobs);
    sync.open_conversation(&Conversation::Channel(general()))
        .await
        .expect("open");
    let mut events = sync.subscribe_events();

    assert_eq!(
        sync.react(&channel_ref("m1"), "👍").await.expect("react"),
        WriteOutcome::Applied
    );
    wait_for_view(&mut events, |view| {
        view.get(&MessageId::new("m1"))
            .is_some_and(|message| !message.reactions.is_empty())
    })
    .await;

    assert_eq!(
        sync.react(&channel_ref("m1"), "👍").await.expect("react again"),
        WriteOutcome::Skipped(SkipReason::Unchanged)
    );
    let stored = store
        .document(&paths::channel_message(&general(), &MessageId::new("m1")))
        .expect("stored");
    assert_eq!(
        stored["reactions"],
        json!([{ "emoji": "👍", "actor_ids": ["u1"], "count": 1 }])
    );
}

#[tokio::test]
async fn private_reactions_from_both_participants_count_two() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    seed_private_message(
        &store,
        "m1",
        json!({ "author_id": "u1", "content": "hi", "created_at": "2024-05-01T10:00:00Z" }),
    )
    .await;
    let conversation = Conversation::Private(chat());

    let u2 = sync_for("u2", &store, &blobs);
    u2.open_conversation(&conversation).await.expect("u2 open");
    let mut u2_events = u2.subscribe_events();
    assert_eq!(
        u2.react(&private_ref("m1"), "👍").await.expect("u2 react"),
        WriteOutcome::Applied
    );
    let updated = std::iter::from_fn(|| u2_events.try_recv().ok())
        .find_map(|event| match event {
            SyncEvent::ReactionUpdated { message, .. } => Some(message),
            _ => None,
        })
        .expect("reaction event");
    assert_eq!(updated.reactions[0].actor_ids, vec![UserId::new("u2")]);
    assert_eq!(updated.reactions[0].count, 1);
    for owner in ["u1", "u2"] {
        assert_eq!(
            stored_private(&store, owner, "m1").expect("copy")["reactions"],
            json!([{ "emoji": "👍", "actor_ids": ["u2"], "count": 1 }])
        );
    }

    let u1 = sync_for("u1", &store, &blobs);
    u1.open_conversation(&conversation).await.expect("u1 open");
    u1.react(&private_ref("m1"), "👍").await.expect("u1 react");
    for owner in ["u1", "u2"] {
        assert_eq!(
            stored_private(&store, owner, "m1").expect("copy")["reactions"],
            json!([{ "emoji": "👍", "actor_ids": ["u2", "u1"], "count": 2 }])
        );
    }
}

#[tokio::test]
async fn private_delete_reports_a_lagging_copy_and_repairs_it() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    seed_private_message(
        &store,
        "m1",
        json!({ "author_id": "u1", "content": "files", "attachment_refs": ["a1", "a2"] }),
    )
    .await;
    let sync = sync_for("u1", &store, &blobs);
    sync.open_conversation(&Conversation::Private(chat()))
        .await
        .expect("open");
    let mut events = sync.subscribe_events();

    store.fail_next_writes("users/u2/", 3);
    let err = sync.delete(&private_ref("m1")).await.expect_err("u2 lags");
    assert_eq!(ApiError::from(&err).code, ErrorCode::PartialReplication);

    assert!(stored_private(&store, "u1", "m1").is_none());
    assert!(stored_private(&store, "u2", "m1").is_some());
    assert_eq!(blobs.delete_requests().len(), 2);

    let mut degraded = None;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::ReplicationDegraded { failed_owner, .. } = event {
            degraded = Some(failed_owner);
        }
    }
    assert_eq!(degraded, Some(UserId::new("u2")));

    let SyncError::Replication(replication) = err else {
        panic!("expected a replication error");
    };
    let pending = replication.pending_repair().cloned().expect("repair");
    sync.repair(pending).await.expect("repair applied");
    assert!(stored_private(&store, "u2", "m1").is_none());
}

#[tokio::test]
async fn stale_edit_after_a_peer_delete_does_not_resurrect_the_message() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    seed_private_message(
        &store,
        "m1",
        json!({ "author_id": "u2", "content": "hi", "created_at": "2024-05-01T10:00:00Z" }),
    )
    .await;
    let conversation = Conversation::Private(chat());
    let u1 = sync_for("u1", &store, &blobs);
    let u2 = sync_for("u2", &store, &blobs);
    u1.open_conversation(&conversation).await.expect("u1 open");
    u2.open_conversation(&conversation).await.expect("u2 open");

    assert_eq!(
        u1.delete(&private_ref("m1")).await.expect("delete"),
        WriteOutcome::Deleted
    );
    let writes_after_delete = store.write_log().len();

    assert_eq!(
        u2.edit(&private_ref("m1"), "edited").await.expect("stale edit"),
        WriteOutcome::Skipped(SkipReason::MissingMessage)
    );
    assert_eq!(
        u2.react(&private_ref("m1"), "👍").await.expect("stale react"),
        WriteOutcome::Skipped(SkipReason::MissingMessage)
    );
    assert_eq!(store.write_log().len(), writes_after_delete);
    for owner in ["u1", "u2"] {
        assert!(stored_private(&store, owner, "m1").is_none(), "{owner} copy resurrected");
    }
}

#[tokio::test]
async fn partial_records_left_by_a_late_field_write_stay_hidden() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    let conversation = Conversation::Private(chat());
    let u1 = sync_for("u1", &store, &blobs);
    u1.open_conversation(&conversation).await.expect("open");
    let mut events = u1.subscribe_events();

    store
        .write_fields(
            &paths::private_chat(&UserId::new("u1"), &chat()),
            FieldUpdate::new().set("messages.m1.content", json!("edited")),
        )
        .await
        .expect("late field write");
    let sent = u1
        .send_message(&conversation, "after", Vec::new())
        .await
        .expect("send");

    let view = wait_for_view(&mut events, |view| view.get(&sent.id).is_some()).await;
    assert!(view.get(&MessageId::new("m1")).is_none());
    assert_eq!(view.len(), 1);
}

#[tokio::test]
async fn private_chats_require_the_viewer_to_participate() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    let outsider = sync_for("u3", &store, &blobs);

    let err = outsider
        .open_conversation(&Conversation::Private(chat()))
        .await
        .expect_err("not a participant");
    assert!(matches!(err, SyncError::NotParticipant { .. }));

    let err = outsider
        .send_message(&Conversation::Private(chat()), "hi", Vec::new())
        .await
        .expect_err("not a participant");
    assert_eq!(ApiError::from(&err).code, ErrorCode::Validation);
    assert!(store.write_log().is_empty());
}

#[tokio::test]
async fn private_messages_land_in_both_copies() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    let sync = sync_for("u2", &store, &blobs);
    let sent = sync
        .send_message(&Conversation::Private(chat()), "hey", Vec::new())
        .await
        .expect("send");

    let first = stored_private(&store, "u1", sent.id.as_str()).expect("u1 copy");
    let second = stored_private(&store, "u2", sent.id.as_str()).expect("u2 copy");
    assert_eq!(first, second);
    assert_eq!(first["author_id"], "u2");
}

#[tokio::test]
async fn deleting_a_channel_message_cleans_up_attachments() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    blobs.fail_on(AttachmentRef::new("a2"));
    seed_channel_message(
        &store,
        "m1",
        json!({ "author_id": "u1", "content": "pics", "attachment_refs": ["a1", "a2"] }),
    )
    .await;
    let sync = sync_for("u1", &store, &blobs);
    sync.open_conversation(&Conversation::Channel(general()))
        .await
        .expect("open");

    let outcome = sync.delete(&channel_ref("m1")).await.expect("delete");
    assert_eq!(outcome, WriteOutcome::Deleted);
    assert_eq!(
        blobs.delete_requests(),
        vec![AttachmentRef::new("a1"), AttachmentRef::new("a2")]
    );
}

#[tokio::test]
async fn closing_a_channel_releases_its_thread() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    let sync = sync_for("u1", &store, &blobs);
    let conversation = Conversation::Channel(general());
    sync.open_conversation(&conversation).await.expect("open");

    sync.select_thread(&general(), &MessageId::new("m1"))
        .await
        .expect("select m1");
    sync.select_thread(&general(), &MessageId::new("m2"))
        .await
        .expect("select m2");
    let listeners = store.listeners();
    assert_eq!(
        listeners.active_listeners(&paths::thread_replies(&general(), &MessageId::new("m1"))),
        0
    );
    assert_eq!(
        listeners.active_listeners(&paths::thread_replies(&general(), &MessageId::new("m2"))),
        1
    );
    assert_eq!(listeners.total_listeners(), 2);

    assert!(sync.close_conversation(&conversation).await);
    assert!(!sync.close_conversation(&conversation).await);
    assert!(sync.active_thread().await.is_none());
    assert_eq!(listeners.total_listeners(), 0);
}

#[tokio::test]
async fn replies_are_written_under_their_parent() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    let sync = sync_for("u1", &store, &blobs);
    sync.select_thread(&general(), &MessageId::new("m1"))
        .await
        .expect("select");
    let mut events = sync.subscribe_events();

    let reply = sync
        .send_reply(&general(), &MessageId::new("m1"), "agreed", Vec::new())
        .await
        .expect("reply");
    assert!(store
        .document(&paths::thread_reply(&general(), &MessageId::new("m1"), &reply.id))
        .is_some());

    let view = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(SyncEvent::ActiveThreadChanged(Some(view))) = events.recv().await {
                if view.replies.contains_key(&reply.id) {
                    return view;
                }
            }
        }
    })
    .await
    .expect("thread update");
    assert_eq!(
        view.replies[&reply.id].parent_message_id,
        Some(MessageId::new("m1"))
    );

    let reply_ref = MessageRef::Reply {
        channel_id: general(),
        parent_id: MessageId::new("m1"),
        reply_id: reply.id.clone(),
    };
    assert_eq!(
        sync.react(&reply_ref, "🎉").await.expect("react"),
        WriteOutcome::Applied
    );
}

#[tokio::test]
async fn shutdown_releases_every_listener() {
    let store = MemoryDocumentStore::new();
    let blobs = MemoryBlobStore::new();
    let sync = sync_for("u1", &store, &blobs);
    sync.open_conversation(&Conversation::Channel(general()))
        .await
        .expect("open channel");
    sync.open_conversation(&Conversation::Private(chat()))
        .await
        .expect("open chat");
    sync.select_thread(&general(), &MessageId::new("m1"))
        .await
        .expect("select");
    assert_eq!(store.listeners().total_listeners(), 3);

    sync.shutdown().await;
    assert_eq!(store.listeners().total_listeners(), 0);
}

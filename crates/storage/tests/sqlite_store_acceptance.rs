use serde_json::json;
use storage::{DocumentStore, FieldUpdate, SqliteDocumentStore};

async fn open_store(dir: &tempfile::TempDir) -> SqliteDocumentStore {
    let db_path = dir.path().join("nested").join("documents.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));
    SqliteDocumentStore::new(&database_url).await.expect("db")
}

#[tokio::test]
async fn writes_merge_fields_and_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    store.health_check().await.expect("health check");

    let path = "users/u1/privateChats/u1_u2";
    store
        .write_fields(
            path,
            FieldUpdate::new().set("messages.m1", json!({ "content": "hi", "author_id": "u1" })),
        )
        .await
        .expect("create");
    store
        .write_fields(path, FieldUpdate::new().set("messages.m1.content", json!("edited")))
        .await
        .expect("edit");
    drop(store);

    let reopened = open_store(&dir).await;
    let document = reopened
        .get_document(path)
        .await
        .expect("read")
        .expect("document exists");
    assert_eq!(document.id, "u1_u2");
    assert_eq!(document.fields["messages"]["m1"]["content"], json!("edited"));
    assert_eq!(document.fields["messages"]["m1"]["author_id"], json!("u1"));
}

#[tokio::test]
async fn collection_listeners_follow_writes_and_deletes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;

    let mut subscription = store
        .subscribe_collection("channels/general/messages")
        .await
        .expect("subscribe");
    assert!(subscription.next().await.expect("initial").is_empty());

    store
        .write_fields(
            "channels/general/messages/m1",
            FieldUpdate::new().set("content", json!("hello")),
        )
        .await
        .expect("write");
    let snapshot = subscription.next().await.expect("after write");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].fields["content"], json!("hello"));

    store
        .delete_document("channels/general/messages/m1")
        .await
        .expect("delete");
    assert!(subscription.next().await.expect("after delete").is_empty());

    drop(subscription);
    assert_eq!(store.listeners().total_listeners(), 0);
}

#[tokio::test]
async fn absent_documents_read_as_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    assert!(store
        .get_document("users/u9/privateChats/u1_u9")
        .await
        .expect("read")
        .is_none());
    store
        .delete_document("users/u9/privateChats/u1_u9")
        .await
        .expect("deleting a missing document is fine");
}

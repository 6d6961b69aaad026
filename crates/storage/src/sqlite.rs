use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    parent_collection, CollectionSubscription, Document, DocumentStore, DocumentSubscription,
    FieldUpdate, ListenerRegistry,
};

/// Durable document store on SQLite. Listeners are process-local: only writes made
/// through this handle (or its clones) are fanned out.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: Pool<Sqlite>,
    listeners: ListenerRegistry,
    write_lock: std::sync::Arc<Mutex<()>>,
}

impl SqliteDocumentStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            listeners: ListenerRegistry::new(),
            write_lock: std::sync::Arc::new(Mutex::new(())),
        })
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn load(&self, path: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT body FROM documents WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read document {path}"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let body: String = row.try_get("body")?;
        Ok(Some(Document::new(path, decode_body(path, &body))))
    }

    async fn load_collection(&self, path: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT path, body FROM documents WHERE collection = ? ORDER BY path")
            .bind(path)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to read collection {path}"))?;
        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let doc_path: String = row.try_get("path")?;
            let body: String = row.try_get("body")?;
            let fields = decode_body(&doc_path, &body);
            documents.push(Document::new(doc_path, fields));
        }
        Ok(documents)
    }

    async fn publish(&self, path: &str) -> Result<()> {
        if self.listeners.watches_document(path) {
            let snapshot = self.load(path).await?;
            self.listeners.notify_document(path, &snapshot);
        }
        if let Some(parent) = parent_collection(path) {
            if self.listeners.watches_collection(parent) {
                let snapshot = self.load_collection(parent).await?;
                self.listeners.notify_collection(parent, &snapshot);
            }
        }
        Ok(())
    }
}

fn decode_body(path: &str, body: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(fields)) => fields,
        Ok(_) | Err(_) => {
            warn!(path, "store: document body is not a JSON object; treating as empty");
            Map::new()
        }
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get_document(&self, path: &str) -> Result<Option<Document>> {
        self.load(path).await
    }

    async fn get_collection(&self, path: &str) -> Result<Vec<Document>> {
        self.load_collection(path).await
    }

    async fn subscribe_collection(&self, path: &str) -> Result<CollectionSubscription> {
        let _guard = self.write_lock.lock().await;
        let initial = self.load_collection(path).await?;
        Ok(self.listeners.register_collection(path, initial))
    }

    async fn subscribe_document(&self, path: &str) -> Result<DocumentSubscription> {
        let _guard = self.write_lock.lock().await;
        let initial = self.load(path).await?;
        Ok(self.listeners.register_document(path, initial))
    }

    async fn write_fields(&self, path: &str, update: FieldUpdate) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let existing: Option<String> = sqlx::query_scalar("SELECT body FROM documents WHERE path = ?")
            .bind(path)
            .fetch_optional(&mut *tx)
            .await?;
        let mut fields = existing
            .map(|body| decode_body(path, &body))
            .unwrap_or_default();
        update.apply_to(&mut fields);
        let body = serde_json::to_string(&Value::Object(fields))?;
        sqlx::query(
            "INSERT INTO documents (path, collection, body, updated_at) VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(path) DO UPDATE SET body = excluded.body, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(path)
        .bind(parent_collection(path).unwrap_or_default())
        .bind(body)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to write document {path}"))?;
        tx.commit().await?;
        self.publish(path).await
    }

    async fn delete_document(&self, path: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM documents WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete document {path}"))?;
        if result.rows_affected() > 0 {
            self.publish(path).await?;
        }
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

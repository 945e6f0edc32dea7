//! Session store backed by a shared SQLite file
//!
//! Lets two processes on one host exchange signaling through the same
//! database. SQLite has no change feed, so subscriptions poll.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    CallDocument, CallField, CallId, RecordHandler, RecordRef, SessionStore, SnapshotHandler,
    StoredRecord, Subcollection, Subscription, WriteMode,
};
use crate::error::{AppError, Result};
use crate::webrtc::SessionDescription;

fn read_err(e: impl std::fmt::Display) -> AppError {
    AppError::SignalingRead(e.to_string())
}

fn write_err(e: impl std::fmt::Display) -> AppError {
    AppError::SignalingWrite(e.to_string())
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// SQLite-backed session store
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
    poll_interval: Duration,
}

impl SqliteSessionStore {
    /// Create a store on an existing pool, creating tables if needed
    pub async fn new(pool: Pool<Sqlite>, poll_interval: Duration) -> Result<Self> {
        Self::init_schema(&pool).await?;
        Ok(Self {
            pool,
            poll_interval,
        })
    }

    /// Open (or create) a database file
    pub async fn open(db_path: &Path, poll_interval: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&db_url)
            .await?;

        Self::new(pool, poll_interval).await
    }

    async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                id TEXT PRIMARY KEY,
                offer TEXT,
                answer TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS call_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                call_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_call_records_call ON call_records (call_id, collection, seq)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

fn decode_description(column: Option<String>) -> Result<Option<SessionDescription>> {
    column
        .map(|json| serde_json::from_str(&json).map_err(read_err))
        .transpose()
}

async fn fetch_document(pool: &Pool<Sqlite>, call_id: &CallId) -> Result<Option<CallDocument>> {
    let row: Option<(Option<String>, Option<String>)> =
        sqlx::query_as("SELECT offer, answer FROM calls WHERE id = ?1")
            .bind(call_id.as_str())
            .fetch_optional(pool)
            .await
            .map_err(read_err)?;

    match row {
        Some((offer, answer)) => Ok(Some(CallDocument {
            offer: decode_description(offer)?,
            answer: decode_description(answer)?,
        })),
        None => Ok(None),
    }
}

async fn fetch_records_after(
    pool: &Pool<Sqlite>,
    call_id: &CallId,
    collection: Subcollection,
    after_seq: i64,
) -> Result<Vec<(i64, StoredRecord)>> {
    let rows: Vec<(i64, String, String)> = sqlx::query_as(
        r#"
        SELECT seq, id, data FROM call_records
        WHERE call_id = ?1 AND collection = ?2 AND seq > ?3
        ORDER BY seq
        "#,
    )
    .bind(call_id.as_str())
    .bind(collection.as_str())
    .bind(after_seq)
    .fetch_all(pool)
    .await
    .map_err(read_err)?;

    rows.into_iter()
        .map(|(seq, id, data)| {
            let data: Value = serde_json::from_str(&data).map_err(read_err)?;
            Ok((
                seq,
                StoredRecord {
                    reference: RecordRef {
                        call_id: call_id.clone(),
                        collection,
                        id,
                    },
                    data,
                },
            ))
        })
        .collect()
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_call_document(&self) -> Result<CallId> {
        loop {
            let id = CallId::generate();
            let taken: Option<(String,)> = sqlx::query_as("SELECT id FROM calls WHERE id = ?1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(read_err)?;
            if taken.is_none() {
                return Ok(id);
            }
        }
    }

    async fn get_call_document(&self, call_id: &CallId) -> Result<Option<CallDocument>> {
        fetch_document(&self.pool, call_id).await
    }

    async fn set_field(&self, call_id: &CallId, field: CallField, mode: WriteMode) -> Result<()> {
        let name = field.name();
        let json = serde_json::to_string(field.description())?;

        let sql = match (mode, &field) {
            (WriteMode::Upsert, CallField::Offer(_)) => {
                "INSERT INTO calls (id, offer, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(id) DO UPDATE SET offer = ?2, updated_at = ?3"
            }
            (WriteMode::Upsert, CallField::Answer(_)) => {
                "INSERT INTO calls (id, answer, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(id) DO UPDATE SET answer = ?2, updated_at = ?3"
            }
            (WriteMode::Update, CallField::Offer(_)) => {
                "UPDATE calls SET offer = ?2, updated_at = ?3 WHERE id = ?1"
            }
            (WriteMode::Update, CallField::Answer(_)) => {
                "UPDATE calls SET answer = ?2, updated_at = ?3 WHERE id = ?1"
            }
        };

        let result = sqlx::query(sql)
            .bind(call_id.as_str())
            .bind(&json)
            .bind(now())
            .execute(&self.pool)
            .await
            .map_err(write_err)?;

        if result.rows_affected() == 0 {
            return Err(AppError::SignalingWrite(format!(
                "Cannot set {} on missing call {}",
                name, call_id
            )));
        }

        debug!("Call {} field {} written", call_id, name);
        Ok(())
    }

    async fn subscribe_document(
        &self,
        call_id: &CallId,
        on_snapshot: SnapshotHandler,
    ) -> Result<Subscription> {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let pool = self.pool.clone();
        let call_id = call_id.clone();
        let mut ticker = tokio::time::interval(self.poll_interval);

        tokio::spawn(async move {
            let mut last: Option<Option<CallDocument>> = None;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match fetch_document(&pool, &call_id).await {
                    Ok(doc) => {
                        if last.as_ref() != Some(&doc) {
                            last = Some(doc.clone());
                            if !cancel.is_cancelled() {
                                on_snapshot(doc);
                            }
                        }
                    }
                    Err(e) => warn!("Polling call {} failed: {}", call_id, e),
                }
            }
            trace!("Document subscription for {} ended", call_id);
        });

        Ok(Subscription::new(token))
    }

    async fn subscribe_collection_adds(
        &self,
        call_id: &CallId,
        collection: Subcollection,
        on_added: RecordHandler,
    ) -> Result<Subscription> {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let pool = self.pool.clone();
        let call_id = call_id.clone();
        let mut ticker = tokio::time::interval(self.poll_interval);

        tokio::spawn(async move {
            let mut last_seq = 0i64;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match fetch_records_after(&pool, &call_id, collection, last_seq).await {
                    Ok(records) => {
                        for (seq, record) in records {
                            if cancel.is_cancelled() {
                                break;
                            }
                            last_seq = seq;
                            on_added(record);
                        }
                    }
                    Err(e) => warn!("Polling {}/{} failed: {}", call_id, collection, e),
                }
            }
            trace!("Collection subscription for {}/{} ended", call_id, collection);
        });

        Ok(Subscription::new(token))
    }

    async fn append_record(
        &self,
        call_id: &CallId,
        collection: Subcollection,
        data: Value,
    ) -> Result<RecordRef> {
        let id = uuid::Uuid::new_v4().to_string();
        let json = serde_json::to_string(&data)?;

        sqlx::query(
            r#"
            INSERT INTO call_records (id, call_id, collection, data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&id)
        .bind(call_id.as_str())
        .bind(collection.as_str())
        .bind(&json)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(write_err)?;

        Ok(RecordRef {
            call_id: call_id.clone(),
            collection,
            id,
        })
    }

    async fn list_records(
        &self,
        call_id: &CallId,
        collection: Subcollection,
    ) -> Result<Vec<StoredRecord>> {
        let records = fetch_records_after(&self.pool, call_id, collection, 0).await?;
        Ok(records.into_iter().map(|(_, r)| r).collect())
    }

    async fn delete_record(&self, reference: &RecordRef) -> Result<()> {
        sqlx::query("DELETE FROM call_records WHERE id = ?1 AND call_id = ?2")
            .bind(&reference.id)
            .bind(reference.call_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn delete_document(&self, call_id: &CallId) -> Result<()> {
        sqlx::query("DELETE FROM calls WHERE id = ?1")
            .bind(call_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(write_err)?;
        Ok(())
    }
}

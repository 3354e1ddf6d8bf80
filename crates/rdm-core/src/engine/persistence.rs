//! SQLite-based persistence layer for transfers
//!
//! One row per transfer id. Writes coming from the engine go through a
//! [`StoreWriter`], a single task that applies them in submission order,
//! so callers never wait on the database.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use rdm_types::{Transfer, TransferStatus};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow},
    Row,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Database connection pool for transfer persistence
#[derive(Clone, Debug)]
pub struct TransferStore {
    pool: SqlitePool,
}

impl TransferStore {
    /// Open (or create) the database at `db_path`
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, EngineError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                directory TEXT NOT NULL,
                file_name TEXT NOT NULL,
                headers TEXT NOT NULL DEFAULT '{}',
                tag TEXT,
                status TEXT NOT NULL,
                bytes_downloaded INTEGER NOT NULL DEFAULT 0,
                total_bytes INTEGER,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transfers_status ON transfers(status);
            "#,
        )
        .execute(&pool)
        .await?;

        debug!("Opened transfer database at {}", path.display());
        Ok(Self { pool })
    }

    /// Save or replace a transfer
    pub async fn upsert(&self, transfer: &Transfer) -> Result<(), EngineError> {
        let headers = serde_json::to_string(&transfer.headers)?;

        sqlx::query(
            r#"
            INSERT INTO transfers (
                id, url, directory, file_name, headers, tag, status,
                bytes_downloaded, total_bytes, error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                directory = excluded.directory,
                file_name = excluded.file_name,
                headers = excluded.headers,
                tag = excluded.tag,
                status = excluded.status,
                bytes_downloaded = excluded.bytes_downloaded,
                total_bytes = excluded.total_bytes,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(transfer.id.to_string())
        .bind(&transfer.url)
        .bind(transfer.directory.to_string_lossy().to_string())
        .bind(&transfer.file_name)
        .bind(headers)
        .bind(transfer.tag.as_ref())
        .bind(transfer.status.as_str())
        .bind(transfer.bytes_downloaded as i64)
        .bind(transfer.total_bytes.map(|t| t as i64))
        .bind(transfer.error.as_ref())
        .bind(transfer.created_at.to_rfc3339())
        .bind(transfer.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update the progress counters of a transfer
    pub async fn update_progress(
        &self,
        id: Uuid,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE transfers SET bytes_downloaded = ?, total_bytes = ?, updated_at = ? WHERE id = ?",
        )
        .bind(bytes_downloaded as i64)
        .bind(total_bytes.map(|t| t as i64))
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update the status (and failure reason) of a transfer
    pub async fn update_status(
        &self,
        id: Uuid,
        status: TransferStatus,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE transfers SET status = ?, error = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Load a transfer by ID
    pub async fn load(&self, id: Uuid) -> Result<Option<Transfer>, EngineError> {
        let row = sqlx::query("SELECT * FROM transfers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_transfer).transpose()
    }

    /// Load all transfers, oldest first
    pub async fn load_all(&self) -> Result<Vec<Transfer>, EngineError> {
        let rows = sqlx::query("SELECT * FROM transfers ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_transfer).collect()
    }

    /// Delete a transfer record
    pub async fn delete(&self, id: Uuid) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM transfers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Convert a database row to a Transfer
fn row_to_transfer(row: SqliteRow) -> Result<Transfer, EngineError> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let headers: String = row.get("headers");

    Ok(Transfer {
        id: Uuid::parse_str(&id).map_err(|e| EngineError::Serialization(e.to_string()))?,
        url: row.get("url"),
        directory: PathBuf::from(row.get::<String, _>("directory")),
        file_name: row.get("file_name"),
        headers: serde_json::from_str::<BTreeMap<String, String>>(&headers)?,
        tag: row.get("tag"),
        status: status
            .parse::<TransferStatus>()
            .map_err(EngineError::Serialization)?,
        bytes_downloaded: row.get::<i64, _>("bytes_downloaded") as u64,
        total_bytes: row.get::<Option<i64>, _>("total_bytes").map(|t| t as u64),
        error: row.get("error"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Serialization(e.to_string()))
}

// ============================================================================
// Write-through writer
// ============================================================================

#[derive(Debug)]
enum StoreOp {
    Upsert(Box<Transfer>),
    Progress {
        id: Uuid,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },
    Status {
        id: Uuid,
        status: TransferStatus,
        error: Option<String>,
    },
    Delete(Uuid),
    Flush(oneshot::Sender<()>),
}

/// Handle to the task that serializes writes to a [`TransferStore`]
#[derive(Clone, Debug)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<StoreOp>,
}

impl StoreWriter {
    /// Spawn the writer task; it stops once every handle is dropped
    pub fn spawn(store: TransferStore) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StoreOp>();

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let result = match op {
                    StoreOp::Upsert(transfer) => store.upsert(&transfer).await,
                    StoreOp::Progress {
                        id,
                        bytes_downloaded,
                        total_bytes,
                    } => store.update_progress(id, bytes_downloaded, total_bytes).await,
                    StoreOp::Status { id, status, error } => {
                        store.update_status(id, status, error.as_deref()).await
                    }
                    StoreOp::Delete(id) => store.delete(id).await,
                    StoreOp::Flush(done) => {
                        let _ = done.send(());
                        Ok(())
                    }
                };

                if let Err(e) = result {
                    warn!("Failed to persist transfer state: {}", e);
                }
            }
            debug!("Persistence writer stopped");
        });

        Self { tx }
    }

    fn send(&self, op: StoreOp) {
        if self.tx.send(op).is_err() {
            warn!("Persistence writer is gone, dropping write");
        }
    }

    pub fn upsert(&self, transfer: &Transfer) {
        self.send(StoreOp::Upsert(Box::new(transfer.clone())));
    }

    pub fn progress(&self, id: Uuid, bytes_downloaded: u64, total_bytes: Option<u64>) {
        self.send(StoreOp::Progress {
            id,
            bytes_downloaded,
            total_bytes,
        });
    }

    pub fn status(&self, id: Uuid, status: TransferStatus, error: Option<String>) {
        self.send(StoreOp::Status { id, status, error });
    }

    pub fn delete(&self, id: Uuid) {
        self.send(StoreOp::Delete(id));
    }

    /// Wait until every write submitted before this call is applied
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(StoreOp::Flush(tx));
        let _ = rx.await;
    }
}

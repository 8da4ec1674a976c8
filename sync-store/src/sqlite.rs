//! SQLite connection setup and schema.

use crate::error::{StorageError, StorageResult};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use sync_types::{CollectionType, SyncCheckpoint, SyncScope, Timestamp};

/// SQLite-backed checkpoint and entity store.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStore {
    pub(crate) pool: SqlitePool,
}

/// One stored checkpoint, as `socialsync status` shows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSummary {
    /// Account and collection.
    pub scope: SyncScope,
    /// Unix time of the last commit.
    pub updated_at: Timestamp,
    /// Entities tracked by the checkpoint, `None` if the body is unreadable.
    pub tracked: Option<usize>,
    /// Outstanding asset downloads.
    pub pending_assets: usize,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn new(path: &Path) -> StorageResult<Self> {
        let url = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(url)
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let store = Self { pool };
        store.run_migrations().await?;
        tracing::debug!(path = %path.display(), "opened sqlite store");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // A second connection would see a different database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                account_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                body BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, collection)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_assets (
                account_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                external_id TEXT NOT NULL,
                url TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (account_id, collection, external_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                local_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                external_id TEXT NOT NULL DEFAULT '',
                updated_at INTEGER,
                body TEXT NOT NULL,
                written_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entity_changes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                local_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                fields TEXT NOT NULL DEFAULT '[]',
                external_id TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        // Unacknowledged local entities share the empty external id
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_external
            ON entities(account_id, collection, external_id)
            WHERE external_id != ''
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entities_updated
                ON entities(account_id, collection, updated_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_changes_scope
                ON entity_changes(account_id, collection, seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(())
    }

    pub(crate) fn current_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Every stored checkpoint, ordered by account then collection.
    pub async fn checkpoint_summaries(&self) -> StorageResult<Vec<CheckpointSummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT c.account_id, c.collection, c.body, c.updated_at,
                   (SELECT COUNT(*) FROM pending_assets p
                    WHERE p.account_id = c.account_id AND p.collection = c.collection) AS pending
            FROM checkpoints c
            ORDER BY c.account_id, c.collection
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        rows.into_iter().map(CheckpointSummary::try_from).collect()
    }
}

/// Parse a stored collection column.
pub(crate) fn parse_collection(
    table: &'static str,
    value: &str,
) -> StorageResult<CollectionType> {
    CollectionType::from_str(value).map_err(|err| StorageError::Corrupt {
        table,
        reason: err.to_string(),
    })
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    account_id: String,
    collection: String,
    body: Vec<u8>,
    updated_at: i64,
    pending: i64,
}

impl TryFrom<SummaryRow> for CheckpointSummary {
    type Error = StorageError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        let collection = parse_collection("checkpoints", &row.collection)?;
        Ok(CheckpointSummary {
            scope: SyncScope::new(row.account_id, collection),
            updated_at: row.updated_at,
            tracked: SyncCheckpoint::from_bytes(&row.body)
                .ok()
                .map(|c| c.id_map.len()),
            pending_assets: row.pending.max(0) as usize,
        })
    }
}

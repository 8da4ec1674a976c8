//! [`CheckpointStore`] over the `checkpoints` and `pending_assets` tables.

use crate::error::StorageError;
use crate::sqlite::SqliteStore;
use async_trait::async_trait;
use std::collections::BTreeMap;
use sync_client::CheckpointStore;
use sync_types::{ExternalId, PendingAsset, SyncCheckpoint, SyncError, SyncScope};

#[derive(sqlx::FromRow)]
struct PendingRow {
    external_id: String,
    url: String,
    attempts: i64,
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn load(&self, scope: &SyncScope) -> Result<Option<SyncCheckpoint>, SyncError> {
        let body: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT body FROM checkpoints WHERE account_id = ?1 AND collection = ?2",
        )
        .bind(scope.account.as_str())
        .bind(scope.collection.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT external_id, url, attempts
            FROM pending_assets
            WHERE account_id = ?1 AND collection = ?2
            "#,
        )
        .bind(scope.account.as_str())
        .bind(scope.collection.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        if body.is_none() && rows.is_empty() {
            return Ok(None);
        }

        let mut checkpoint = match body {
            Some(bytes) => SyncCheckpoint::from_bytes(&bytes)?,
            // A failed first run leaves only pending rows
            None => SyncCheckpoint::new(),
        };
        checkpoint.pending_assets = rows
            .into_iter()
            .map(|row| {
                (
                    ExternalId::new(row.external_id),
                    PendingAsset {
                        url: row.url,
                        attempts: row.attempts.max(0) as u32,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        Ok(Some(checkpoint))
    }

    async fn commit(
        &self,
        scope: &SyncScope,
        checkpoint: &SyncCheckpoint,
    ) -> Result<(), SyncError> {
        let body = checkpoint.to_bytes()?;
        sqlx::query(
            r#"
            INSERT INTO checkpoints (account_id, collection, body, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(account_id, collection) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(scope.account.as_str())
        .bind(scope.collection.as_str())
        .bind(&body)
        .bind(Self::current_timestamp())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        tracing::debug!(%scope, bytes = body.len(), "checkpoint committed");
        Ok(())
    }

    async fn purge(&self, scope: &SyncScope) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        sqlx::query("DELETE FROM checkpoints WHERE account_id = ?1 AND collection = ?2")
            .bind(scope.account.as_str())
            .bind(scope.collection.as_str())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

        sqlx::query("DELETE FROM pending_assets WHERE account_id = ?1 AND collection = ?2")
            .bind(scope.account.as_str())
            .bind(scope.collection.as_str())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

        tx.commit().await.map_err(StorageError::Database)?;
        tracing::info!(%scope, "checkpoint purged");
        Ok(())
    }

    async fn upsert_pending_asset(
        &self,
        scope: &SyncScope,
        id: &ExternalId,
        pending: &PendingAsset,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO pending_assets (account_id, collection, external_id, url, attempts)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account_id, collection, external_id) DO UPDATE SET
                url = excluded.url,
                attempts = excluded.attempts
            "#,
        )
        .bind(scope.account.as_str())
        .bind(scope.collection.as_str())
        .bind(id.as_str())
        .bind(&pending.url)
        .bind(i64::from(pending.attempts))
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }

    async fn remove_pending_asset(
        &self,
        scope: &SyncScope,
        id: &ExternalId,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            DELETE FROM pending_assets
            WHERE account_id = ?1 AND collection = ?2 AND external_id = ?3
            "#,
        )
        .bind(scope.account.as_str())
        .bind(scope.collection.as_str())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }
}

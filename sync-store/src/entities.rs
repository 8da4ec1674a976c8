//! [`LocalStore`] over the `entities` table, plus the application-side
//! writes that feed `entity_changes`.

use crate::error::{StorageError, StorageResult};
use crate::sqlite::SqliteStore;
use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};
use sync_client::{collapse_changes, ChangeLog, LocalStore, LoggedChange};
use sync_types::{
    DeltaSet, Entity, ExternalId, FieldSet, LocalId, StoreError, SyncScope, Timestamp,
};
use uuid::Uuid;

const ADDED: &str = "added";
const MODIFIED: &str = "modified";
const REMOVED: &str = "removed";

#[derive(sqlx::FromRow)]
struct EntityRow {
    local_id: String,
    body: String,
}

impl TryFrom<EntityRow> for Entity {
    type Error = StorageError;

    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        let mut entity: Entity =
            serde_json::from_str(&row.body).map_err(|err| StorageError::Corrupt {
                table: "entities",
                reason: err.to_string(),
            })?;
        entity.local_id = Some(LocalId::new(row.local_id));
        Ok(entity)
    }
}

#[derive(sqlx::FromRow)]
struct ChangeRow {
    local_id: String,
    kind: String,
    fields: String,
    external_id: String,
}

impl ChangeRow {
    fn decode(self) -> StorageResult<(LocalId, LoggedChange)> {
        let change = match self.kind.as_str() {
            ADDED => LoggedChange::Added,
            MODIFIED => {
                let fields: FieldSet =
                    serde_json::from_str(&self.fields).map_err(|err| StorageError::Corrupt {
                        table: "entity_changes",
                        reason: err.to_string(),
                    })?;
                LoggedChange::Modified(fields)
            }
            REMOVED => LoggedChange::Removed(ExternalId::new(self.external_id)),
            other => {
                return Err(StorageError::Corrupt {
                    table: "entity_changes",
                    reason: format!("unknown change kind {other:?}"),
                })
            }
        };
        Ok((LocalId::new(self.local_id), change))
    }
}

/// Stored form: no local id (it is the key) and no dirty fields.
fn encode(entity: &Entity) -> StorageResult<String> {
    let mut stored = entity.clone();
    stored.local_id = None;
    stored.dirty_fields.clear();
    Ok(serde_json::to_string(&stored)?)
}

impl SqliteStore {
    async fn upsert_entity(
        tx: &mut Transaction<'_, Sqlite>,
        scope: &SyncScope,
        id: &LocalId,
        entity: &Entity,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entities
                (local_id, account_id, collection, external_id, updated_at, body, written_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(local_id) DO UPDATE SET
                external_id = excluded.external_id,
                updated_at = excluded.updated_at,
                body = excluded.body,
                written_at = excluded.written_at
            "#,
        )
        .bind(id.as_str())
        .bind(scope.account.as_str())
        .bind(scope.collection.as_str())
        .bind(entity.external_id.as_str())
        .bind(entity.updated_at)
        .bind(encode(entity)?)
        .bind(Self::current_timestamp())
        .execute(&mut **tx)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }

    async fn log_change(
        tx: &mut Transaction<'_, Sqlite>,
        scope: &SyncScope,
        id: &LocalId,
        change: &LoggedChange,
    ) -> StorageResult<()> {
        let (kind, fields, external_id) = match change {
            LoggedChange::Added => (ADDED, "[]".to_string(), ""),
            LoggedChange::Modified(fields) => (MODIFIED, serde_json::to_string(fields)?, ""),
            LoggedChange::Removed(external_id) => (REMOVED, "[]".to_string(), external_id.as_str()),
        };
        sqlx::query(
            r#"
            INSERT INTO entity_changes (account_id, collection, local_id, kind, fields, external_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(scope.account.as_str())
        .bind(scope.collection.as_str())
        .bind(id.as_str())
        .bind(kind)
        .bind(fields)
        .bind(external_id)
        .execute(&mut **tx)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }

    async fn select_entity(
        tx: &mut Transaction<'_, Sqlite>,
        scope: &SyncScope,
        id: &LocalId,
    ) -> StorageResult<Option<Entity>> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT local_id, body FROM entities
            WHERE local_id = ?1 AND account_id = ?2 AND collection = ?3
            "#,
        )
        .bind(id.as_str())
        .bind(scope.account.as_str())
        .bind(scope.collection.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(StorageError::Database)?;

        row.map(Entity::try_from).transpose()
    }

    /// Application-side insert. Logged as an add.
    pub async fn insert_local(&self, scope: &SyncScope, entity: &Entity) -> StorageResult<LocalId> {
        let id = LocalId::new(Uuid::new_v4().to_string());
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;
        Self::upsert_entity(&mut tx, scope, &id, entity).await?;
        Self::log_change(&mut tx, scope, &id, &LoggedChange::Added).await?;
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(id)
    }

    /// Application-side update of an existing entity.
    ///
    /// `fields` names what changed (empty when unknown). Returns false for
    /// unknown ids.
    pub async fn update_local(
        &self,
        scope: &SyncScope,
        entity: &Entity,
        fields: &FieldSet,
    ) -> StorageResult<bool> {
        let Some(id) = entity.local_id.clone() else {
            return Ok(false);
        };
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;
        if Self::select_entity(&mut tx, scope, &id).await?.is_none() {
            return Ok(false);
        }
        Self::upsert_entity(&mut tx, scope, &id, entity).await?;
        Self::log_change(&mut tx, scope, &id, &LoggedChange::Modified(fields.clone())).await?;
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(true)
    }

    /// Application-side delete. Logged as a removal.
    pub async fn delete_local(&self, scope: &SyncScope, id: &LocalId) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;
        let Some(entity) = Self::select_entity(&mut tx, scope, id).await? else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM entities WHERE local_id = ?1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;
        Self::log_change(&mut tx, scope, id, &LoggedChange::Removed(entity.external_id)).await?;
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(true)
    }

    /// Entity by local id.
    pub async fn get(&self, scope: &SyncScope, id: &LocalId) -> StorageResult<Option<Entity>> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;
        let entity = Self::select_entity(&mut tx, scope, id).await?;
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(entity)
    }

    /// Entity of `scope` with the given external id.
    pub async fn find(
        &self,
        scope: &SyncScope,
        external_id: &str,
    ) -> StorageResult<Option<Entity>> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT local_id, body FROM entities
            WHERE account_id = ?1 AND collection = ?2 AND external_id = ?3
            "#,
        )
        .bind(scope.account.as_str())
        .bind(scope.collection.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        row.map(Entity::try_from).transpose()
    }

    /// Number of entities stored for `scope`.
    pub async fn count(&self, scope: &SyncScope) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entities WHERE account_id = ?1 AND collection = ?2",
        )
        .bind(scope.account.as_str())
        .bind(scope.collection.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn fetch_since(
        &self,
        scope: &SyncScope,
        since: Option<Timestamp>,
    ) -> Result<Vec<Entity>, StoreError> {
        let rows = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT local_id, body FROM entities
            WHERE account_id = ?1 AND collection = ?2
              AND (?3 IS NULL OR updated_at >= ?3)
            ORDER BY external_id, local_id
            "#,
        )
        .bind(scope.account.as_str())
        .bind(scope.collection.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(rows
            .into_iter()
            .map(Entity::try_from)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn fetch_existing(
        &self,
        scope: &SyncScope,
        ids: &[LocalId],
    ) -> Result<Vec<Entity>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = Self::select_entity(&mut tx, scope, id).await? {
                found.push(entity);
            }
        }
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(found)
    }

    async fn save(&self, scope: &SyncScope, entity: &Entity) -> Result<LocalId, StoreError> {
        let id = entity
            .local_id
            .clone()
            .unwrap_or_else(|| LocalId::new(Uuid::new_v4().to_string()));
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;
        Self::upsert_entity(&mut tx, scope, &id, entity).await?;
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(id)
    }

    async fn remove(&self, scope: &SyncScope, id: &LocalId) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM entities WHERE local_id = ?1 AND account_id = ?2 AND collection = ?3",
        )
            .bind(id.as_str())
            .bind(scope.account.as_str())
            .bind(scope.collection.as_str())
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(())
    }

    async fn changes_since(
        &self,
        scope: &SyncScope,
        marker: Option<Timestamp>,
    ) -> Result<ChangeLog, StoreError> {
        // One transaction so the marker matches the rows read
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        let rows = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT local_id, kind, fields, external_id FROM entity_changes
            WHERE account_id = ?1 AND collection = ?2 AND seq > ?3
            ORDER BY seq
            "#,
        )
        .bind(scope.account.as_str())
        .bind(scope.collection.as_str())
        .bind(marker.unwrap_or(0))
        .fetch_all(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        let head: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM entity_changes")
            .fetch_one(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

        let log = rows
            .into_iter()
            .map(ChangeRow::decode)
            .collect::<Result<Vec<_>, _>>()?;

        let mut delta = DeltaSet::new();
        for (id, change) in collapse_changes(log) {
            match change {
                // Already acknowledged by the remote: no longer an add
                LoggedChange::Added => match Self::select_entity(&mut tx, scope, &id).await? {
                    Some(entity) if entity.external_id.is_unassigned() => delta.added.push(entity),
                    Some(entity) => delta.modified.push(entity),
                    None => {}
                },
                LoggedChange::Modified(fields) => {
                    if let Some(mut entity) = Self::select_entity(&mut tx, scope, &id).await? {
                        entity.dirty_fields = fields;
                        delta.modified.push(entity);
                    }
                }
                LoggedChange::Removed(external_id) => delta.removed.push(external_id),
            }
        }
        tx.commit().await.map_err(StorageError::Database)?;

        tracing::trace!(
            %scope,
            added = delta.added.len(),
            modified = delta.modified.len(),
            removed = delta.removed.len(),
            "read local change log"
        );
        Ok(ChangeLog {
            delta,
            marker: head.max(marker.unwrap_or(0)),
        })
    }
}

//! Memory record storage using SQLite

use crate::error::{MemoryError, Result};
use crate::storage::{MemoryStorage, UpsertDefaults};
use crate::types::{MemoryId, MemoryMetadata, MemoryRecord, Relationship, SupersededPair};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// SQLite-backed [`MemoryStorage`]
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl SqliteStore {
    /// Wrap an already migrated pool
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// Open (or create) a database file and run migrations
    pub async fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::migrate(&pool).await?;

        tracing::debug!("Opened SQLite store at {}", path.display());
        Ok(Self::new(pool))
    }

    /// Create an in-memory store for testing
    pub async fn connect_in_memory() -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .create_if_missing(true);

        // A single connection that never expires, or the database vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::migrate(&pool).await?;

        Ok(Self::new(pool))
    }

    /// Get a reference to the SQLite pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| MemoryError::Database(e.into()))
    }

    /// Outgoing edges for each of `ids`
    async fn load_relationships(
        &self,
        index: &str,
        ids: &[MemoryId],
    ) -> Result<HashMap<MemoryId, Vec<Relationship>>> {
        let mut edges: HashMap<MemoryId, Vec<Relationship>> = HashMap::new();
        if ids.is_empty() {
            return Ok(edges);
        }

        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query_str = format!(
            "SELECT source_id, target_id, rel_type, data FROM relationships \
             WHERE index_name = ? AND source_id IN ({placeholders}) \
             ORDER BY source_id, created_at, target_id, rel_type"
        );

        let mut query = sqlx::query(&query_str).bind(index);
        for id in ids {
            query = query.bind(id);
        }

        for row in query.fetch_all(&self.pool).await? {
            let source_id: String = row.try_get("source_id")?;
            if let Some(edge) = row_to_relationship(&row) {
                edges.entry(source_id).or_default().push(edge);
            }
        }
        Ok(edges)
    }

    async fn hydrate(&self, index: &str, rows: Vec<SqliteRow>) -> Result<Vec<MemoryRecord>> {
        let mut records = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>>>()?;

        let ids: Vec<MemoryId> = records.iter().map(|r| r.id.clone()).collect();
        let mut edges = self.load_relationships(index, &ids).await?;
        for record in &mut records {
            record.metadata.relationships = Some(edges.remove(&record.id).unwrap_or_default());
        }
        Ok(records)
    }
}

#[async_trait]
impl MemoryStorage for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn get_memory(&self, index: &str, id: &str) -> Result<Option<MemoryRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, text, metadata, sleep_cycles, superseded_by_id
            FROM memories
            WHERE index_name = ? AND id = ?
            "#,
        )
        .bind(index)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(self.hydrate(index, vec![row]).await?.pop())
    }

    async fn get_memories(&self, index: &str, ids: &[MemoryId]) -> Result<Vec<MemoryRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query_str = format!(
            "SELECT id, text, metadata, sleep_cycles, superseded_by_id \
             FROM memories WHERE index_name = ? AND id IN ({placeholders})"
        );

        let mut query = sqlx::query(&query_str).bind(index);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut by_id: HashMap<MemoryId, MemoryRecord> = self
            .hydrate(index, rows)
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn list_memories(&self, index: &str, limit: Option<i64>) -> Result<Vec<MemoryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, text, metadata, sleep_cycles, superseded_by_id
            FROM memories
            WHERE index_name = ? AND superseded_by_id IS NULL
            ORDER BY valid_at, id
            LIMIT ?
            "#,
        )
        .bind(index)
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(index, rows).await
    }

    async fn upsert_memories(
        &self,
        index: &str,
        records: &[MemoryRecord],
        defaults: Option<&UpsertDefaults>,
    ) -> Result<Vec<MemoryId>> {
        let now = Utc::now();
        let mut ids = Vec::with_capacity(records.len());
        let mut tx = self.pool.begin().await?;

        for record in records {
            let mut record = record.clone();
            if let Some(defaults) = defaults {
                defaults.apply(&mut record);
            }

            let relationships = record.metadata.relationships.take();
            let metadata = &record.metadata;
            let metadata_json = serde_json::to_string(metadata)?;

            sqlx::query(
                r#"
                INSERT INTO memories (
                    index_name, id, text, metadata, memory_type, kind, current_priority,
                    valid_at, sleep_cycles, superseded_by_id, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(index_name, id) DO UPDATE SET
                    text = excluded.text,
                    metadata = excluded.metadata,
                    memory_type = excluded.memory_type,
                    kind = excluded.kind,
                    current_priority = excluded.current_priority,
                    valid_at = excluded.valid_at,
                    sleep_cycles = excluded.sleep_cycles,
                    superseded_by_id = excluded.superseded_by_id,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(index)
            .bind(&record.id)
            .bind(&record.text)
            .bind(metadata_json)
            .bind(metadata.memory_type.to_string())
            .bind(metadata.kind.to_string())
            .bind(metadata.dynamics.current_priority)
            .bind(record.narrative_time())
            .bind(metadata.dynamics.sleep_cycles)
            .bind(metadata.superseded_by_id.as_deref())
            .bind(metadata.dynamics.created_at.unwrap_or(now))
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if let Some(edges) = relationships {
                sqlx::query("DELETE FROM relationships WHERE index_name = ? AND source_id = ?")
                    .bind(index)
                    .bind(&record.id)
                    .execute(&mut *tx)
                    .await?;

                for edge in &edges {
                    sqlx::query(
                        r#"
                        INSERT INTO relationships (
                            index_name, source_id, target_id, rel_type, weight, data, created_at
                        )
                        VALUES (?, ?, ?, ?, ?, ?, ?)
                        ON CONFLICT(index_name, source_id, target_id, rel_type) DO UPDATE SET
                            weight = excluded.weight,
                            data = excluded.data
                        "#,
                    )
                    .bind(index)
                    .bind(&record.id)
                    .bind(&edge.target_id)
                    .bind(edge.rel_type.as_str())
                    .bind(edge.weight)
                    .bind(serde_json::to_string(edge)?)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
            }

            ids.push(record.id);
        }

        tx.commit().await?;
        tracing::debug!("Upserted {} records into index '{}'", ids.len(), index);
        Ok(ids)
    }

    async fn delete_memories(&self, index: &str, ids: &[MemoryId]) -> Result<u64> {
        let mut deleted = 0;
        let mut tx = self.pool.begin().await?;

        for id in ids {
            // Edges in either direction go with the record
            sqlx::query(
                "DELETE FROM relationships WHERE index_name = ? AND (source_id = ? OR target_id = ?)",
            )
            .bind(index)
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            let result = sqlx::query("DELETE FROM memories WHERE index_name = ? AND id = ?")
                .bind(index)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn mark_memories_superseded(&self, index: &str, pairs: &[SupersededPair]) -> Result<u64> {
        let now = Utc::now();
        let mut updated = 0;
        let mut tx = self.pool.begin().await?;

        for pair in pairs {
            let result = sqlx::query(
                "UPDATE memories SET superseded_by_id = ?, updated_at = ? WHERE index_name = ? AND id = ?",
            )
            .bind(&pair.superseded_by_id)
            .bind(now)
            .bind(index)
            .bind(&pair.source_id)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn increment_sleep_cycles(&self, index: &str, ids: &[MemoryId]) -> Result<u64> {
        let mut unique: Vec<&MemoryId> = ids.iter().collect();
        unique.sort();
        unique.dedup();

        let now = Utc::now();
        let mut updated = 0;
        let mut tx = self.pool.begin().await?;

        for id in unique {
            let result = sqlx::query(
                "UPDATE memories SET sleep_cycles = sleep_cycles + 1, updated_at = ? WHERE index_name = ? AND id = ?",
            )
            .bind(now)
            .bind(index)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn get_relationships(&self, index: &str, source_id: &str) -> Result<Vec<Relationship>> {
        let mut edges = self
            .load_relationships(index, &[source_id.to_string()])
            .await?;
        Ok(edges.remove(source_id).unwrap_or_default())
    }
}

/// Helper: Convert database row to a record (edges loaded separately)
fn row_to_record(row: &SqliteRow) -> Result<MemoryRecord> {
    let id: String = row.try_get("id")?;
    let metadata_json: String = row.try_get("metadata")?;

    let mut metadata: MemoryMetadata = serde_json::from_str(&metadata_json).map_err(|e| {
        tracing::warn!("Unreadable metadata on '{}': {}", id, e);
        MemoryError::Serialization(format!("metadata of '{id}' is unreadable: {e}"))
    })?;

    // Columns updated in place win over the JSON copy
    metadata.dynamics.sleep_cycles = row.try_get("sleep_cycles").unwrap_or(0);
    metadata.superseded_by_id = row.try_get("superseded_by_id").ok().flatten();

    Ok(MemoryRecord {
        id,
        text: row.try_get("text")?,
        metadata,
    })
}

/// Helper: Convert database row to a relationship
fn row_to_relationship(row: &SqliteRow) -> Option<Relationship> {
    let data: String = row.try_get("data").ok()?;
    match serde_json::from_str(&data) {
        Ok(edge) => Some(edge),
        Err(e) => {
            let target: String = row.try_get("target_id").unwrap_or_default();
            tracing::warn!("Skipping unreadable edge to '{}': {}", target, e);
            None
        }
    }
}

//! SQLite-backed implementation of every store trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{
    AuditEntry, AuditSink, CheckpointStore, Entity, EntityStore, EntityUpsert, NewEdge,
    RelationshipEdge, TelemetrySink, UpsertOutcome,
};
use crate::config::Config;
use crate::db;
use crate::error::{Result, SyncError};
use crate::migrate;

const ENTITY_COLUMNS: &str =
    "id, canonical_id, entity_type, title, metadata_json, content_hash, updated_at";

const EDGE_COLUMNS: &str =
    "id, from_canonical, from_type, to_canonical, to_type, relation_type, created_at";

/// Entity store, audit log, telemetry and checkpoints in one SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect using the configured database path and apply migrations.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn entity_from_row(row: &SqliteRow) -> Entity {
    let metadata_json: String = row.get("metadata_json");
    Entity {
        id: row.get("id"),
        canonical_id: row.get("canonical_id"),
        entity_type: row.get("entity_type"),
        title: row.get("title"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({})),
        content_hash: row.get("content_hash"),
        updated_at: from_ts(row.get("updated_at")),
    }
}

fn edge_from_row(row: &SqliteRow) -> RelationshipEdge {
    RelationshipEdge {
        id: row.get("id"),
        from_id: row.get("from_canonical"),
        from_type: row.get("from_type"),
        to_id: row.get("to_canonical"),
        to_type: row.get("to_type"),
        relation_type: row.get("relation_type"),
        created_at: from_ts(row.get("created_at")),
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn get_or_create_entity(
        &self,
        entity_type: &str,
        canonical_id: &str,
        title: Option<&str>,
    ) -> Result<Entity> {
        if let Some(existing) = self.find_entity(canonical_id).await? {
            return Ok(existing);
        }

        sqlx::query(
            r#"
            INSERT INTO entity (id, canonical_id, entity_type, title, metadata_json, updated_at)
            VALUES (?, ?, ?, ?, '{}', ?)
            ON CONFLICT(canonical_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(canonical_id)
        .bind(entity_type)
        .bind(title)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        self.find_entity(canonical_id).await?.ok_or_else(|| {
            SyncError::StoreUnavailable(format!("entity {} vanished after insert", canonical_id))
        })
    }

    async fn upsert_entity(&self, upsert: &EntityUpsert) -> Result<UpsertOutcome> {
        let existing: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT id, content_hash FROM entity WHERE canonical_id = ?")
                .bind(&upsert.canonical_id)
                .fetch_optional(&self.pool)
                .await?;

        let (entity_id, prev_hash) = match existing {
            Some((id, hash)) => (id, hash),
            None => (Uuid::new_v4().to_string(), None),
        };
        let new_hash = upsert.content_hash();

        sqlx::query(
            r#"
            INSERT INTO entity (id, canonical_id, entity_type, title, metadata_json, content, content_hash, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(canonical_id) DO UPDATE SET
                entity_type = excluded.entity_type,
                title = excluded.title,
                metadata_json = excluded.metadata_json,
                content = excluded.content,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entity_id)
        .bind(&upsert.canonical_id)
        .bind(&upsert.entity_type)
        .bind(&upsert.title)
        .bind(upsert.metadata.to_string())
        .bind(&upsert.content)
        .bind(&new_hash)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(UpsertOutcome {
            entity_id,
            prev_hash,
            new_hash,
        })
    }

    async fn find_entity(&self, canonical_id: &str) -> Result<Option<Entity>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM entity WHERE canonical_id = ?",
            ENTITY_COLUMNS
        ))
        .bind(canonical_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(entity_from_row))
    }

    async fn list_entities(&self, entity_type: Option<&str>) -> Result<Vec<Entity>> {
        let rows = match entity_type {
            Some(ty) => {
                sqlx::query(&format!(
                    "SELECT {} FROM entity WHERE entity_type = ? ORDER BY canonical_id",
                    ENTITY_COLUMNS
                ))
                .bind(ty)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM entity ORDER BY canonical_id",
                    ENTITY_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.iter().map(entity_from_row).collect())
    }

    async fn insert_edge(&self, edge: &NewEdge) -> Result<RelationshipEdge> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO entity_relation (from_canonical, from_type, to_canonical, to_type, relation_type, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&edge.from_id)
        .bind(&edge.from_type)
        .bind(&edge.to_id)
        .bind(&edge.to_type)
        .bind(&edge.relation_type)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(RelationshipEdge {
            id: result.last_insert_rowid(),
            from_id: edge.from_id.clone(),
            from_type: edge.from_type.clone(),
            to_id: edge.to_id.clone(),
            to_type: edge.to_type.clone(),
            relation_type: edge.relation_type.clone(),
            created_at: from_ts(now),
        })
    }

    async fn edge_exists(&self, from_id: &str, to_id: &str, relation_type: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM entity_relation
            WHERE from_canonical = ? AND to_canonical = ? AND relation_type = ?
            "#,
        )
        .bind(from_id)
        .bind(to_id)
        .bind(relation_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn edges_from(&self, canonical_id: &str) -> Result<Vec<RelationshipEdge>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM entity_relation WHERE from_canonical = ? ORDER BY id",
            EDGE_COLUMNS
        ))
        .bind(canonical_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(edge_from_row).collect())
    }

    async fn edges_to(&self, canonical_id: &str) -> Result<Vec<RelationshipEdge>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM entity_relation WHERE to_canonical = ? ORDER BY id",
            EDGE_COLUMNS
        ))
        .bind(canonical_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(edge_from_row).collect())
    }

    async fn all_edges(&self) -> Result<Vec<RelationshipEdge>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM entity_relation ORDER BY id",
            EDGE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(edge_from_row).collect())
    }
}

#[async_trait]
impl AuditSink for SqliteStore {
    async fn log(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, actor_id, action, target_type, target_id, target_label, metadata_json, status, error_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&entry.identity)
        .bind(&entry.action)
        .bind(&entry.target_type)
        .bind(&entry.target_id)
        .bind(&entry.target_label)
        .bind(entry.metadata.to_string())
        .bind(entry.status.as_str())
        .bind(&entry.error_message)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for SqliteStore {
    async fn add(
        &self,
        metric: &str,
        value: i64,
        timestamp: DateTime<Utc>,
        meta: Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_telemetry (id, metric, value, timestamp, meta_json) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(metric)
        .bind(value)
        .bind(timestamp.timestamp())
        .bind(meta.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM checkpoints WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AuditStatus;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store(tmp: &TempDir) -> SqliteStore {
        let pool = db::connect_path(&tmp.path().join("opsync.sqlite"))
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        migrate::apply(store.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let a = store
            .get_or_create_entity("task", "T1", Some("Close books"))
            .await
            .unwrap();
        let b = store.get_or_create_entity("task", "T1", None).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.title.as_deref(), Some("Close books"));
    }

    #[tokio::test]
    async fn test_upsert_reports_hash_transition() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let mut upsert = EntityUpsert {
            entity_type: "client".into(),
            canonical_id: "C1".into(),
            title: Some("Acme".into()),
            metadata: json!({"tier": "gold"}),
            content: "v1".into(),
        };
        let first = store.upsert_entity(&upsert).await.unwrap();
        assert_eq!(first.prev_hash, None);

        upsert.content = "v2".into();
        let second = store.upsert_entity(&upsert).await.unwrap();
        assert_eq!(second.entity_id, first.entity_id);
        assert_eq!(second.prev_hash.as_deref(), Some(first.new_hash.as_str()));
        assert!(second.changed());

        let found = store.find_entity("C1").await.unwrap().unwrap();
        assert_eq!(found.metadata["tier"], "gold");
    }

    #[tokio::test]
    async fn test_edges_keep_insertion_order() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        for target in ["B", "C", "D"] {
            store
                .insert_edge(&NewEdge {
                    from_id: "A".into(),
                    from_type: "task".into(),
                    to_id: target.into(),
                    to_type: "task".into(),
                    relation_type: "related_to".into(),
                })
                .await
                .unwrap();
        }
        let out: Vec<_> = store
            .edges_from("A")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.to_id)
            .collect();
        assert_eq!(out, vec!["B", "C", "D"]);
        assert!(store.edge_exists("A", "C", "related_to").await.unwrap());
        assert!(!store.edge_exists("C", "A", "related_to").await.unwrap());
        assert_eq!(store.edges_to("D").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_upsert() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        assert_eq!(store.get("sync:tasks").await.unwrap(), None);
        store.set("sync:tasks", "2025-01-01T00:00:00Z").await.unwrap();
        store.set("sync:tasks", "2025-01-02T00:00:00Z").await.unwrap();
        assert_eq!(
            store.get("sync:tasks").await.unwrap().as_deref(),
            Some("2025-01-02T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_audit_and_telemetry_rows() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store
            .log(&AuditEntry {
                identity: "system".into(),
                action: "sync.run".into(),
                target_type: "system".into(),
                target_id: "sync_engine".into(),
                target_label: None,
                metadata: json!({"tasks": {"identical": 1}}),
                status: AuditStatus::Success,
                error_message: None,
            })
            .await
            .unwrap();
        store
            .add("sync_jobs", 1, Utc::now(), json!({"mode": "full"}))
            .await
            .unwrap();

        let audits: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let metrics: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM system_telemetry WHERE metric = 'sync_jobs'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!((audits, metrics), (1, 1));
    }
}

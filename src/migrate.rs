use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Entities (the graph's nodes and the sync index target)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity (
            id TEXT PRIMARY KEY,
            canonical_id TEXT NOT NULL UNIQUE,
            entity_type TEXT NOT NULL,
            title TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            content TEXT,
            content_hash TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Edges. No foreign keys: deleting an entity must not cascade.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_relation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_canonical TEXT NOT NULL,
            from_type TEXT NOT NULL,
            to_canonical TEXT NOT NULL,
            to_type TEXT NOT NULL,
            relation_type TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id TEXT PRIMARY KEY,
            actor_id TEXT NOT NULL,
            action TEXT NOT NULL,
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            target_label TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL,
            error_message TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS system_telemetry (
            id TEXT PRIMARY KEY,
            metric TEXT NOT NULL,
            value INTEGER NOT NULL,
            timestamp INTEGER NOT NULL,
            meta_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entity_type ON entity(entity_type)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_relation_from ON entity_relation(from_canonical)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_relation_to ON entity_relation(to_canonical, relation_type)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_telemetry_metric ON system_telemetry(metric, timestamp DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

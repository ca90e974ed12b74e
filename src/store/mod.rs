//! Storage collaborators consumed by the sync core.
//!
//! The engine and the graph service never touch a database directly; they
//! talk to these narrow async traits:
//!
//! | Trait | Used by |
//! |-------|---------|
//! | [`EntityStore`] | entity index hook, [`RelationshipGraphService`](crate::graph::RelationshipGraphService) |
//! | [`AuditSink`] | one `sync.run` entry per pass, relation writes |
//! | [`TelemetrySink`] | `sync_jobs` / `entity_relations` counters |
//! | [`CheckpointStore`] | incremental (`fast`) sync cursors |
//!
//! [`SqliteStore`](sqlite::SqliteStore) implements all four on top of the
//! sqlx pool; [`InMemoryStore`](memory::InMemoryStore) does the same in
//! process memory for tests and embedding.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// A persisted entity. `canonical_id` is the global identifier edges use.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub id: String,
    pub canonical_id: String,
    pub entity_type: String,
    pub title: Option<String>,
    pub metadata: Value,
    pub content_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Input to [`EntityStore::upsert_entity`].
#[derive(Debug, Clone)]
pub struct EntityUpsert {
    pub entity_type: String,
    pub canonical_id: String,
    pub title: Option<String>,
    pub metadata: Value,
    pub content: String,
}

impl EntityUpsert {
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Result of an upsert: the entity id and the content hash before and after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub entity_id: String,
    pub prev_hash: Option<String>,
    pub new_hash: String,
}

impl UpsertOutcome {
    pub fn changed(&self) -> bool {
        self.prev_hash.as_deref() != Some(self.new_hash.as_str())
    }
}

/// A directed, typed edge between two entities, keyed by canonical ids.
/// Type tags are captured at creation time and never re-validated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationshipEdge {
    /// Store-assigned, increasing with insertion order.
    pub id: i64,
    pub from_id: String,
    pub from_type: String,
    pub to_id: String,
    pub to_type: String,
    pub relation_type: String,
    pub created_at: DateTime<Utc>,
}

/// An edge to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEdge {
    pub from_id: String,
    pub from_type: String,
    pub to_id: String,
    pub to_type: String,
    pub relation_type: String,
}

impl NewEdge {
    pub fn between(from: &Entity, to: &Entity, relation_type: &str) -> Self {
        Self {
            from_id: from.canonical_id.clone(),
            from_type: from.entity_type.clone(),
            to_id: to.canonical_id.clone(),
            to_type: to.entity_type.clone(),
            relation_type: relation_type.to_string(),
        }
    }

    /// The same edge pointing the other way, tagged `relation_type`.
    pub fn reversed(&self, relation_type: &str) -> Self {
        Self {
            from_id: self.to_id.clone(),
            from_type: self.to_type.clone(),
            to_id: self.from_id.clone(),
            to_type: self.from_type.clone(),
            relation_type: relation_type.to_string(),
        }
    }
}

impl From<&RelationshipEdge> for NewEdge {
    fn from(edge: &RelationshipEdge) -> Self {
        Self {
            from_id: edge.from_id.clone(),
            from_type: edge.from_type.clone(),
            to_id: edge.to_id.clone(),
            to_type: edge.to_type.clone(),
            relation_type: edge.relation_type.clone(),
        }
    }
}

/// Entity and edge persistence.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_or_create_entity(
        &self,
        entity_type: &str,
        canonical_id: &str,
        title: Option<&str>,
    ) -> Result<Entity>;

    async fn upsert_entity(&self, upsert: &EntityUpsert) -> Result<UpsertOutcome>;

    async fn find_entity(&self, canonical_id: &str) -> Result<Option<Entity>>;

    /// All entities, or only those of `entity_type`.
    async fn list_entities(&self, entity_type: Option<&str>) -> Result<Vec<Entity>>;

    async fn insert_edge(&self, edge: &NewEdge) -> Result<RelationshipEdge>;

    async fn edge_exists(&self, from_id: &str, to_id: &str, relation_type: &str) -> Result<bool>;

    /// Outgoing edges of `canonical_id`, in insertion order.
    async fn edges_from(&self, canonical_id: &str) -> Result<Vec<RelationshipEdge>>;

    /// Incoming edges of `canonical_id`, in insertion order.
    async fn edges_to(&self, canonical_id: &str) -> Result<Vec<RelationshipEdge>>;

    async fn all_edges(&self) -> Result<Vec<RelationshipEdge>>;
}

/// One audit log row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub identity: String,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub target_label: Option<String>,
    pub metadata: Value,
    pub status: AuditStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Failure => "failure",
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log(&self, entry: &AuditEntry) -> Result<()>;
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn add(&self, metric: &str, value: i64, timestamp: DateTime<Utc>, meta: Value)
        -> Result<()>;
}

/// Persisted key/value cursors. `set` must be an atomic upsert.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str, ty: &str) -> Entity {
        Entity {
            id: format!("uuid-{}", id),
            canonical_id: id.to_string(),
            entity_type: ty.to_string(),
            title: None,
            metadata: json!({}),
            content_hash: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_reversed_edge_swaps_endpoints_and_types() {
        let edge = NewEdge::between(&entity("T1", "task"), &entity("C1", "client"), "belongs_to");
        let inverse = edge.reversed("includes");
        assert_eq!(inverse.from_id, "C1");
        assert_eq!(inverse.from_type, "client");
        assert_eq!(inverse.to_id, "T1");
        assert_eq!(inverse.to_type, "task");
        assert_eq!(inverse.relation_type, "includes");
    }

    #[test]
    fn test_upsert_outcome_changed() {
        let fresh = UpsertOutcome {
            entity_id: "e".into(),
            prev_hash: None,
            new_hash: "h".into(),
        };
        assert!(fresh.changed());
        let same = UpsertOutcome {
            prev_hash: Some("h".into()),
            ..fresh
        };
        assert!(!same.changed());
    }
}

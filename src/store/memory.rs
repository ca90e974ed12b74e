//! In-memory store for tests and embedding.
//!
//! Everything lives behind `std::sync::RwLock`; no lock is held across an
//! `.await`. Besides the four store traits it exposes a few inspection
//! helpers (`audit_entries`, `metrics`, `delete_entity`) that the SQLite
//! store has no need for.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{
    AuditEntry, AuditSink, CheckpointStore, Entity, EntityStore, EntityUpsert, NewEdge,
    RelationshipEdge, TelemetrySink, UpsertOutcome,
};
use crate::error::{Result, SyncError};

/// One recorded telemetry sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub metric: String,
    pub value: i64,
    pub timestamp: DateTime<Utc>,
    pub meta: Value,
}

pub struct InMemoryStore {
    entities: RwLock<HashMap<String, Entity>>,
    edges: RwLock<Vec<RelationshipEdge>>,
    audit: RwLock<Vec<AuditEntry>>,
    metrics: RwLock<Vec<MetricSample>>,
    checkpoints: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            edges: RwLock::new(Vec::new()),
            audit: RwLock::new(Vec::new()),
            metrics: RwLock::new(Vec::new()),
            checkpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Remove an entity without touching its edges.
    pub fn delete_entity(&self, canonical_id: &str) -> bool {
        match self.entities.write() {
            Ok(mut entities) => entities.remove(canonical_id).is_some(),
            Err(_) => false,
        }
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.read().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn metrics(&self) -> Vec<MetricSample> {
        self.metrics.read().map(|m| m.clone()).unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> SyncError {
    SyncError::StoreUnavailable("in-memory store lock poisoned".into())
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn get_or_create_entity(
        &self,
        entity_type: &str,
        canonical_id: &str,
        title: Option<&str>,
    ) -> Result<Entity> {
        let mut entities = self.entities.write().map_err(poisoned)?;
        let entity = entities
            .entry(canonical_id.to_string())
            .or_insert_with(|| Entity {
                id: Uuid::new_v4().to_string(),
                canonical_id: canonical_id.to_string(),
                entity_type: entity_type.to_string(),
                title: title.map(str::to_string),
                metadata: serde_json::json!({}),
                content_hash: None,
                updated_at: Utc::now(),
            });
        Ok(entity.clone())
    }

    async fn upsert_entity(&self, upsert: &EntityUpsert) -> Result<UpsertOutcome> {
        let mut entities = self.entities.write().map_err(poisoned)?;
        let new_hash = upsert.content_hash();
        let (entity_id, prev_hash) = match entities.get(&upsert.canonical_id) {
            Some(existing) => (existing.id.clone(), existing.content_hash.clone()),
            None => (Uuid::new_v4().to_string(), None),
        };
        entities.insert(
            upsert.canonical_id.clone(),
            Entity {
                id: entity_id.clone(),
                canonical_id: upsert.canonical_id.clone(),
                entity_type: upsert.entity_type.clone(),
                title: upsert.title.clone(),
                metadata: upsert.metadata.clone(),
                content_hash: Some(new_hash.clone()),
                updated_at: Utc::now(),
            },
        );
        Ok(UpsertOutcome {
            entity_id,
            prev_hash,
            new_hash,
        })
    }

    async fn find_entity(&self, canonical_id: &str) -> Result<Option<Entity>> {
        let entities = self.entities.read().map_err(poisoned)?;
        Ok(entities.get(canonical_id).cloned())
    }

    async fn list_entities(&self, entity_type: Option<&str>) -> Result<Vec<Entity>> {
        let entities = self.entities.read().map_err(poisoned)?;
        let mut out: Vec<Entity> = entities
            .values()
            .filter(|e| entity_type.map_or(true, |ty| e.entity_type == ty))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
        Ok(out)
    }

    async fn insert_edge(&self, edge: &NewEdge) -> Result<RelationshipEdge> {
        let mut edges = self.edges.write().map_err(poisoned)?;
        let stored = RelationshipEdge {
            id: edges.len() as i64 + 1,
            from_id: edge.from_id.clone(),
            from_type: edge.from_type.clone(),
            to_id: edge.to_id.clone(),
            to_type: edge.to_type.clone(),
            relation_type: edge.relation_type.clone(),
            created_at: Utc::now(),
        };
        edges.push(stored.clone());
        Ok(stored)
    }

    async fn edge_exists(&self, from_id: &str, to_id: &str, relation_type: &str) -> Result<bool> {
        let edges = self.edges.read().map_err(poisoned)?;
        Ok(edges
            .iter()
            .any(|e| e.from_id == from_id && e.to_id == to_id && e.relation_type == relation_type))
    }

    async fn edges_from(&self, canonical_id: &str) -> Result<Vec<RelationshipEdge>> {
        let edges = self.edges.read().map_err(poisoned)?;
        Ok(edges
            .iter()
            .filter(|e| e.from_id == canonical_id)
            .cloned()
            .collect())
    }

    async fn edges_to(&self, canonical_id: &str) -> Result<Vec<RelationshipEdge>> {
        let edges = self.edges.read().map_err(poisoned)?;
        Ok(edges
            .iter()
            .filter(|e| e.to_id == canonical_id)
            .cloned()
            .collect())
    }

    async fn all_edges(&self) -> Result<Vec<RelationshipEdge>> {
        Ok(self.edges.read().map_err(poisoned)?.clone())
    }
}

#[async_trait]
impl AuditSink for InMemoryStore {
    async fn log(&self, entry: &AuditEntry) -> Result<()> {
        self.audit.write().map_err(poisoned)?.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for InMemoryStore {
    async fn add(
        &self,
        metric: &str,
        value: i64,
        timestamp: DateTime<Utc>,
        meta: Value,
    ) -> Result<()> {
        self.metrics.write().map_err(poisoned)?.push(MetricSample {
            metric: metric.to_string(),
            value,
            timestamp,
            meta,
        });
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.checkpoints.read().map_err(poisoned)?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.checkpoints
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_keeps_edges() {
        let store = InMemoryStore::new();
        let a = store.get_or_create_entity("task", "A", None).await.unwrap();
        let b = store.get_or_create_entity("client", "B", None).await.unwrap();
        store
            .insert_edge(&NewEdge::between(&a, &b, "belongs_to"))
            .await
            .unwrap();

        assert!(store.delete_entity("B"));
        assert!(store.find_entity("B").await.unwrap().is_none());
        assert_eq!(store.edges_to("B").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_entities_filters_by_type() {
        let store = InMemoryStore::new();
        store.get_or_create_entity("task", "T2", None).await.unwrap();
        store.get_or_create_entity("task", "T1", None).await.unwrap();
        store.get_or_create_entity("client", "C1", None).await.unwrap();

        let tasks: Vec<_> = store
            .list_entities(Some("task"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.canonical_id)
            .collect();
        assert_eq!(tasks, vec!["T1", "T2"]);
        assert_eq!(store.list_entities(None).await.unwrap().len(), 3);
    }
}

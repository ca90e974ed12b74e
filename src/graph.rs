//! Typed entity relationships.
//!
//! Edges are directed and append-only. Adding an edge whose type has a
//! known inverse also adds the companion edge pointing the other way, at
//! most once. Edges are never removed when an entity disappears; the
//! [`audit`](RelationshipGraphService::audit) reports them as broken links
//! instead.
//!
//! # Inverse Relations
//!
//! | Relation | Inverse |
//! |----------|---------|
//! | `belongs_to` | `includes` |
//! | `part_of` | `contains` |
//! | `subtask_of` | `includes` |
//! | `depends_on` | `supports` |
//! | `drives` | `driven_by` |
//! | `output_of` | `produces` |
//! | `owned_by` | `owns` |
//! | `related_to` | `related_to` |

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::GraphConfig;
use crate::error::{Result, SyncError};
use crate::store::{
    AuditEntry, AuditSink, AuditStatus, Entity, EntityStore, NewEdge, RelationshipEdge,
    TelemetrySink,
};

pub const INVERSE_RELATIONS: &[(&str, &str)] = &[
    ("belongs_to", "includes"),
    ("part_of", "contains"),
    ("related_to", "related_to"),
    ("subtask_of", "includes"),
    ("depends_on", "supports"),
    ("drives", "driven_by"),
    ("output_of", "produces"),
    ("owned_by", "owns"),
];

pub const RELATION_ADD_ACTION: &str = "entity.relation.add";

pub const RELATIONS_METRIC: &str = "entity_relations";

/// Inverse of `relation_type`, if it has one.
pub fn inverse_of(relation_type: &str) -> Option<&'static str> {
    INVERSE_RELATIONS
        .iter()
        .find(|(forward, _)| *forward == relation_type)
        .map(|(_, inverse)| *inverse)
}

/// Which entities must be linked, and to what, for the orphan audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditPolicy {
    pub linkable_type: String,
    pub required_target_types: Vec<String>,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self::from(&GraphConfig::default())
    }
}

impl From<&GraphConfig> for AuditPolicy {
    fn from(config: &GraphConfig) -> Self {
        Self {
            linkable_type: config.linkable_type.clone(),
            required_target_types: config.required_target_types.clone(),
        }
    }
}

/// Outgoing and incoming edges of one entity, each in insertion order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityRelations {
    pub outgoing: Vec<RelationshipEdge>,
    pub incoming: Vec<RelationshipEdge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub depth: usize,
    pub edges: Vec<RelationshipEdge>,
}

/// Breadth-first neighbourhood of a root entity. `nodes` is in visit order.
#[derive(Debug, Clone, Serialize)]
pub struct RelationGraph {
    pub root: String,
    pub depth: usize,
    pub nodes: Vec<GraphNode>,
}

impl RelationGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn edges_of(&self, id: &str) -> Option<&[RelationshipEdge]> {
        self.node(id).map(|n| n.edges.as_slice())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelationAudit {
    pub orphans: Vec<Entity>,
    pub broken_links: Vec<RelationshipEdge>,
}

impl RelationAudit {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.broken_links.is_empty()
    }
}

pub struct RelationshipGraphService {
    store: Arc<dyn EntityStore>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    identity: String,
    policy: AuditPolicy,
}

impl RelationshipGraphService {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            audit_sink: None,
            telemetry: None,
            identity: "system".to_string(),
            policy: AuditPolicy::default(),
        }
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_policy(mut self, policy: AuditPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Insert `from -[relation_type]-> to` plus its inverse when one is
    /// defined and missing.
    ///
    /// The forward edge is always inserted, so calling this twice with the
    /// same arguments stores two forward edges (and still one inverse).
    pub async fn add_relation(
        &self,
        from: &Entity,
        to: &Entity,
        relation_type: &str,
    ) -> Result<RelationshipEdge> {
        if relation_type.trim().is_empty() {
            return Err(SyncError::Config("relation type must not be empty".into()));
        }

        let edge = self
            .store
            .insert_edge(&NewEdge::between(from, to, relation_type))
            .await?;
        debug!(
            from = %edge.from_id,
            to = %edge.to_id,
            relation_type,
            "relation added"
        );

        self.log_relation_add(from, to, relation_type).await;
        self.create_inverse_if_needed(&edge).await?;
        Ok(edge)
    }

    /// Insert the inverse of `edge` unless its type has none or the exact
    /// `(to, from, inverse)` edge already exists.
    pub async fn create_inverse_if_needed(
        &self,
        edge: &RelationshipEdge,
    ) -> Result<Option<RelationshipEdge>> {
        let Some(inverse) = inverse_of(&edge.relation_type) else {
            return Ok(None);
        };
        if self
            .store
            .edge_exists(&edge.to_id, &edge.from_id, inverse)
            .await?
        {
            return Ok(None);
        }

        let reversed = NewEdge::from(edge).reversed(inverse);
        Ok(Some(self.store.insert_edge(&reversed).await?))
    }

    pub async fn get_relations_for_entity(&self, canonical_id: &str) -> Result<EntityRelations> {
        let outgoing = self.store.edges_from(canonical_id).await?;
        let incoming = self.store.edges_to(canonical_id).await?;
        Ok(EntityRelations { outgoing, incoming })
    }

    /// Edges of `relation_type` pointing at `canonical_id`.
    pub async fn find_relations(
        &self,
        relation_type: &str,
        canonical_id: &str,
    ) -> Result<Vec<RelationshipEdge>> {
        Ok(self
            .store
            .edges_to(canonical_id)
            .await?
            .into_iter()
            .filter(|e| e.relation_type == relation_type)
            .collect())
    }

    /// Breadth-first walk over outgoing edges from `canonical_id`.
    ///
    /// Every reachable node within `depth` hops appears once, at its
    /// shortest distance. Nodes at exactly `depth` list their edges but
    /// their targets are not visited.
    pub async fn graph(&self, canonical_id: &str, depth: usize) -> Result<RelationGraph> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        let mut nodes = Vec::new();

        visited.insert(canonical_id.to_string());
        queue.push_back((canonical_id.to_string(), 0));

        while let Some((id, d)) = queue.pop_front() {
            let edges = self.store.edges_from(&id).await?;
            if d < depth {
                for edge in &edges {
                    if visited.insert(edge.to_id.clone()) {
                        queue.push_back((edge.to_id.clone(), d + 1));
                    }
                }
            }
            nodes.push(GraphNode {
                id,
                depth: d,
                edges,
            });
        }

        Ok(RelationGraph {
            root: canonical_id.to_string(),
            depth,
            nodes,
        })
    }

    /// Find orphans (linkable entities with no edge to a required target
    /// type) and broken links (edges whose target entity is missing).
    pub async fn audit(&self) -> Result<RelationAudit> {
        let mut report = RelationAudit::default();

        for entity in self
            .store
            .list_entities(Some(&self.policy.linkable_type))
            .await?
        {
            let linked = self
                .store
                .edges_from(&entity.canonical_id)
                .await?
                .iter()
                .any(|e| self.policy.required_target_types.contains(&e.to_type));
            if !linked {
                report.orphans.push(entity);
            }
        }

        let known: HashSet<String> = self
            .store
            .list_entities(None)
            .await?
            .into_iter()
            .map(|e| e.canonical_id)
            .collect();
        report.broken_links = self
            .store
            .all_edges()
            .await?
            .into_iter()
            .filter(|e| !known.contains(&e.to_id))
            .collect();

        info!(
            orphans = report.orphans.len(),
            broken = report.broken_links.len(),
            "relationship audit complete"
        );

        if let Some(telemetry) = &self.telemetry {
            let total = (report.orphans.len() + report.broken_links.len()) as i64;
            let meta = json!({
                "orphans": report.orphans.len(),
                "broken": report.broken_links.len(),
            });
            if let Err(e) = telemetry.add(RELATIONS_METRIC, total, Utc::now(), meta).await {
                warn!(error = %e, "telemetry write failed");
            }
        }

        Ok(report)
    }

    async fn log_relation_add(&self, from: &Entity, to: &Entity, relation_type: &str) {
        let Some(sink) = &self.audit_sink else {
            return;
        };
        let entry = AuditEntry {
            identity: self.identity.clone(),
            action: RELATION_ADD_ACTION.to_string(),
            target_type: "entity".to_string(),
            target_id: from.canonical_id.clone(),
            target_label: Some(format!("{}:{}", from.entity_type, from.canonical_id)),
            metadata: json!({
                "to_entity": to.canonical_id,
                "relation_type": relation_type,
            }),
            status: AuditStatus::Success,
            error_message: None,
        };
        if let Err(e) = sink.log(&entry).await {
            warn!(error = %e, "audit write failed");
        }
    }
}

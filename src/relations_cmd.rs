//! `opsync relations add|get|find|graph|audit`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::graph::{AuditPolicy, EntityRelations, RelationAudit, RelationGraph, RelationshipGraphService};
use crate::store::sqlite::SqliteStore;
use crate::store::{EntityStore, RelationshipEdge};

async fn open(config: &Config) -> Result<(RelationshipGraphService, Arc<SqliteStore>)> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let service = RelationshipGraphService::new(store.clone())
        .with_audit(store.clone())
        .with_telemetry(store.clone())
        .with_identity(config.sync.identity.clone())
        .with_policy(AuditPolicy::from(&config.graph));
    Ok((service, store))
}

/// Titles of every entity an edge list touches, for display.
async fn titles_for(
    store: &dyn EntityStore,
    edges: &[&RelationshipEdge],
) -> Result<HashMap<String, String>> {
    let mut titles = HashMap::new();
    for edge in edges {
        for id in [&edge.from_id, &edge.to_id] {
            if titles.contains_key(id) {
                continue;
            }
            if let Some(entity) = store.find_entity(id).await? {
                titles.insert(id.clone(), entity.title.unwrap_or_default());
            }
        }
    }
    Ok(titles)
}

pub async fn run_add(config: &Config, from: &str, to: &str, relation_type: &str) -> Result<()> {
    let (service, store) = open(config).await?;
    let from_entity = store
        .find_entity(from)
        .await?
        .with_context(|| format!("entity '{}' not found", from))?;
    let to_entity = store
        .find_entity(to)
        .await?
        .with_context(|| format!("entity '{}' not found", to))?;

    let edge = service
        .add_relation(&from_entity, &to_entity, relation_type)
        .await?;
    println!("{} ──{}→ {}", edge.from_id, edge.relation_type, edge.to_id);
    store.close().await;
    Ok(())
}

pub async fn run_get(config: &Config, canonical_id: &str) -> Result<()> {
    let (service, store) = open(config).await?;
    let relations = service.get_relations_for_entity(canonical_id).await?;
    let edges: Vec<&RelationshipEdge> = relations
        .outgoing
        .iter()
        .chain(relations.incoming.iter())
        .collect();
    let titles = titles_for(store.as_ref(), &edges).await?;
    print!("{}", render_relations(canonical_id, &relations, &titles));
    store.close().await;
    Ok(())
}

pub async fn run_find(config: &Config, relation_type: &str, canonical_id: &str) -> Result<()> {
    let (service, store) = open(config).await?;
    let edges = service.find_relations(relation_type, canonical_id).await?;
    print!("{}", render_find(relation_type, canonical_id, &edges));
    store.close().await;
    Ok(())
}

pub async fn run_graph(config: &Config, canonical_id: &str, depth: Option<usize>) -> Result<()> {
    let (service, store) = open(config).await?;
    let depth = depth.unwrap_or(config.graph.default_depth);
    let graph = service.graph(canonical_id, depth).await?;
    print!("{}", render_graph(&graph));
    store.close().await;
    Ok(())
}

pub async fn run_audit(config: &Config) -> Result<()> {
    let (service, store) = open(config).await?;
    let audit = service.audit().await?;
    print!("{}", render_audit(&audit, &AuditPolicy::from(&config.graph)));
    store.close().await;
    Ok(())
}

pub fn render_relations(
    canonical_id: &str,
    relations: &EntityRelations,
    titles: &HashMap<String, String>,
) -> String {
    let title = |id: &str| titles.get(id).map(String::as_str).unwrap_or("");
    let mut out = String::new();
    let _ = writeln!(out, "=== Relationships for {} ===", canonical_id);
    let _ = writeln!(out, "Outgoing:");
    for r in &relations.outgoing {
        let _ = writeln!(out, "- {} {} ({})", r.relation_type, r.to_id, title(&r.to_id));
    }
    let _ = writeln!(out, "Incoming:");
    for r in &relations.incoming {
        let _ = writeln!(out, "- {} {} ({})", r.relation_type, r.from_id, title(&r.from_id));
    }
    out
}

pub fn render_find(relation_type: &str, canonical_id: &str, edges: &[RelationshipEdge]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== {} relations for {} ===", relation_type, canonical_id);
    for r in edges {
        let _ = writeln!(out, "- {} → {}", r.from_id, r.to_id);
    }
    out
}

/// Tree view rooted at `graph.root`. Branches stop at the walk depth, so
/// cycles print at most `depth` levels deep.
pub fn render_graph(graph: &RelationGraph) -> String {
    fn walk(graph: &RelationGraph, node: &str, remaining: usize, prefix: &str, out: &mut String) {
        if remaining == 0 {
            return;
        }
        let Some(edges) = graph.edges_of(node) else {
            return;
        };
        for edge in edges {
            let _ = writeln!(out, "{}{} ──{}→ {}", prefix, node, edge.relation_type, edge.to_id);
            walk(graph, &edge.to_id, remaining - 1, &format!("{}    ", prefix), out);
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "=== Relationship Graph for {} ===", graph.root);
    walk(graph, &graph.root, graph.depth, "", &mut out);
    out
}

pub fn render_audit(audit: &RelationAudit, policy: &AuditPolicy) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Relationship Audit ===");
    if audit.is_clean() {
        let _ = writeln!(out, "No orphans or broken links.");
        return out;
    }

    if !audit.orphans.is_empty() {
        let missing = policy
            .required_target_types
            .iter()
            .map(|t| format!("no {}", t))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "Orphans:");
        for o in &audit.orphans {
            let _ = writeln!(out, "  {} ({})", o.canonical_id, missing);
        }
    }
    if !audit.broken_links.is_empty() {
        let _ = writeln!(out, "Broken links:");
        for b in &audit.broken_links {
            let _ = writeln!(out, "  {} → {} (target not found)", b.from_id, b.to_id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphNode;
    use crate::store::Entity;
    use chrono::Utc;

    fn edge(id: i64, from: &str, to: &str, rel: &str) -> RelationshipEdge {
        RelationshipEdge {
            id,
            from_id: from.into(),
            from_type: "task".into(),
            to_id: to.into(),
            to_type: "task".into(),
            relation_type: rel.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_render_relations_with_titles() {
        let relations = EntityRelations {
            outgoing: vec![edge(1, "T1", "C1", "belongs_to")],
            incoming: vec![edge(2, "C1", "T1", "includes")],
        };
        let titles = HashMap::from([("C1".to_string(), "Acme".to_string())]);
        let text = render_relations("T1", &relations, &titles);
        assert_eq!(
            text,
            "=== Relationships for T1 ===\nOutgoing:\n- belongs_to C1 (Acme)\nIncoming:\n- includes C1 (Acme)\n"
        );
    }

    #[test]
    fn test_render_graph_stops_at_depth() {
        let graph = RelationGraph {
            root: "A".into(),
            depth: 2,
            nodes: vec![
                GraphNode {
                    id: "A".into(),
                    depth: 0,
                    edges: vec![edge(1, "A", "B", "drives")],
                },
                GraphNode {
                    id: "B".into(),
                    depth: 1,
                    edges: vec![edge(2, "B", "A", "driven_by")],
                },
            ],
        };
        let text = render_graph(&graph);
        assert_eq!(
            text,
            "=== Relationship Graph for A ===\nA ──drives→ B\n    B ──driven_by→ A\n"
        );
    }

    #[test]
    fn test_render_audit() {
        let audit = RelationAudit {
            orphans: vec![Entity {
                id: "u".into(),
                canonical_id: "T2".into(),
                entity_type: "task".into(),
                title: None,
                metadata: serde_json::json!({}),
                content_hash: None,
                updated_at: Utc::now(),
            }],
            broken_links: vec![edge(3, "T1", "GHOST", "mentions")],
        };
        let text = render_audit(&audit, &AuditPolicy::default());
        assert!(text.contains("  T2 (no client, no event)"));
        assert!(text.contains("  T1 → GHOST (target not found)"));

        let clean = render_audit(&RelationAudit::default(), &AuditPolicy::default());
        assert!(clean.contains("No orphans or broken links."));
    }
}

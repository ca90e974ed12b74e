//! Core data models shared by connectors, the reconciliation engine and the
//! poller.
//!
//! Every source is translated into [`CanonicalRecord`]s. A record is a dumb
//! container: `data` keeps the source's native property shape and is never
//! validated here.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Which connector produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    Remote,
    Local,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Remote => "remote",
            Source::Local => "local",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All records of a pull, grouped by table name.
pub type Snapshot = BTreeMap<String, Vec<CanonicalRecord>>;

/// Per-table `id -> content hash` maps, used for cheap change detection.
pub type Fingerprints = BTreeMap<String, BTreeMap<String, String>>;

/// The source-agnostic form of one record from one source.
///
/// The content hash is computed on first access and memoized. Mutating
/// `data` or `last_modified` through the setters drops the memo.
#[derive(Debug, Clone)]
pub struct CanonicalRecord {
    id: String,
    source: Source,
    last_modified: Option<String>,
    data: Map<String, Value>,
    hash: OnceLock<String>,
}

impl CanonicalRecord {
    pub fn new(
        id: impl Into<String>,
        source: Source,
        last_modified: Option<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            last_modified: last_modified.filter(|ts| !ts.is_empty()),
            data,
            hash: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn set_data(&mut self, data: Map<String, Value>) {
        self.data = data;
        self.hash = OnceLock::new();
    }

    /// Mutable access to `data`. Invalidates the memoized hash.
    pub fn data_mut(&mut self) -> &mut Map<String, Value> {
        self.hash = OnceLock::new();
        &mut self.data
    }

    pub fn set_last_modified(&mut self, last_modified: Option<String>) {
        self.last_modified = last_modified.filter(|ts| !ts.is_empty());
        self.hash = OnceLock::new();
    }

    /// Re-tag a copy of this record as coming from `source`.
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// SHA-256 (hex) over `(id, last_modified, data)` with object keys sorted
    /// at every level. `source` is not part of the hash.
    pub fn compute_hash(&self) -> &str {
        self.hash.get_or_init(|| {
            let mut canonical = String::new();
            canonical.push('[');
            write_canonical(&Value::String(self.id.clone()), &mut canonical);
            canonical.push(',');
            match &self.last_modified {
                Some(ts) => write_canonical(&Value::String(ts.clone()), &mut canonical),
                None => canonical.push_str("null"),
            }
            canonical.push(',');
            write_canonical_map(&self.data, &mut canonical);
            canonical.push(']');

            let mut hasher = Sha256::new();
            hasher.update(canonical.as_bytes());
            hex::encode(hasher.finalize())
        })
    }

    /// Whether the record carries an `entity_type` tag, i.e. it maps onto a
    /// persisted entity.
    pub fn entity_type(&self) -> Option<&str> {
        self.data
            .get("entity_type")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Display title, from the first of `title` / `name` that is a string.
    pub fn title(&self) -> Option<&str> {
        ["title", "name"]
            .iter()
            .find_map(|key| self.data.get(*key).and_then(|v| v.as_str()))
    }

    /// Read-only projection used for transport and audit logging.
    pub fn as_envelope(&self) -> RecordEnvelope {
        RecordEnvelope {
            id: self.id.clone(),
            source: self.source,
            last_modified: self.last_modified.clone(),
            data: self.data.clone(),
            hash: self.compute_hash().to_string(),
        }
    }
}

/// JSON shape `{id, source, last_modified, data, hash}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub id: String,
    pub source: Source,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub hash: String,
}

/// Outcome of reconciling one record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeDecision {
    KeepRemote,
    KeepLocal,
    Identical,
    RemoteOnly,
    LocalOnly,
}

impl MergeDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeDecision::KeepRemote => "keep-remote",
            MergeDecision::KeepLocal => "keep-local",
            MergeDecision::Identical => "identical",
            MergeDecision::RemoteOnly => "remote-only",
            MergeDecision::LocalOnly => "local-only",
        }
    }
}

/// Order two ISO-8601 timestamps. RFC 3339 values are compared as instants
/// so `...00.000Z` and `...00Z` agree; anything else falls back to plain
/// lexicographic order.
pub fn compare_timestamps(a: &str, b: &str) -> Ordering {
    match (
        DateTime::parse_from_rfc3339(a),
        DateTime::parse_from_rfc3339(b),
    ) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// True when `record` changed after `since`, or carries no timestamp.
pub fn is_modified_after(record: &CanonicalRecord, since: &str) -> bool {
    record
        .last_modified()
        .map_or(true, |ts| compare_timestamps(ts, since) == Ordering::Greater)
}

/// Per-table id → hash map of a snapshot.
pub fn fingerprint(snapshot: &Snapshot) -> Fingerprints {
    snapshot
        .iter()
        .map(|(table, records)| {
            let hashes = records
                .iter()
                .map(|r| (r.id().to_string(), r.compute_hash().to_string()))
                .collect();
            (table.clone(), hashes)
        })
        .collect()
}

// Keys are sorted here rather than trusting `Map` iteration order, which
// becomes insertion order if any crate in the build enables serde_json's
// `preserve_order` feature. Hashes must not depend on that.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_map(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_canonical_map(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key.as_str()], out);
    }
    out.push('}');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(data: Value) -> CanonicalRecord {
        let data = data.as_object().cloned().unwrap_or_default();
        CanonicalRecord::new(
            "rec-1",
            Source::Remote,
            Some("2025-01-01T00:00:00Z".to_string()),
            data,
        )
    }

    #[test]
    fn test_hash_deterministic() {
        let r = record(json!({"title": "Ship it", "status": "open"}));
        let first = r.compute_hash().to_string();
        assert_eq!(first, r.compute_hash());
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_hash_ignores_key_order_and_source() {
        let mut a = Map::new();
        a.insert("b".into(), json!({"y": 1, "x": 2}));
        a.insert("a".into(), json!("one"));
        let mut b = Map::new();
        b.insert("a".into(), json!("one"));
        b.insert("b".into(), json!({"x": 2, "y": 1}));

        let ra = CanonicalRecord::new("id", Source::Remote, None, a);
        let rb = CanonicalRecord::new("id", Source::Local, None, b);
        assert_eq!(ra.compute_hash(), rb.compute_hash());
    }

    #[test]
    fn test_data_change_changes_hash() {
        let mut r = record(json!({"title": "Ship it"}));
        let before = r.compute_hash().to_string();
        r.data_mut().insert("title".into(), json!("Ship it now"));
        assert_ne!(before, r.compute_hash());

        let mut r2 = record(json!({"title": "Ship it"}));
        r2.set_data(Map::new());
        assert_ne!(before, r2.compute_hash());
    }

    #[test]
    fn test_timestamp_change_changes_hash() {
        let mut r = record(json!({"title": "Ship it"}));
        let before = r.compute_hash().to_string();
        r.set_last_modified(Some("2025-02-01T00:00:00Z".into()));
        assert_ne!(before, r.compute_hash());
    }

    #[test]
    fn test_empty_timestamp_is_absent() {
        let r = CanonicalRecord::new("x", Source::Local, Some(String::new()), Map::new());
        assert_eq!(r.last_modified(), None);
    }

    #[test]
    fn test_envelope_shape() {
        let r = record(json!({"title": "Ship it"}));
        let env = serde_json::to_value(r.as_envelope()).unwrap();
        assert_eq!(env["id"], "rec-1");
        assert_eq!(env["source"], "remote");
        assert_eq!(env["last_modified"], "2025-01-01T00:00:00Z");
        assert_eq!(env["data"]["title"], "Ship it");
        assert_eq!(env["hash"], r.compute_hash());
    }

    #[test]
    fn test_entity_type_and_title() {
        let r = record(json!({"entity_type": "task", "name": "Quarterly close"}));
        assert_eq!(r.entity_type(), Some("task"));
        assert_eq!(r.title(), Some("Quarterly close"));
        assert_eq!(record(json!({})).entity_type(), None);
    }

    #[test]
    fn test_compare_timestamps_as_instants() {
        assert_eq!(
            compare_timestamps("2025-01-02T00:00:00.000Z", "2025-01-02T00:00:00Z"),
            Ordering::Equal
        );
        assert_eq!(
            compare_timestamps("2025-01-02T00:00:00Z", "2025-01-01T23:00:00+02:00"),
            Ordering::Greater
        );
        assert_eq!(compare_timestamps("b", "a"), Ordering::Greater);
    }

    #[test]
    fn test_modified_after_includes_untimestamped() {
        let old = record(json!({}));
        assert!(!is_modified_after(&old, "2025-06-01T00:00:00Z"));
        assert!(is_modified_after(&old, "2024-12-31T00:00:00Z"));
        let bare = CanonicalRecord::new("y", Source::Local, None, Map::new());
        assert!(is_modified_after(&bare, "2099-01-01T00:00:00Z"));
    }

    #[test]
    fn test_decision_serializes_kebab_case() {
        let v = serde_json::to_value(MergeDecision::RemoteOnly).unwrap();
        assert_eq!(v, "remote-only");
        assert_eq!(MergeDecision::KeepLocal.as_str(), "keep-local");
    }
}

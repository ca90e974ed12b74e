//! Local mirror connector.
//!
//! Each table is a JSON array file `<state_dir>/<table>.json` whose elements
//! look like `{"id": "...", "last_modified": "...", "data": {...}}`. A table
//! whose file does not exist is simply empty. Pushes upsert by id and
//! rewrite the whole file through a temporary file and a rename, so readers
//! never observe a half-written table.
//!
//! Table discovery walks the top level of the state directory and applies
//! the configured include/exclude globs to file names.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::LocalConnectorConfig;
use crate::connector::{with_backoff, Attempt, Connector, IdRemap, PushReport, RetryPolicy};
use crate::error::{RecordError, Result, SyncError};
use crate::models::{CanonicalRecord, Snapshot, Source};

const TABLE_EXTENSION: &str = "json";

/// On-disk shape of one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalRow {
    #[serde(default)]
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
    #[serde(default)]
    data: Map<String, Value>,
}

impl From<&CanonicalRecord> for LocalRow {
    fn from(record: &CanonicalRecord) -> Self {
        Self {
            id: record.id().to_string(),
            last_modified: record.last_modified().map(str::to_string),
            data: record.data().clone(),
        }
    }
}

pub struct LocalConnector {
    name: String,
    state_dir: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    retry: RetryPolicy,
}

impl LocalConnector {
    pub fn new(config: &LocalConnectorConfig) -> Result<Self> {
        Ok(Self {
            name: "local".to_string(),
            state_dir: config.state_dir.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&config.exclude_globs)?,
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.backoff_base_ms),
            ),
        })
    }

    fn table_path(&self, table: &str) -> Result<PathBuf> {
        let valid = !table.is_empty()
            && table != "."
            && table != ".."
            && !table.contains(['/', '\\']);
        if !valid {
            return Err(SyncError::unavailable(
                &self.name,
                format!("invalid table name '{}'", table),
            ));
        }
        Ok(self
            .state_dir
            .join(format!("{}.{}", table, TABLE_EXTENSION)))
    }

    async fn read_rows(&self, table: &str) -> Result<Vec<LocalRow>> {
        let path = self.table_path(table)?;
        let bytes = with_backoff(&self.name, self.retry, || {
            let path = path.clone();
            async move {
                match tokio::fs::read(&path).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(classify_io(&path, e)),
                }
            }
        })
        .await?;

        let Some(bytes) = bytes else {
            return Ok(Vec::new());
        };

        let rows: Vec<LocalRow> = serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::unavailable(
                &self.name,
                format!("{}: not a record array: {}", path.display(), e),
            )
        })?;

        Ok(rows
            .into_iter()
            .filter(|row| {
                if row.id.is_empty() {
                    warn!(table, path = %path.display(), "skipping record without id");
                    false
                } else {
                    true
                }
            })
            .collect())
    }

    async fn write_rows(&self, table: &str, rows: &[LocalRow]) -> Result<()> {
        let path = self.table_path(table)?;
        let tmp = path.with_extension(format!("{}.tmp", TABLE_EXTENSION));
        let body = serde_json::to_vec_pretty(rows)
            .map_err(|e| SyncError::unavailable(&self.name, e))?;

        with_backoff(&self.name, self.retry, || {
            let (path, tmp, body) = (path.clone(), tmp.clone(), body.clone());
            async move {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| classify_io(parent, e))?;
                }
                tokio::fs::write(&tmp, &body)
                    .await
                    .map_err(|e| classify_io(&tmp, e))?;
                tokio::fs::rename(&tmp, &path)
                    .await
                    .map_err(|e| classify_io(&path, e))
            }
        })
        .await?;

        debug!(table, path = %path.display(), records = rows.len(), "table file rewritten");
        Ok(())
    }

    fn to_record(row: LocalRow) -> CanonicalRecord {
        CanonicalRecord::new(row.id, Source::Local, row.last_modified, row.data)
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> Source {
        Source::Local
    }

    async fn tables(&self) -> Result<Vec<String>> {
        if !self.state_dir.exists() {
            return Ok(Vec::new());
        }

        let mut tables = BTreeSet::new();
        let walker = WalkDir::new(&self.state_dir).min_depth(1).max_depth(1);
        for entry in walker {
            let entry = entry.map_err(|e| SyncError::unavailable(&self.name, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TABLE_EXTENSION) {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if self.exclude.is_match(&*file_name) || !self.include.is_match(&*file_name) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                tables.insert(stem.to_string());
            }
        }

        Ok(tables.into_iter().collect())
    }

    async fn pull(&self, table: Option<&str>) -> Result<Snapshot> {
        let tables = match table {
            Some(t) => vec![t.to_string()],
            None => self.tables().await?,
        };

        let mut snapshot = Snapshot::new();
        for name in tables {
            let records = self
                .read_rows(&name)
                .await?
                .into_iter()
                .map(Self::to_record)
                .collect();
            snapshot.insert(name, records);
        }
        Ok(snapshot)
    }

    async fn push(&self, records: &[CanonicalRecord], table: &str) -> Result<PushReport> {
        let mut report = PushReport::new(&self.name, table, records.len());
        if records.is_empty() {
            return Ok(report);
        }

        let mut rows = self.read_rows(table).await?;
        let mut positions: HashMap<String, usize> = rows
            .iter()
            .enumerate()
            .map(|(i, row)| (row.id.clone(), i))
            .collect();

        for record in records {
            if record.id().is_empty() {
                report.record_failure(RecordError::new("", "record has no id"));
                continue;
            }
            let row = LocalRow::from(record);
            match positions.get(record.id()) {
                Some(&i) => rows[i] = row,
                None => {
                    positions.insert(row.id.clone(), rows.len());
                    rows.push(row);
                }
            }
        }

        self.write_rows(table, &rows).await?;
        Ok(report)
    }

    async fn remap_ids(&self, table: &str, remaps: &[IdRemap]) -> Result<()> {
        if remaps.is_empty() {
            return Ok(());
        }

        let mut rows = self.read_rows(table).await?;
        let taken: HashSet<String> = rows.iter().map(|row| row.id.clone()).collect();
        let renames: HashMap<&str, &str> = remaps
            .iter()
            .map(|r| (r.from.as_str(), r.to.as_str()))
            .collect();

        // A row already stored under the new id wins; the old one is dropped.
        rows.retain_mut(|row| match renames.get(row.id.as_str()) {
            Some(to) if taken.contains(*to) => false,
            Some(to) => {
                row.id = to.to_string();
                true
            }
            None => true,
        });

        self.write_rows(table, &rows).await?;
        debug!(table, renamed = remaps.len(), "local ids remapped");
        Ok(())
    }
}

fn classify_io(path: &Path, err: std::io::Error) -> Attempt {
    let reason = format!("{}: {}", path.display(), err);
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            Attempt::Retry(reason)
        }
        _ => Attempt::Fatal(reason),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SyncError::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SyncError::Config(e.to_string()))
}

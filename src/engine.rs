//! Two-way reconciliation between the remote and local connectors.
//!
//! One pass of [`ReconciliationEngine::sync`] handles each table in turn:
//!
//! ```text
//!   pull remote ─┐                                   ┌─▶ push remote (keep-local, local-only)
//!                ├─▶ union ids ─▶ resolve per id ─▶──┤
//!   pull local  ─┘                                   └─▶ push local  (keep-remote, remote-only)
//!                                                    │
//!                                                    └─▶ entity index, checkpoint
//! ```
//!
//! then writes one `sync.run` audit entry and one `sync_jobs` telemetry
//! sample for the whole pass.
//!
//! # Conflict Rules
//!
//! | Situation | Decision |
//! |-----------|----------|
//! | id on one side only | `remote-only` / `local-only` |
//! | equal content hash | `identical` |
//! | both timestamped, remote strictly later | `keep-remote` |
//! | both timestamped, otherwise | `keep-local` |
//! | only one side timestamped | that side |
//! | neither timestamped | configured winner (remote by default) |
//!
//! A failing table never aborts the pass: its [`TableReport`] carries the
//! error and the remaining tables are still synced.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connector::{Connector, DiffReport, IdRemap};
use crate::error::{Result, SyncError};
use crate::models::{compare_timestamps, CanonicalRecord, MergeDecision, Snapshot, Source};
use crate::store::{
    AuditEntry, AuditSink, AuditStatus, CheckpointStore, EntityStore, EntityUpsert, TelemetrySink,
};

/// Telemetry metric incremented once per pass.
pub const SYNC_METRIC: &str = "sync_jobs";

/// Audit action written once per pass.
pub const SYNC_ACTION: &str = "sync.run";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Pull every record of every table.
    Full,
    /// Pull only records modified after the table's checkpoint.
    Fast,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Fast => "fast",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Upper bound on every single connector call.
    pub io_timeout: Duration,
    /// Winner when neither side of a conflict carries a timestamp.
    pub untimestamped_winner: Source,
    /// Actor recorded in audit entries.
    pub identity: String,
    /// Upsert merged records carrying `entity_type` into the entity store.
    pub index_entities: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(300),
            untimestamped_winner: Source::Remote,
            identity: "system".to_string(),
            index_entities: true,
        }
    }
}

impl From<&SyncConfig> for EngineOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            io_timeout: Duration::from_secs(config.io_timeout_secs),
            untimestamped_winner: config.untimestamped_winner,
            identity: config.identity.clone(),
            index_entities: config.index_entities,
        }
    }
}

/// Number of records per decision for one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecisionCounts {
    pub keep_remote: usize,
    pub keep_local: usize,
    pub identical: usize,
    pub remote_only: usize,
    pub local_only: usize,
}

impl DecisionCounts {
    pub fn record(&mut self, decision: MergeDecision) {
        match decision {
            MergeDecision::KeepRemote => self.keep_remote += 1,
            MergeDecision::KeepLocal => self.keep_local += 1,
            MergeDecision::Identical => self.identical += 1,
            MergeDecision::RemoteOnly => self.remote_only += 1,
            MergeDecision::LocalOnly => self.local_only += 1,
        }
    }

    pub fn get(&self, decision: MergeDecision) -> usize {
        match decision {
            MergeDecision::KeepRemote => self.keep_remote,
            MergeDecision::KeepLocal => self.keep_local,
            MergeDecision::Identical => self.identical,
            MergeDecision::RemoteOnly => self.remote_only,
            MergeDecision::LocalOnly => self.local_only,
        }
    }

    pub fn total(&self) -> usize {
        self.keep_remote + self.keep_local + self.identical + self.remote_only + self.local_only
    }

    fn add(&mut self, other: &DecisionCounts) {
        self.keep_remote += other.keep_remote;
        self.keep_local += other.keep_local;
        self.identical += other.identical;
        self.remote_only += other.remote_only;
        self.local_only += other.local_only;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum TableStatus {
    Synced,
    /// Some pushed records were rejected; the rest were written.
    PartialWrite { failed_records: usize },
    Failed { error: String },
}

impl TableStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, TableStatus::Synced)
    }
}

/// Outcome of one table within a pass.
#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: String,
    pub status: TableStatus,
    pub decisions: DecisionCounts,
    /// Ids of the merged set, sorted.
    pub merged: Vec<String>,
    pub pushed_remote: usize,
    pub pushed_local: usize,
    pub indexed: usize,
    pub index_failures: usize,
}

impl TableReport {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            status: TableStatus::Synced,
            decisions: DecisionCounts::default(),
            merged: Vec::new(),
            pushed_remote: 0,
            pushed_local: 0,
            indexed: 0,
            index_failures: 0,
        }
    }
}

/// Outcome of one [`ReconciliationEngine::sync`] pass.
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub tables: BTreeMap<String, TableReport>,
}

impl MergeReport {
    pub fn is_success(&self) -> bool {
        self.tables.values().all(|t| t.status.is_ok())
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .values()
            .filter(|t| !t.status.is_ok())
            .map(|t| t.table.as_str())
            .collect()
    }

    /// Decision counts summed over every table.
    pub fn totals(&self) -> DecisionCounts {
        let mut totals = DecisionCounts::default();
        for table in self.tables.values() {
            totals.add(&table.decisions);
        }
        totals
    }
}

/// Decide between two versions of the same record id.
///
/// Timestamps are compared with [`compare_timestamps`]; the remote side
/// wins only when strictly later, so equal timestamps with different
/// content go to local.
pub fn resolve(
    remote: &CanonicalRecord,
    local: &CanonicalRecord,
    untimestamped_winner: Source,
) -> MergeDecision {
    if remote.compute_hash() == local.compute_hash() {
        return MergeDecision::Identical;
    }

    match (remote.last_modified(), local.last_modified()) {
        (Some(r), Some(l)) => {
            if compare_timestamps(r, l) == std::cmp::Ordering::Greater {
                MergeDecision::KeepRemote
            } else {
                MergeDecision::KeepLocal
            }
        }
        (Some(_), None) => MergeDecision::KeepRemote,
        (None, Some(_)) => MergeDecision::KeepLocal,
        (None, None) => match untimestamped_winner {
            Source::Remote => MergeDecision::KeepRemote,
            Source::Local => MergeDecision::KeepLocal,
        },
    }
}

/// Merge result for one table, before anything is written.
#[derive(Debug, Default)]
struct TablePlan {
    decisions: DecisionCounts,
    merged: Vec<CanonicalRecord>,
    to_remote: Vec<CanonicalRecord>,
    to_local: Vec<CanonicalRecord>,
}

fn plan_table(
    remote: Vec<CanonicalRecord>,
    local: Vec<CanonicalRecord>,
    untimestamped_winner: Source,
) -> TablePlan {
    let mut remote: BTreeMap<String, CanonicalRecord> =
        remote.into_iter().map(|r| (r.id().to_string(), r)).collect();
    let mut local: BTreeMap<String, CanonicalRecord> =
        local.into_iter().map(|r| (r.id().to_string(), r)).collect();
    let ids: BTreeSet<String> = remote.keys().chain(local.keys()).cloned().collect();

    let mut plan = TablePlan::default();
    for id in ids {
        let (decision, winner) = match (remote.remove(&id), local.remove(&id)) {
            (Some(r), None) => {
                plan.to_local.push(r.clone());
                (MergeDecision::RemoteOnly, r)
            }
            (None, Some(l)) => {
                plan.to_remote.push(l.clone());
                (MergeDecision::LocalOnly, l)
            }
            (Some(r), Some(l)) => match resolve(&r, &l, untimestamped_winner) {
                MergeDecision::KeepRemote => {
                    plan.to_local.push(r.clone());
                    (MergeDecision::KeepRemote, r)
                }
                MergeDecision::KeepLocal => {
                    plan.to_remote.push(l.clone());
                    (MergeDecision::KeepLocal, l)
                }
                other => (other, r),
            },
            (None, None) => continue,
        };
        plan.decisions.record(decision);
        plan.merged.push(winner);
    }
    plan
}

fn rekey(records: &mut [CanonicalRecord], remaps: &[IdRemap]) {
    for remap in remaps {
        if let Some(record) = records.iter_mut().find(|r| r.id() == remap.from) {
            *record = CanonicalRecord::new(
                remap.to.clone(),
                record.source(),
                record.last_modified().map(str::to_string),
                record.data().clone(),
            );
        }
    }
}

fn checkpoint_key(table: &str) -> String {
    format!("sync:{}", table)
}

/// Reconciles the remote and local connectors table by table.
pub struct ReconciliationEngine {
    remote: Arc<dyn Connector>,
    local: Arc<dyn Connector>,
    entities: Option<Arc<dyn EntityStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    options: EngineOptions,
    table_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ReconciliationEngine {
    pub fn new(remote: Arc<dyn Connector>, local: Arc<dyn Connector>) -> Self {
        Self {
            remote,
            local,
            entities: None,
            audit: None,
            telemetry: None,
            checkpoints: None,
            options: EngineOptions::default(),
            table_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_entity_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.entities = Some(store);
        self
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn remote(&self) -> &Arc<dyn Connector> {
        &self.remote
    }

    pub fn local(&self) -> &Arc<dyn Connector> {
        &self.local
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Run one reconciliation pass over `table`, or over every table either
    /// side exposes.
    ///
    /// Only table discovery can fail the whole call; everything after that
    /// is reported per table in the returned [`MergeReport`].
    pub async fn sync(&self, mode: SyncMode, table: Option<&str>) -> Result<MergeReport> {
        let started_at = Utc::now();
        let tables = match table {
            Some(t) => vec![t.to_string()],
            None => self.discover_tables().await?,
        };

        if mode == SyncMode::Fast && self.checkpoints.is_none() {
            warn!("fast sync requested without a checkpoint store; pulling everything");
        }

        info!(mode = %mode, tables = tables.len(), "sync pass starting");

        let mut report = MergeReport {
            mode,
            started_at,
            tables: BTreeMap::new(),
        };
        for name in tables {
            let table_report = self.sync_table(mode, &name, started_at).await;
            report.tables.insert(name, table_report);
        }

        let totals = report.totals();
        info!(
            mode = %mode,
            identical = totals.identical,
            keep_remote = totals.keep_remote,
            keep_local = totals.keep_local,
            remote_only = totals.remote_only,
            local_only = totals.local_only,
            failed = report.failed_tables().len(),
            "sync pass finished"
        );

        self.record_pass(&report).await;
        Ok(report)
    }

    /// Structural id diff of `table` (or every table), remote relative to
    /// local.
    pub async fn diff(&self, table: Option<&str>) -> Result<DiffReport> {
        let (remote, local) = tokio::join!(
            self.bounded(self.remote.name(), self.remote.pull(table)),
            self.bounded(self.local.name(), self.local.pull(table)),
        );
        Ok(DiffReport::between(&remote?, &local?, table))
    }

    async fn discover_tables(&self) -> Result<Vec<String>> {
        let (remote, local) = tokio::join!(
            self.bounded(self.remote.name(), self.remote.tables()),
            self.bounded(self.local.name(), self.local.tables()),
        );

        let mut names = BTreeSet::new();
        match (remote, local) {
            (Err(r), Err(l)) => {
                warn!(remote = %r, local = %l, "neither side could list tables");
                return Err(r);
            }
            (r, l) => {
                for (side, listing) in [(self.remote.name(), r), (self.local.name(), l)] {
                    match listing {
                        Ok(tables) => names.extend(tables),
                        Err(e) => warn!(connector = side, error = %e, "table listing failed"),
                    }
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn table_lock(&self, table: &str) -> Arc<Mutex<()>> {
        let mut locks = self.table_locks.lock().await;
        locks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn sync_table(&self, mode: SyncMode, table: &str, started_at: DateTime<Utc>) -> TableReport {
        let lock = self.table_lock(table).await;
        let _guard = lock.lock().await;

        let mut report = TableReport::new(table);
        if let Err(e) = self.reconcile_table(mode, table, &mut report).await {
            warn!(table, error = %e, "table sync failed");
            report.status = TableStatus::Failed {
                error: e.to_string(),
            };
        }

        if report.status.is_ok() {
            self.advance_checkpoint(table, started_at).await;
        }
        report
    }

    async fn reconcile_table(
        &self,
        mode: SyncMode,
        table: &str,
        report: &mut TableReport,
    ) -> Result<()> {
        let since = match mode {
            SyncMode::Fast => self.checkpoint(table).await,
            SyncMode::Full => None,
        };

        let (remote, local) = tokio::join!(
            self.pull_side(&self.remote, table, since.as_deref()),
            self.pull_side(&self.local, table, since.as_deref()),
        );
        let mut plan = plan_table(remote?, local?, self.options.untimestamped_winner);

        debug!(
            table,
            merged = plan.merged.len(),
            to_remote = plan.to_remote.len(),
            to_local = plan.to_local.len(),
            "table planned"
        );

        report.decisions = plan.decisions;

        let mut failed_records = 0;
        for (target, other, records, pushed) in [
            (&self.remote, &self.local, &plan.to_remote, &mut report.pushed_remote),
            (&self.local, &self.remote, &plan.to_local, &mut report.pushed_local),
        ] {
            if records.is_empty() {
                continue;
            }
            let push = self
                .bounded(target.name(), target.push(records, table))
                .await?;
            *pushed = push.written;
            if !push.failures.is_empty() {
                warn!(
                    table,
                    connector = target.name(),
                    failed = push.failures.len(),
                    "push partially failed"
                );
                failed_records += push.failures.len();
            }

            // Created records that came back under a new id are renamed on
            // the side they came from, so the next pass pairs them up.
            if !push.remapped.is_empty() {
                self.bounded(other.name(), other.remap_ids(table, &push.remapped))
                    .await?;
                rekey(&mut plan.merged, &push.remapped);
            }
        }

        report.merged = plan.merged.iter().map(|r| r.id().to_string()).collect();

        if self.options.index_entities {
            if let Some(store) = &self.entities {
                let (indexed, failures) = index_records(store.as_ref(), table, &plan.merged).await;
                report.indexed = indexed;
                report.index_failures = failures;
            }
        }

        if failed_records > 0 {
            report.status = TableStatus::PartialWrite { failed_records };
        }
        Ok(())
    }

    async fn pull_side(
        &self,
        connector: &Arc<dyn Connector>,
        table: &str,
        since: Option<&str>,
    ) -> Result<Vec<CanonicalRecord>> {
        let pull = async {
            match since {
                Some(since) => connector.pull_since(Some(table), since).await,
                None => connector.pull(Some(table)).await,
            }
        };
        let mut snapshot: Snapshot = self.bounded(connector.name(), pull).await?;
        Ok(snapshot.remove(table).unwrap_or_default())
    }

    /// Apply the engine's I/O timeout to one connector call.
    async fn bounded<T>(
        &self,
        connector: &str,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.options.io_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::unavailable(
                connector,
                format!("timed out after {:?}", self.options.io_timeout),
            )),
        }
    }

    async fn checkpoint(&self, table: &str) -> Option<String> {
        let store = self.checkpoints.as_ref()?;
        match store.get(&checkpoint_key(table)).await {
            Ok(value) => value,
            Err(e) => {
                warn!(table, error = %e, "checkpoint read failed; pulling everything");
                None
            }
        }
    }

    async fn advance_checkpoint(&self, table: &str, started_at: DateTime<Utc>) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        let value = started_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Err(e) = store.set(&checkpoint_key(table), &value).await {
            warn!(table, error = %e, "checkpoint write failed");
        }
    }

    async fn record_pass(&self, report: &MergeReport) {
        let tables: serde_json::Map<String, serde_json::Value> = report
            .tables
            .iter()
            .map(|(name, t)| {
                (
                    name.clone(),
                    json!({ "status": t.status, "decisions": t.decisions }),
                )
            })
            .collect();
        let failed = report.failed_tables();

        if let Some(audit) = &self.audit {
            let entry = AuditEntry {
                identity: self.options.identity.clone(),
                action: SYNC_ACTION.to_string(),
                target_type: "system".to_string(),
                target_id: "sync_engine".to_string(),
                target_label: None,
                metadata: json!({ "mode": report.mode, "tables": tables }),
                status: if failed.is_empty() {
                    AuditStatus::Success
                } else {
                    AuditStatus::Failure
                },
                error_message: (!failed.is_empty())
                    .then(|| format!("failed tables: {}", failed.join(", "))),
            };
            if let Err(e) = audit.log(&entry).await {
                warn!(error = %e, "audit write failed");
            }
        }

        if let Some(telemetry) = &self.telemetry {
            let meta = json!({
                "mode": report.mode,
                "tables": report.tables.len(),
                "failed": failed.len(),
            });
            if let Err(e) = telemetry.add(SYNC_METRIC, 1, Utc::now(), meta).await {
                warn!(error = %e, "telemetry write failed");
            }
        }
    }
}

/// Upsert every record carrying an `entity_type` tag. Returns
/// `(indexed, failures)`.
async fn index_records(
    store: &dyn EntityStore,
    table: &str,
    records: &[CanonicalRecord],
) -> (usize, usize) {
    let mut indexed = 0;
    let mut failures = 0;

    for record in records {
        let Some(entity_type) = record.entity_type() else {
            continue;
        };
        let upsert = EntityUpsert {
            entity_type: entity_type.to_string(),
            canonical_id: record.id().to_string(),
            title: record.title().map(str::to_string),
            metadata: serde_json::Value::Object(record.data().clone()),
            content: record.compute_hash().to_string(),
        };
        match store.upsert_entity(&upsert).await {
            Ok(outcome) => {
                indexed += 1;
                if outcome.changed() {
                    debug!(table, canonical_id = record.id(), "entity index updated");
                }
            }
            Err(e) => {
                failures += 1;
                warn!(table, canonical_id = record.id(), error = %e, "entity index failed");
            }
        }
    }

    (indexed, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{IdRemap, PushReport};
    use crate::error::RecordError;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Connector over an in-process table map, with failure injection.
    struct MockConnector {
        name: &'static str,
        source: Source,
        tables: StdMutex<Snapshot>,
        push_calls: StdMutex<usize>,
        failing_tables: Vec<&'static str>,
        rejected_ids: Vec<&'static str>,
        delay: Option<Duration>,
        /// Creates get a fresh `{prefix}{n}` id, like a hosted side.
        assigned_prefix: Option<&'static str>,
        created: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl MockConnector {
        fn new(name: &'static str, source: Source) -> Self {
            Self {
                name,
                source,
                tables: StdMutex::new(Snapshot::new()),
                push_calls: StdMutex::new(0),
                failing_tables: Vec::new(),
                rejected_ids: Vec::new(),
                delay: None,
                assigned_prefix: None,
                created: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn enter(&self) -> InFlight<'_> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            InFlight(&self.in_flight)
        }

        fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn with(self, table: &str, records: Vec<CanonicalRecord>) -> Self {
            self.tables.lock().unwrap().insert(table.to_string(), records);
            self
        }

        fn ids(&self, table: &str) -> Vec<String> {
            self.tables.lock().unwrap()[table]
                .iter()
                .map(|r| r.id().to_string())
                .collect()
        }

        fn get(&self, table: &str, id: &str) -> CanonicalRecord {
            self.tables.lock().unwrap()[table]
                .iter()
                .find(|r| r.id() == id)
                .cloned()
                .unwrap()
        }

        fn push_calls(&self) -> usize {
            *self.push_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        fn name(&self) -> &str {
            self.name
        }

        fn source(&self) -> Source {
            self.source
        }

        async fn tables(&self) -> Result<Vec<String>> {
            Ok(self.tables.lock().unwrap().keys().cloned().collect())
        }

        async fn pull(&self, table: Option<&str>) -> Result<Snapshot> {
            let _active = self.enter();
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(t) = table {
                if self.failing_tables.iter().any(|f| *f == t) {
                    return Err(SyncError::unavailable(self.name, "injected failure"));
                }
            }
            let tables = self.tables.lock().unwrap();
            let mut snapshot = Snapshot::new();
            for (name, records) in tables.iter() {
                if table.map_or(true, |t| t == name) {
                    let records = records
                        .iter()
                        .map(|r| {
                            CanonicalRecord::new(
                                r.id(),
                                self.source,
                                r.last_modified().map(str::to_string),
                                r.data().clone(),
                            )
                        })
                        .collect();
                    snapshot.insert(name.clone(), records);
                }
            }
            Ok(snapshot)
        }

        async fn push(&self, records: &[CanonicalRecord], table: &str) -> Result<PushReport> {
            let _active = self.enter();
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            *self.push_calls.lock().unwrap() += 1;
            let mut report = PushReport::new(self.name, table, records.len());
            let mut tables = self.tables.lock().unwrap();
            let rows = tables.entry(table.to_string()).or_default();
            for record in records {
                if self.rejected_ids.iter().any(|id| *id == record.id()) {
                    report.record_failure(RecordError::new(record.id(), "rejected"));
                    continue;
                }
                let exists = rows.iter().any(|r| r.id() == record.id());
                match self.assigned_prefix {
                    Some(prefix) if !exists => {
                        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
                        let id = format!("{}{}", prefix, n);
                        rows.push(CanonicalRecord::new(
                            &id,
                            self.source,
                            record.last_modified().map(str::to_string),
                            record.data().clone(),
                        ));
                        report.remapped.push(IdRemap {
                            from: record.id().to_string(),
                            to: id,
                        });
                    }
                    _ => {
                        rows.retain(|r| r.id() != record.id());
                        rows.push(record.clone());
                    }
                }
            }
            rows.sort_by(|a, b| a.id().cmp(b.id()));
            Ok(report)
        }

        async fn remap_ids(&self, table: &str, remaps: &[IdRemap]) -> Result<()> {
            let mut tables = self.tables.lock().unwrap();
            if let Some(rows) = tables.get_mut(table) {
                for remap in remaps {
                    for row in rows.iter_mut().filter(|r| r.id() == remap.from) {
                        *row = CanonicalRecord::new(
                            &remap.to,
                            row.source(),
                            row.last_modified().map(str::to_string),
                            row.data().clone(),
                        );
                    }
                }
                rows.sort_by(|a, b| a.id().cmp(b.id()));
            }
            Ok(())
        }
    }

    fn rec(id: &str, ts: Option<&str>, data: Value) -> CanonicalRecord {
        let data: Map<String, Value> = data.as_object().cloned().unwrap_or_default();
        CanonicalRecord::new(id, Source::Remote, ts.map(str::to_string), data)
    }

    fn engine(remote: &Arc<MockConnector>, local: &Arc<MockConnector>) -> ReconciliationEngine {
        ReconciliationEngine::new(remote.clone(), local.clone())
    }

    #[tokio::test]
    async fn test_scenario_union_merge() {
        let remote = Arc::new(MockConnector::new("remote", Source::Remote).with(
            "tasks",
            vec![
                rec("1", Some("2025-01-01T00:00:00Z"), json!({"t": "one"})),
                rec("2", Some("2025-01-01T00:00:00Z"), json!({"t": "two"})),
            ],
        ));
        let local = Arc::new(MockConnector::new("local", Source::Local).with(
            "tasks",
            vec![
                rec("2", Some("2025-01-01T00:00:00Z"), json!({"t": "two"})),
                rec("3", Some("2025-01-01T00:00:00Z"), json!({"t": "three"})),
            ],
        ));

        let report = engine(&remote, &local)
            .sync(SyncMode::Full, None)
            .await
            .unwrap();
        let tasks = &report.tables["tasks"];
        assert_eq!(tasks.merged, vec!["1", "2", "3"]);
        assert_eq!(tasks.decisions.identical, 1);
        assert_eq!(tasks.decisions.remote_only, 1);
        assert_eq!(tasks.decisions.local_only, 1);
        assert!(report.is_success());

        assert_eq!(remote.ids("tasks"), vec!["1", "2", "3"]);
        assert_eq!(local.ids("tasks"), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let remote = Arc::new(MockConnector::new("remote", Source::Remote).with(
            "tasks",
            vec![rec("1", Some("2025-01-01T00:00:00Z"), json!({"t": "one"}))],
        ));
        let local = Arc::new(MockConnector::new("local", Source::Local).with(
            "tasks",
            vec![rec("2", None, json!({"t": "two"}))],
        ));
        let engine = engine(&remote, &local);

        engine.sync(SyncMode::Full, None).await.unwrap();
        let pushes = (remote.push_calls(), local.push_calls());

        let second = engine.sync(SyncMode::Full, None).await.unwrap();
        let tasks = &second.tables["tasks"];
        assert_eq!(tasks.decisions.identical, tasks.decisions.total());
        assert_eq!((tasks.pushed_remote, tasks.pushed_local), (0, 0));
        assert_eq!((remote.push_calls(), local.push_calls()), pushes);
    }

    #[tokio::test]
    async fn test_later_timestamp_wins_and_swaps() {
        for (remote_ts, local_ts, expected, winner) in [
            (
                "2025-02-01T00:00:00Z",
                "2025-01-01T00:00:00Z",
                MergeDecision::KeepRemote,
                "remote",
            ),
            (
                "2025-01-01T00:00:00Z",
                "2025-02-01T00:00:00Z",
                MergeDecision::KeepLocal,
                "local",
            ),
        ] {
            let remote = Arc::new(MockConnector::new("remote", Source::Remote).with(
                "tasks",
                vec![rec("1", Some(remote_ts), json!({"v": "remote"}))],
            ));
            let local = Arc::new(MockConnector::new("local", Source::Local).with(
                "tasks",
                vec![rec("1", Some(local_ts), json!({"v": "local"}))],
            ));

            let report = engine(&remote, &local)
                .sync(SyncMode::Full, Some("tasks"))
                .await
                .unwrap();
            assert_eq!(report.tables["tasks"].decisions.get(expected), 1);
            assert_eq!(remote.get("tasks", "1").data()["v"], winner);
            assert_eq!(local.get("tasks", "1").data()["v"], winner);
        }
    }

    #[test]
    fn test_resolve_untimestamped_uses_configured_winner() {
        let r = rec("1", None, json!({"v": 1}));
        let l = rec("1", None, json!({"v": 2}));
        assert_eq!(resolve(&r, &l, Source::Remote), MergeDecision::KeepRemote);
        assert_eq!(resolve(&r, &l, Source::Local), MergeDecision::KeepLocal);
    }

    #[test]
    fn test_resolve_single_timestamp_and_ties() {
        let stamped = rec("1", Some("2025-01-01T00:00:00Z"), json!({"v": 1}));
        let bare = rec("1", None, json!({"v": 2}));
        assert_eq!(resolve(&stamped, &bare, Source::Local), MergeDecision::KeepRemote);
        assert_eq!(resolve(&bare, &stamped, Source::Remote), MergeDecision::KeepLocal);

        let tie = rec("1", Some("2025-01-01T00:00:00Z"), json!({"v": 3}));
        assert_eq!(resolve(&stamped, &tie, Source::Remote), MergeDecision::KeepLocal);
        assert_eq!(resolve(&stamped, &stamped.clone(), Source::Remote), MergeDecision::Identical);
    }

    #[tokio::test]
    async fn test_failing_table_is_isolated() {
        let mut remote = MockConnector::new("remote", Source::Remote)
            .with("tasks", vec![rec("1", None, json!({}))])
            .with("clients", vec![rec("c1", None, json!({}))]);
        remote.failing_tables = vec!["clients"];
        let remote = Arc::new(remote);
        let local = Arc::new(MockConnector::new("local", Source::Local));

        let report = engine(&remote, &local)
            .sync(SyncMode::Full, None)
            .await
            .unwrap();
        assert!(!report.is_success());
        assert_eq!(report.failed_tables(), vec!["clients"]);
        assert!(report.tables["tasks"].status.is_ok());
        assert_eq!(local.ids("tasks"), vec!["1"]);
        match &report.tables["clients"].status {
            TableStatus::Failed { error } => assert!(error.contains("injected failure")),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pull_timeout_fails_table() {
        let mut remote =
            MockConnector::new("remote", Source::Remote).with("tasks", vec![rec("1", None, json!({}))]);
        remote.delay = Some(Duration::from_secs(5));
        let remote = Arc::new(remote);
        let local = Arc::new(MockConnector::new("local", Source::Local));

        let engine = engine(&remote, &local).with_options(EngineOptions {
            io_timeout: Duration::from_millis(50),
            ..EngineOptions::default()
        });
        let report = engine.sync(SyncMode::Full, Some("tasks")).await.unwrap();
        match &report.tables["tasks"].status {
            TableStatus::Failed { error } => assert!(error.contains("timed out"), "{}", error),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_write_holds_checkpoint() {
        let remote = Arc::new(MockConnector::new("remote", Source::Remote).with(
            "tasks",
            vec![rec("1", None, json!({})), rec("2", None, json!({}))],
        ));
        let mut local = MockConnector::new("local", Source::Local);
        local.rejected_ids = vec!["2"];
        let local = Arc::new(local);
        let store = Arc::new(InMemoryStore::new());

        let report = engine(&remote, &local)
            .with_checkpoints(store.clone())
            .sync(SyncMode::Full, Some("tasks"))
            .await
            .unwrap();
        let tasks = &report.tables["tasks"];
        assert_eq!(tasks.status, TableStatus::PartialWrite { failed_records: 1 });
        assert_eq!(tasks.pushed_local, 1);
        assert!(!report.is_success());
        assert_eq!(store.get("sync:tasks").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fast_mode_uses_checkpoint() {
        let remote = Arc::new(MockConnector::new("remote", Source::Remote).with(
            "tasks",
            vec![
                rec("old", Some("2024-01-01T00:00:00Z"), json!({})),
                rec("new", Some("2025-06-01T00:00:00Z"), json!({})),
            ],
        ));
        let local = Arc::new(MockConnector::new("local", Source::Local));
        let store = Arc::new(InMemoryStore::new());
        store.set("sync:tasks", "2025-01-01T00:00:00Z").await.unwrap();

        let engine = engine(&remote, &local).with_checkpoints(store.clone());
        let report = engine.sync(SyncMode::Fast, Some("tasks")).await.unwrap();
        assert_eq!(report.tables["tasks"].merged, vec!["new"]);
        assert_eq!(local.ids("tasks"), vec!["new"]);

        let advanced = store.get("sync:tasks").await.unwrap().unwrap();
        assert_eq!(
            compare_timestamps(&advanced, "2025-01-01T00:00:00Z"),
            std::cmp::Ordering::Greater
        );
    }

    #[tokio::test]
    async fn test_full_mode_ignores_checkpoint() {
        let remote = Arc::new(MockConnector::new("remote", Source::Remote).with(
            "tasks",
            vec![rec("old", Some("2024-01-01T00:00:00Z"), json!({}))],
        ));
        let local = Arc::new(MockConnector::new("local", Source::Local));
        let store = Arc::new(InMemoryStore::new());
        store.set("sync:tasks", "2099-01-01T00:00:00Z").await.unwrap();

        engine(&remote, &local)
            .with_checkpoints(store.clone())
            .sync(SyncMode::Full, Some("tasks"))
            .await
            .unwrap();
        assert_eq!(local.ids("tasks"), vec!["old"]);
    }

    #[tokio::test]
    async fn test_entities_indexed_and_pass_recorded() {
        let remote = Arc::new(MockConnector::new("remote", Source::Remote).with(
            "tasks",
            vec![
                rec("T1", None, json!({"entity_type": "task", "title": "Close books"})),
                rec("plain", None, json!({"title": "no type"})),
            ],
        ));
        let local = Arc::new(MockConnector::new("local", Source::Local));
        let store = Arc::new(InMemoryStore::new());

        let report = engine(&remote, &local)
            .with_entity_store(store.clone())
            .with_audit(store.clone())
            .with_telemetry(store.clone())
            .sync(SyncMode::Full, None)
            .await
            .unwrap();
        assert_eq!(report.tables["tasks"].indexed, 1);

        let entity = store.find_entity("T1").await.unwrap().unwrap();
        assert_eq!(entity.entity_type, "task");
        assert_eq!(entity.title.as_deref(), Some("Close books"));
        assert!(store.find_entity("plain").await.unwrap().is_none());

        let audits = store.audit_entries();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].action, SYNC_ACTION);
        assert_eq!(audits[0].target_id, "sync_engine");
        assert_eq!(audits[0].status, AuditStatus::Success);
        assert_eq!(audits[0].metadata["tables"]["tasks"]["decisions"]["remote_only"], 2);

        let metrics = store.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].metric, SYNC_METRIC);
        assert_eq!(metrics[0].value, 1);
    }

    #[tokio::test]
    async fn test_diff_is_remote_relative_to_local() {
        let remote = Arc::new(
            MockConnector::new("remote", Source::Remote)
                .with("tasks", vec![rec("1", None, json!({})), rec("2", None, json!({}))]),
        );
        let local = Arc::new(
            MockConnector::new("local", Source::Local)
                .with("tasks", vec![rec("2", None, json!({})), rec("3", None, json!({}))]),
        );
        let diff = engine(&remote, &local).diff(None).await.unwrap();
        assert_eq!(diff.tables["tasks"].only_in_this, vec!["1"]);
        assert_eq!(diff.tables["tasks"].only_in_other, vec!["3"]);
    }

    #[tokio::test]
    async fn test_created_ids_are_adopted_by_the_other_side() {
        let mut remote = MockConnector::new("remote", Source::Remote).with("tasks", vec![]);
        remote.assigned_prefix = Some("srv-");
        let remote = Arc::new(remote);
        let local = Arc::new(MockConnector::new("local", Source::Local).with(
            "tasks",
            vec![rec("L1", Some("2025-01-01T00:00:00Z"), json!({"title": "draft"}))],
        ));
        let engine = engine(&remote, &local);

        let first = engine.sync(SyncMode::Full, None).await.unwrap();
        assert_eq!(first.tables["tasks"].merged, vec!["srv-1"]);
        assert_eq!(remote.ids("tasks"), vec!["srv-1"]);
        assert_eq!(local.ids("tasks"), vec!["srv-1"]);
        assert_eq!(local.get("tasks", "srv-1").data()["title"], "draft");

        let second = engine.sync(SyncMode::Full, None).await.unwrap();
        let tasks = &second.tables["tasks"];
        assert_eq!(tasks.decisions.get(MergeDecision::Identical), 1);
        assert_eq!(tasks.decisions.total(), 1);
        assert_eq!(remote.ids("tasks"), vec!["srv-1"]);
        assert_eq!(remote.push_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_syncs_of_one_table_are_serialized() {
        let mut remote = MockConnector::new("remote", Source::Remote).with(
            "tasks",
            vec![rec("1", Some("2025-01-01T00:00:00Z"), json!({"title": "one"}))],
        );
        remote.delay = Some(Duration::from_millis(50));
        let mut local = MockConnector::new("local", Source::Local).with("tasks", vec![]);
        local.delay = Some(Duration::from_millis(50));
        let (remote, local) = (Arc::new(remote), Arc::new(local));
        let engine = engine(&remote, &local);

        let (a, b) = tokio::join!(
            engine.sync(SyncMode::Full, Some("tasks")),
            engine.sync(SyncMode::Full, Some("tasks")),
        );
        assert!(a.unwrap().is_success());
        assert!(b.unwrap().is_success());

        assert_eq!(remote.max_in_flight(), 1);
        assert_eq!(local.max_in_flight(), 1);
        // The second pass saw the first one's push and had nothing to do.
        assert_eq!(local.push_calls(), 1);
        assert_eq!(local.ids("tasks"), vec!["1"]);
    }
}

//! The connector abstraction.
//!
//! A [`Connector`] translates one native source (the hosted workspace, the
//! local mirror, or anything a caller implements) into and out of
//! [`CanonicalRecord`]s. The reconciliation engine only ever talks to
//! sources through this trait.
//!
//! ```text
//!   RemoteConnector ──┐                      ┌──▶ push (remote)
//!                     ├──▶ pull ──▶ engine ──┤
//!   LocalConnector  ──┘                      └──▶ push (local)
//! ```
//!
//! Besides the trait this module provides the shared retry helper
//! ([`with_backoff`]), the id-level [`DiffReport`], the batch
//! [`PushReport`], and the polling [`subscribe`] loop.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::{RecordError, Result, SyncError};
use crate::models::{
    fingerprint, is_modified_after, CanonicalRecord, Fingerprints, Snapshot, Source,
};

/// A source of canonical records.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use opsync::connector::{Connector, PushReport};
/// use opsync::error::Result;
/// use opsync::models::{CanonicalRecord, Snapshot, Source};
///
/// struct Empty;
///
/// #[async_trait]
/// impl Connector for Empty {
///     fn name(&self) -> &str { "empty" }
///     fn source(&self) -> Source { Source::Local }
///     async fn tables(&self) -> Result<Vec<String>> { Ok(vec![]) }
///     async fn pull(&self, _table: Option<&str>) -> Result<Snapshot> { Ok(Snapshot::new()) }
///     async fn push(&self, records: &[CanonicalRecord], table: &str) -> Result<PushReport> {
///         Ok(PushReport::new(self.name(), table, records.len()))
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    /// Instance name used in logs and errors (e.g. `"remote"`).
    fn name(&self) -> &str;

    /// The tag stamped on every record this connector produces.
    fn source(&self) -> Source;

    /// Table names this side currently exposes.
    async fn tables(&self) -> Result<Vec<String>>;

    /// Read all records of `table`, or of every table when `None`.
    ///
    /// Returns a fresh snapshot on every call. Transient failures are
    /// retried; a pull that cannot complete fails with
    /// [`SyncError::ConnectorUnavailable`] rather than returning partial data.
    async fn pull(&self, table: Option<&str>) -> Result<Snapshot>;

    /// Like [`pull`](Connector::pull), restricted to records modified after
    /// `since`. Records without a timestamp are always included.
    async fn pull_since(&self, table: Option<&str>, since: &str) -> Result<Snapshot> {
        let mut snapshot = self.pull(table).await?;
        for records in snapshot.values_mut() {
            records.retain(|r| is_modified_after(r, since));
        }
        Ok(snapshot)
    }

    /// Write `records` into `table`, creating or updating by native id.
    ///
    /// A failing record never aborts the rest of the batch; failures are
    /// collected in the returned [`PushReport`]. `Err` is reserved for the
    /// whole table being unreachable.
    async fn push(&self, records: &[CanonicalRecord], table: &str) -> Result<PushReport>;

    /// Per-table `id -> hash` fingerprint. Connectors with a cheaper listing
    /// than a full pull should override this.
    async fn list_hashes(&self, table: Option<&str>) -> Result<Fingerprints> {
        Ok(fingerprint(&self.pull(table).await?))
    }

    /// Rename records in `table` after the other side assigned them new ids
    /// on create. A row already stored under the new id wins over the
    /// renamed one. Connectors that never receive remapped ids keep the
    /// default no-op.
    async fn remap_ids(&self, _table: &str, _remaps: &[IdRemap]) -> Result<()> {
        Ok(())
    }

    /// Id-level difference between this side and `other`.
    async fn diff(&self, other: &Snapshot, table: Option<&str>) -> Result<DiffReport> {
        let mine = self.pull(table).await?;
        Ok(DiffReport::between(&mine, other, table))
    }
}

/// Ids present on only one side of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableDiff {
    pub only_in_this: Vec<String>,
    pub only_in_other: Vec<String>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.only_in_this.is_empty() && self.only_in_other.is_empty()
    }
}

/// Structural (id-only) diff between two snapshots. Content is not compared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    pub tables: BTreeMap<String, TableDiff>,
}

impl DiffReport {
    /// Diff `this` against `other`, over the union of their tables (or just
    /// `table` when given). Id lists are sorted.
    pub fn between(this: &Snapshot, other: &Snapshot, table: Option<&str>) -> Self {
        let names: BTreeSet<&str> = match table {
            Some(t) => BTreeSet::from([t]),
            None => this.keys().chain(other.keys()).map(String::as_str).collect(),
        };

        let ids = |snapshot: &Snapshot, name: &str| -> BTreeSet<String> {
            snapshot
                .get(name)
                .map(|records| records.iter().map(|r| r.id().to_string()).collect())
                .unwrap_or_default()
        };

        let tables = names
            .into_iter()
            .map(|name| {
                let mine = ids(this, name);
                let theirs = ids(other, name);
                let diff = TableDiff {
                    only_in_this: mine.difference(&theirs).cloned().collect(),
                    only_in_other: theirs.difference(&mine).cloned().collect(),
                };
                (name.to_string(), diff)
            })
            .collect();

        Self { tables }
    }

    pub fn is_clean(&self) -> bool {
        self.tables.values().all(TableDiff::is_empty)
    }
}

/// A record that the target side stored under a different id than the
/// one it was pushed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdRemap {
    pub from: String,
    pub to: String,
}

/// Outcome of one [`Connector::push`] batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub connector: String,
    pub table: String,
    pub attempted: usize,
    pub written: usize,
    pub failures: Vec<RecordError>,
    /// Created records whose id was assigned by the target side.
    pub remapped: Vec<IdRemap>,
}

impl PushReport {
    /// A report where every attempted record was written.
    pub fn new(connector: &str, table: &str, attempted: usize) -> Self {
        Self {
            connector: connector.to_string(),
            table: table.to_string(),
            attempted,
            written: attempted,
            failures: Vec::new(),
            remapped: Vec::new(),
        }
    }

    pub fn record_failure(&mut self, failure: RecordError) {
        self.written = self.written.saturating_sub(1);
        self.failures.push(failure);
    }

    /// `Err(ConnectorPartialWrite)` if any record failed.
    pub fn into_result(self) -> Result<PushReport> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(SyncError::ConnectorPartialWrite {
                connector: self.connector,
                table: self.table,
                attempted: self.attempted,
                failures: self.failures,
            })
        }
    }
}

/// Bounded exponential backoff: `base, 2×base, 4×base, …` capped at 32×base.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << attempt.saturating_sub(1).min(5))
    }
}

/// How a failed attempt should be treated by [`with_backoff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Retry(String),
    Fatal(String),
}

/// Run `op` until it succeeds, fails fatally, or retries are exhausted.
/// Every terminal failure is reported as `ConnectorUnavailable`.
pub async fn with_backoff<T, F, Fut>(connector: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, Attempt>>,
{
    let mut last_reason = String::new();

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            debug!(connector, attempt, ?delay, "retrying after transient failure");
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(reason)) => return Err(SyncError::unavailable(connector, reason)),
            Err(Attempt::Retry(reason)) => {
                warn!(connector, attempt, %reason, "transient connector failure");
                last_reason = reason;
            }
        }
    }

    Err(SyncError::unavailable(
        connector,
        format!(
            "gave up after {} attempts: {}",
            policy.max_retries + 1,
            last_reason
        ),
    ))
}

/// Handle to a running [`subscribe`] loop.
///
/// Dropping the handle also ends the loop (the shutdown channel closes), but
/// only [`stop`](Subscription::stop) waits for it.
pub struct Subscription {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Signal the loop to stop and wait for it. A poll in progress finishes
    /// first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "subscription task ended abnormally");
        }
    }
}

/// Poll `connector` every `interval` and call `callback(table, records)`
/// for each table whose `id -> hash` map changed since the previous poll.
/// A table's first observation only records the baseline.
pub fn subscribe<F>(connector: Arc<dyn Connector>, interval: Duration, mut callback: F) -> Subscription
where
    F: FnMut(&str, &[CanonicalRecord]) + Send + 'static,
{
    let (shutdown, mut rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut last: Fingerprints = BTreeMap::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let snapshot = match connector.pull(None).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(connector = connector.name(), error = %e, "subscription poll failed");
                            continue;
                        }
                    };
                    for (table, hashes) in fingerprint(&snapshot) {
                        let changed = last.get(&table).is_some_and(|prev| *prev != hashes);
                        if changed {
                            let records = snapshot.get(&table).map(Vec::as_slice).unwrap_or(&[]);
                            callback(&table, records);
                        }
                        last.insert(table, hashes);
                    }
                }
            }
        }

        debug!(connector = connector.name(), "subscription stopped");
    });

    Subscription { shutdown, handle }
}

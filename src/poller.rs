//! Drift-triggered background sync.
//!
//! Every tick the [`ChangePoller`] fingerprints both sides (`list_hashes`),
//! compares the per-table `id -> hash` maps with the previous tick, and runs
//! a fast sync of each table that drifted. Untouched tables cost one
//! fingerprint per side and nothing else.
//!
//! A fast sync only sees records stamped after the table's checkpoint, so
//! an edit that kept its old timestamp is invisible to it. After the fast
//! sync the table is fingerprinted again on both sides; if the sides still
//! disagree a full sync of that table follows.
//!
//! The first tick only records a baseline. A table that shows up on a later
//! tick counts as drifted. A table whose drift sync did not converge stays
//! dirty and is synced again on the next tick, whether or not its
//! fingerprints moved in between.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connector::Connector;
use crate::engine::{ReconciliationEngine, SyncMode};
use crate::error::{Result, SyncError};
use crate::models::Fingerprints;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

type TableHashes = BTreeMap<String, String>;

/// Fingerprints from the last tick, one map per side, plus the tables whose
/// last drift sync did not converge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollerState {
    pub remote: Fingerprints,
    pub local: Fingerprints,
    dirty: BTreeSet<String>,
    baselined: bool,
}

impl PollerState {
    /// Record a new observation and return the tables that differ from the
    /// previous one, plus any dirty tables, sorted. Returns nothing on the
    /// first observation. Dirty marks are consumed.
    pub fn observe(&mut self, remote: Fingerprints, local: Fingerprints) -> Vec<String> {
        let mut drifted = std::mem::take(&mut self.dirty);
        if self.baselined {
            let names: BTreeSet<&String> = self
                .remote
                .keys()
                .chain(self.local.keys())
                .chain(remote.keys())
                .chain(local.keys())
                .collect();
            drifted.extend(
                names
                    .into_iter()
                    .filter(|t| {
                        !same_table(self.remote.get(*t), remote.get(*t))
                            || !same_table(self.local.get(*t), local.get(*t))
                    })
                    .cloned(),
            );
        }

        self.remote = remote;
        self.local = local;
        self.baselined = true;
        drifted.into_iter().collect()
    }

    /// Replace one table's fingerprints, typically with the state right
    /// after it was synced.
    pub fn record(&mut self, table: &str, remote: TableHashes, local: TableHashes) {
        self.remote.insert(table.to_string(), remote);
        self.local.insert(table.to_string(), local);
        self.dirty.remove(table);
    }

    /// Force `table` into the next tick's drift list.
    pub fn mark_dirty(&mut self, table: &str) {
        self.dirty.insert(table.to_string());
    }

    pub fn is_dirty(&self, table: &str) -> bool {
        self.dirty.contains(table)
    }

    pub fn is_baselined(&self) -> bool {
        self.baselined
    }
}

/// A missing table and an empty one fingerprint the same.
fn same_table(a: Option<&TableHashes>, b: Option<&TableHashes>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (Some(m), None) | (None, Some(m)) => m.is_empty(),
        (None, None) => true,
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ChangePoller {
    engine: Arc<ReconciliationEngine>,
    interval: Duration,
    state: Arc<Mutex<PollerState>>,
    running: Mutex<Option<Running>>,
}

impl ChangePoller {
    pub fn new(engine: Arc<ReconciliationEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            state: Arc::new(Mutex::new(PollerState::default())),
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the polling loop. Returns `false` if it was already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let (shutdown, mut rx) = watch::channel(false);
        let engine = self.engine.clone();
        let state = self.state.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs_f64(), "change poller started");

            loop {
                tokio::select! {
                    biased;
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match poll_once(&engine, &state).await {
                            Ok(drifted) if !drifted.is_empty() => {
                                info!(tables = ?drifted, "drift detected; synced");
                            }
                            Ok(_) => debug!("no drift"),
                            Err(e) => warn!(error = %e, "poll tick failed"),
                        }
                    }
                }
            }

            info!("change poller stopped");
        });

        *running = Some(Running { shutdown, handle });
        true
    }

    /// Signal shutdown and wait for the loop to exit. A tick in progress,
    /// including its syncs, runs to completion first.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            warn!(error = %e, "change poller task ended abnormally");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run one tick inline. Returns the tables that drifted and were synced.
    pub async fn tick(&self) -> Result<Vec<String>> {
        poll_once(&self.engine, &self.state).await
    }

    pub async fn state(&self) -> PollerState {
        self.state.lock().await.clone()
    }
}

async fn poll_once(
    engine: &ReconciliationEngine,
    state: &Mutex<PollerState>,
) -> Result<Vec<String>> {
    let timeout = engine.options().io_timeout;
    let (remote, local) = tokio::join!(
        fingerprint_side(engine.remote().as_ref(), None, timeout),
        fingerprint_side(engine.local().as_ref(), None, timeout),
    );
    let drifted = state.lock().await.observe(remote?, local?);

    for table in &drifted {
        match sync_drifted(engine, table).await {
            Some((remote, local)) => state.lock().await.record(table, remote, local),
            None => state.lock().await.mark_dirty(table),
        }
    }

    Ok(drifted)
}

/// Sync one drifted table until both sides fingerprint the same, and return
/// those fingerprints. `None` means the table is still apart.
async fn sync_drifted(
    engine: &ReconciliationEngine,
    table: &str,
) -> Option<(TableHashes, TableHashes)> {
    if !run_table_sync(engine, SyncMode::Fast, table).await {
        return None;
    }
    let (remote, local) = fingerprint_table(engine, table).await?;
    if remote == local {
        return Some((remote, local));
    }

    debug!(table, "fast sync left the sides apart; running a full sync");
    if !run_table_sync(engine, SyncMode::Full, table).await {
        return None;
    }
    let (remote, local) = fingerprint_table(engine, table).await?;
    if remote != local {
        warn!(table, "sides still differ after a full sync; retrying next tick");
        return None;
    }
    Some((remote, local))
}

async fn run_table_sync(engine: &ReconciliationEngine, mode: SyncMode, table: &str) -> bool {
    match engine.sync(mode, Some(table)).await {
        Ok(report) => match report.tables.get(table) {
            Some(t) if t.status.is_ok() => true,
            Some(t) => {
                warn!(table, mode = %mode, status = ?t.status, "drift sync did not complete");
                false
            }
            None => false,
        },
        Err(e) => {
            warn!(table, mode = %mode, error = %e, "drift sync failed");
            false
        }
    }
}

async fn fingerprint_table(
    engine: &ReconciliationEngine,
    table: &str,
) -> Option<(TableHashes, TableHashes)> {
    let timeout = engine.options().io_timeout;
    let (remote, local) = tokio::join!(
        fingerprint_side(engine.remote().as_ref(), Some(table), timeout),
        fingerprint_side(engine.local().as_ref(), Some(table), timeout),
    );
    match (remote, local) {
        (Ok(mut remote), Ok(mut local)) => Some((
            remote.remove(table).unwrap_or_default(),
            local.remove(table).unwrap_or_default(),
        )),
        (Err(e), _) | (_, Err(e)) => {
            warn!(table, error = %e, "post-sync fingerprint failed");
            None
        }
    }
}

async fn fingerprint_side(
    connector: &dyn Connector,
    table: Option<&str>,
    timeout: Duration,
) -> Result<Fingerprints> {
    tokio::time::timeout(timeout, connector.list_hashes(table))
        .await
        .map_err(|_| {
            SyncError::unavailable(connector.name(), format!("fingerprint timed out after {:?}", timeout))
        })?
}

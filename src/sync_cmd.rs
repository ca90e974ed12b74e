//! `opsync sync run|diff|watch`.
//!
//! Wires the configured connectors and the SQLite store into a
//! [`ReconciliationEngine`] and renders its reports as plain text.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::connector::{Connector, DiffReport};
use crate::connector_local::LocalConnector;
use crate::connector_remote::RemoteConnector;
use crate::engine::{EngineOptions, MergeReport, ReconciliationEngine, SyncMode, TableStatus};
use crate::poller::ChangePoller;
use crate::store::sqlite::SqliteStore;

/// Build both connectors from configuration. Both must be configured.
pub fn build_connectors(config: &Config) -> Result<(Arc<dyn Connector>, Arc<dyn Connector>)> {
    let remote = config
        .connectors
        .remote
        .as_ref()
        .context("connectors.remote is not configured")?;
    let local = config
        .connectors
        .local
        .as_ref()
        .context("connectors.local is not configured")?;

    let remote: Arc<dyn Connector> = Arc::new(RemoteConnector::new(remote)?);
    let local: Arc<dyn Connector> = Arc::new(LocalConnector::new(local)?);
    Ok((remote, local))
}

/// An engine backed by the configured connectors and the SQLite store for
/// entities, audit, telemetry and checkpoints.
pub async fn build_engine(config: &Config) -> Result<(ReconciliationEngine, Arc<SqliteStore>)> {
    let (remote, local) = build_connectors(config)?;
    let store = Arc::new(SqliteStore::open(config).await?);

    let engine = ReconciliationEngine::new(remote, local)
        .with_options(EngineOptions::from(&config.sync))
        .with_entity_store(store.clone())
        .with_audit(store.clone())
        .with_telemetry(store.clone())
        .with_checkpoints(store.clone());
    Ok((engine, store))
}

/// Run one pass and print the report. Fails when any table did not sync.
pub async fn run_sync(config: &Config, fast: bool, table: Option<String>) -> Result<()> {
    let (engine, store) = build_engine(config).await?;
    let mode = if fast { SyncMode::Fast } else { SyncMode::Full };

    let report = engine.sync(mode, table.as_deref()).await;
    store.close().await;
    let report = report?;

    print!("{}", render_merge_report(&report));

    let failed = report.failed_tables();
    if !failed.is_empty() {
        bail!("sync failed for table(s): {}", failed.join(", "));
    }
    println!("ok");
    Ok(())
}

pub async fn run_diff(config: &Config, table: Option<String>) -> Result<()> {
    let (remote, local) = build_connectors(config)?;
    let engine = ReconciliationEngine::new(remote, local)
        .with_options(EngineOptions::from(&config.sync));

    let diff = engine.diff(table.as_deref()).await?;
    print!("{}", render_diff(&diff));
    Ok(())
}

/// Poll for drift until Ctrl-C.
pub async fn run_watch(config: &Config, interval_secs: Option<u64>) -> Result<()> {
    let interval = Duration::from_secs(interval_secs.unwrap_or(config.poller.interval_secs));
    if interval.is_zero() {
        bail!("--interval must be > 0");
    }

    let (engine, store) = build_engine(config).await?;
    let poller = ChangePoller::new(Arc::new(engine), interval);

    poller.start().await;
    println!(
        "watching for changes every {}s (Ctrl-C to stop)",
        poller.interval().as_secs()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    println!("stopping...");
    poller.stop().await;
    store.close().await;
    Ok(())
}

fn status_label(status: &TableStatus) -> String {
    match status {
        TableStatus::Synced => "synced".to_string(),
        TableStatus::PartialWrite { failed_records } => {
            format!("partial ({} failed)", failed_records)
        }
        TableStatus::Failed { error } => format!("FAILED: {}", error),
    }
}

pub fn render_merge_report(report: &MergeReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "sync ({})", report.mode);

    if report.tables.is_empty() {
        let _ = writeln!(out, "  no tables");
        return out;
    }

    for table in report.tables.values() {
        let d = &table.decisions;
        let _ = writeln!(out, "  {}: {}", table.table, status_label(&table.status));
        if matches!(table.status, TableStatus::Failed { .. }) {
            continue;
        }
        let _ = writeln!(
            out,
            "    identical: {}  keep-remote: {}  keep-local: {}  remote-only: {}  local-only: {}",
            d.identical, d.keep_remote, d.keep_local, d.remote_only, d.local_only
        );
        let _ = writeln!(
            out,
            "    pushed: remote {}, local {}",
            table.pushed_remote, table.pushed_local
        );
        if table.indexed > 0 || table.index_failures > 0 {
            let _ = writeln!(
                out,
                "    indexed entities: {} ({} failed)",
                table.indexed, table.index_failures
            );
        }
    }
    out
}

pub fn render_diff(diff: &DiffReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Diff (remote vs local) ===");
    if diff.is_clean() {
        let _ = writeln!(out, "in sync");
        return out;
    }

    for (table, t) in &diff.tables {
        if t.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{}:", table);
        for id in &t.only_in_this {
            let _ = writeln!(out, "  + {} (remote only)", id);
        }
        for id in &t.only_in_other {
            let _ = writeln!(out, "  - {} (local only)", id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::TableDiff;
    use crate::engine::{DecisionCounts, TableReport};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn table_report(name: &str, status: TableStatus) -> TableReport {
        TableReport {
            table: name.to_string(),
            status,
            decisions: DecisionCounts {
                identical: 1,
                remote_only: 1,
                local_only: 1,
                ..DecisionCounts::default()
            },
            merged: vec!["1".into(), "2".into(), "3".into()],
            pushed_remote: 1,
            pushed_local: 1,
            indexed: 0,
            index_failures: 0,
        }
    }

    #[test]
    fn test_render_merge_report() {
        let mut tables = BTreeMap::new();
        tables.insert("tasks".to_string(), table_report("tasks", TableStatus::Synced));
        tables.insert(
            "clients".to_string(),
            table_report(
                "clients",
                TableStatus::Failed {
                    error: "connector 'remote' unavailable: HTTP 401".into(),
                },
            ),
        );
        let report = MergeReport {
            mode: SyncMode::Full,
            started_at: Utc::now(),
            tables,
        };

        let text = render_merge_report(&report);
        assert!(text.starts_with("sync (full)\n"));
        assert!(text.contains("  tasks: synced"));
        assert!(text.contains("identical: 1  keep-remote: 0  keep-local: 0  remote-only: 1  local-only: 1"));
        assert!(text.contains("  clients: FAILED: connector 'remote' unavailable"));
    }

    #[test]
    fn test_render_diff() {
        let mut diff = DiffReport::default();
        diff.tables.insert(
            "tasks".into(),
            TableDiff {
                only_in_this: vec!["1".into()],
                only_in_other: vec!["3".into()],
            },
        );
        let text = render_diff(&diff);
        assert!(text.contains("tasks:\n  + 1 (remote only)\n  - 3 (local only)\n"));

        assert!(render_diff(&DiffReport::default()).contains("in sync"));
    }

    #[test]
    fn test_build_connectors_requires_both() {
        let config: Config = toml::from_str("[db]\npath = \"x.sqlite\"\n").unwrap();
        let err = build_connectors(&config).err().unwrap();
        assert!(err.to_string().contains("connectors.remote"));
    }
}

//! `opsync sources`: connector configuration and health.

use anyhow::Result;

use crate::config::Config;
use crate::connector::Connector;
use crate::connector_local::LocalConnector;
use crate::connector_remote::RemoteConnector;

/// Status line for one connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub name: &'static str,
    pub status: String,
    pub healthy: bool,
    pub tables: Vec<String>,
}

/// Check every known connector without contacting remote services.
pub async fn check_sources(config: &Config) -> Vec<SourceStatus> {
    vec![remote_status(config).await, local_status(config).await]
}

async fn remote_status(config: &Config) -> SourceStatus {
    let Some(remote) = &config.connectors.remote else {
        return not_configured("remote");
    };

    match RemoteConnector::new(remote) {
        Ok(connector) => SourceStatus {
            name: "remote",
            status: "OK".to_string(),
            healthy: true,
            tables: connector.tables().await.unwrap_or_default(),
        },
        Err(e) => SourceStatus {
            name: "remote",
            status: format!("UNHEALTHY ({})", e),
            healthy: false,
            tables: remote.tables.keys().cloned().collect(),
        },
    }
}

async fn local_status(config: &Config) -> SourceStatus {
    let Some(local) = &config.connectors.local else {
        return not_configured("local");
    };

    if !local.state_dir.exists() {
        return SourceStatus {
            name: "local",
            status: "OK (state dir will be created)".to_string(),
            healthy: true,
            tables: Vec::new(),
        };
    }

    let listing = match LocalConnector::new(local) {
        Ok(connector) => connector.tables().await,
        Err(e) => Err(e),
    };
    match listing {
        Ok(tables) => SourceStatus {
            name: "local",
            status: "OK".to_string(),
            healthy: true,
            tables,
        },
        Err(e) => SourceStatus {
            name: "local",
            status: format!("UNHEALTHY ({})", e),
            healthy: false,
            tables: Vec::new(),
        },
    }
}

fn not_configured(name: &'static str) -> SourceStatus {
    SourceStatus {
        name,
        status: "NOT CONFIGURED".to_string(),
        healthy: false,
        tables: Vec::new(),
    }
}

pub async fn list_sources(config: &Config) -> Result<()> {
    println!("{:<10} {:<8} {:<40} TABLES", "CONNECTOR", "HEALTHY", "STATUS");
    for source in check_sources(config).await {
        let tables = if source.tables.is_empty() {
            "-".to_string()
        } else {
            source.tables.join(", ")
        };
        println!(
            "{:<10} {:<8} {:<40} {}",
            source.name, source.healthy, source.status, tables
        );
    }
    Ok(())
}

//! # opsync
//!
//! Two-way record synchronization between a hosted workspace and a local
//! mirror, plus a typed relationship graph over the synced entities.
//!
//! Both sides are treated as independently mutable sources of truth. There
//! is no shared transaction: each pass pulls both sides, resolves every
//! record id on its own, and pushes the winners back to whichever side
//! lacks them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐                       ┌──────────────┐
//! │   Remote     │◀──── pull / push ────▶│    Local     │
//! │  connector   │          │            │  connector   │
//! └──────────────┘          ▼            └──────────────┘
//!                  ┌──────────────────┐
//!   ChangePoller ─▶│ Reconciliation   │──▶ audit / telemetry / checkpoints
//!   (drift only)   │     Engine       │──▶ entity index
//!                  └──────────────────┘            │
//!                                                  ▼
//!                                     ┌──────────────────────────┐
//!                                     │ RelationshipGraphService │
//!                                     └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! opsync init                       # create database
//! opsync sources                    # check connector configuration
//! opsync sync run                   # full two-way pass
//! opsync sync run --fast tasks      # incremental pass over one table
//! opsync sync watch                 # poll for drift until Ctrl-C
//! opsync relations graph T-42 --depth 2
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Canonical record, merge decisions, fingerprints |
//! | [`connector`] | Connector trait, retry helper, diff and push reports |
//! | [`connector_remote`] | Hosted workspace connector (HTTP) |
//! | [`connector_local`] | JSON-file mirror connector |
//! | [`engine`] | Reconciliation engine |
//! | [`poller`] | Drift-triggered background sync |
//! | [`graph`] | Relationship graph service |
//! | [`store`] | Entity, audit, telemetry and checkpoint stores |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Error type |

pub mod config;
pub mod connector;
pub mod connector_local;
pub mod connector_remote;
pub mod db;
pub mod engine;
pub mod error;
pub mod graph;
pub mod migrate;
pub mod models;
pub mod poller;
pub mod relations_cmd;
pub mod sources;
pub mod store;
pub mod sync_cmd;

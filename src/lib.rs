//! # commcare-sync
//!
//! Incremental, resumable exports of CommCare HQ data into tables.
//!
//! A JSON query maps hierarchical form and case records to flat tables.
//! The orchestrator pages through each resource in a stable order, writes
//! every page's rows to the configured sinks, and only then commits the
//! page's watermark, so an interrupted export resumes where the last fully
//! written page ended.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │  HqSource   │──▶│ Orchestrator │──▶│ Sinks            │
//! │  (reqwest)  │   │ query plans  │   │ SQL/CSV/XLSX/JSON │
//! └─────────────┘   └──────┬───────┘   └──────────────────┘
//!                          │ after every page
//!                          ▼
//!                   ┌──────────────┐
//!                   │ Checkpoints  │
//!                   │  (SQLite)    │
//!                   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ccsync init
//! ccsync export --query forms.json --output-format sql --project demo
//! ccsync checkpoints
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`orchestrator`] | Page / checkpoint loop |
//! | [`connector_hq`] | CommCare HQ REST source |
//! | [`export`] | `ccsync export` wiring |
//! | [`checkpoint`] | SQLite checkpoint store |
//! | [`sink_sql`], [`sink_csv`], [`sink_xlsx`], [`sink_json`], [`sink_markdown`] | Table sinks |
//! | [`progress`] | Logging setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod checkpoint;
pub mod config;
pub mod connector_hq;
pub mod db;
pub mod export;
pub mod migrate;
pub mod orchestrator;
pub mod progress;
pub mod sink_csv;
pub mod sink_json;
pub mod sink_markdown;
pub mod sink_sql;
pub mod sink_xlsx;

pub use commcare_sync_core as core;

//! # commcare-sync core
//!
//! Runtime-agnostic building blocks for incremental CommCare exports:
//! replayable sequences, value normalization, content fingerprints,
//! watermark ordering, compiled query plans, and the source / sink /
//! checkpoint traits with in-memory implementations.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. The
//! orchestrator and the concrete backends live in the `commcare-sync`
//! crate.

pub mod error;
pub mod fingerprint;
pub mod log;
pub mod models;
pub mod query;
pub mod replay;
pub mod source;
pub mod store;
pub mod value;
pub mod watermark;

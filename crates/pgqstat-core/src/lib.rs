//! pgqstat-core - query statistics collection for PostgreSQL.
//!
//! Provides:
//! - `collector`: log-tailing and activity-sampling collectors that turn
//!   server telemetry into per-statement `QueryEvent`s
//! - `fingerprint`: literal-stripping normalization and stable query hashes
//! - `storage`: aggregate statistics and log position stores
//! - `monitor`: source selection, event processing, retention
//! - `pg`: connection helpers shared by everything that talks to PostgreSQL

pub mod collector;
pub mod fingerprint;
pub mod monitor;
pub mod pg;
pub mod storage;

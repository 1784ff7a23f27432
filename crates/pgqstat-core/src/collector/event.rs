//! Query execution events produced by the collectors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// One completed statement execution.
///
/// Built the moment a duration line (or a sampling disappearance) is seen and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvent {
    /// Raw query text as logged.
    pub query: String,
    /// Execution time in milliseconds.
    pub duration_ms: f64,
    /// Rows affected or returned. 0 when unknown.
    pub rows: i64,
    /// Log timestamp, or wall-clock time when the line carried none.
    pub timestamp: DateTime<Utc>,
    pub database: String,
    pub user: String,
    /// Bound parameters (`$1` -> literal) from the preceding DETAIL line.
    pub params: Option<BTreeMap<String, String>>,
}

impl QueryEvent {
    /// Creates an event with no connection metadata attached.
    pub fn new(query: impl Into<String>, duration_ms: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            query: query.into(),
            duration_ms,
            rows: 0,
            timestamp,
            database: String::new(),
            user: String::new(),
            params: None,
        }
    }
}

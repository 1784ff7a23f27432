//! In-memory aggregate store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use super::{StatsStore, StoreError};

/// Aggregated statistics for one query fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStats {
    pub fingerprint: u64,
    /// Normalized query text.
    pub query: String,
    pub calls: u64,
    pub total_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    pub total_rows: i64,
    /// Unix timestamp (seconds).
    pub first_seen: i64,
    /// Unix timestamp (seconds).
    pub last_seen: i64,
    /// JSON-encoded parameters of the most recent execution that had any.
    pub sample_params: Option<String>,
}

impl QueryStats {
    pub fn mean_time_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_time_ms / self.calls as f64
        }
    }
}

/// Ordering for `MemoryStatsStore::top`. Always descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    TotalTime,
    Calls,
    MeanTime,
    Rows,
}

/// Mutex-guarded map keyed by fingerprint.
#[derive(Debug, Default)]
pub struct MemoryStatsStore {
    rows: Mutex<HashMap<u64, QueryStats>>,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, QueryStats>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `upsert` with an explicit clock.
    pub fn upsert_at(
        &self,
        fingerprint: u64,
        normalized_query: &str,
        duration_ms: f64,
        rows: i64,
        sample_params: Option<String>,
        now: DateTime<Utc>,
    ) {
        let now = now.timestamp();
        let mut map = self.lock();
        match map.get_mut(&fingerprint) {
            Some(stats) => {
                stats.calls += 1;
                stats.total_time_ms += duration_ms;
                stats.min_time_ms = stats.min_time_ms.min(duration_ms);
                stats.max_time_ms = stats.max_time_ms.max(duration_ms);
                stats.total_rows += rows;
                stats.last_seen = now;
                if sample_params.is_some() {
                    stats.sample_params = sample_params;
                }
            }
            None => {
                map.insert(
                    fingerprint,
                    QueryStats {
                        fingerprint,
                        query: normalized_query.to_string(),
                        calls: 1,
                        total_time_ms: duration_ms,
                        min_time_ms: duration_ms,
                        max_time_ms: duration_ms,
                        total_rows: rows,
                        first_seen: now,
                        last_seen: now,
                        sample_params,
                    },
                );
            }
        }
    }

    /// `cleanup` with an explicit clock.
    pub fn cleanup_at(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        // A retention too large to represent never expires anything.
        let Some(cutoff) = TimeDelta::from_std(retention)
            .ok()
            .and_then(|r| now.checked_sub_signed(r))
        else {
            return 0;
        };
        let cutoff = cutoff.timestamp();

        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, stats| stats.last_seen >= cutoff);
        before - map.len()
    }

    pub fn get(&self, fingerprint: u64) -> Option<QueryStats> {
        self.lock().get(&fingerprint).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Up to `limit` aggregates, highest `sort` first.
    pub fn top(&self, sort: SortField, limit: usize) -> Vec<QueryStats> {
        let mut all: Vec<QueryStats> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| match sort {
            SortField::TotalTime => b.total_time_ms.total_cmp(&a.total_time_ms),
            SortField::Calls => b.calls.cmp(&a.calls),
            SortField::MeanTime => b.mean_time_ms().total_cmp(&a.mean_time_ms()),
            SortField::Rows => b.total_rows.cmp(&a.total_rows),
        });
        all.truncate(limit);
        all
    }
}

impl StatsStore for MemoryStatsStore {
    fn upsert(
        &self,
        fingerprint: u64,
        normalized_query: &str,
        duration_ms: f64,
        rows: i64,
        sample_params: Option<String>,
    ) -> Result<(), StoreError> {
        self.upsert_at(
            fingerprint,
            normalized_query,
            duration_ms,
            rows,
            sample_params,
            Utc::now(),
        );
        Ok(())
    }

    fn cleanup(&self, retention: Duration) -> Result<usize, StoreError> {
        Ok(self.cleanup_at(retention, Utc::now()))
    }
}

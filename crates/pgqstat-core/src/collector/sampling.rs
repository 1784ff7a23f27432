//! pg_stat_activity sampling collector.
//!
//! Fallback for servers whose logs are unreachable. Each tick snapshots the
//! running statements; a statement tracked on an earlier tick and missing
//! from the current one has completed and becomes a `QueryEvent`.
//! Statements shorter than one tick are never seen.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::Receiver;
use postgres::Client;
use tracing::{debug, info};

use super::stream::{self, Publisher};
use super::{CollectorError, QueryCollector, QueryEvent, StopSignal};
use crate::pg::format_postgres_error;

/// Default tick between snapshots.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

const ACTIVITY_QUERY: &str = "/* pgqstat */ SELECT \
        pid, \
        COALESCE(usename, '') AS usename, \
        COALESCE(datname, '') AS datname, \
        query, \
        (EXTRACT(EPOCH FROM query_start) * 1000)::bigint AS query_start_ms \
    FROM pg_stat_activity \
    WHERE state = 'active' \
        AND query NOT LIKE '%pg_stat_activity%' \
        AND pid != pg_backend_pid() \
        AND query_start IS NOT NULL";

/// One running statement as reported by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveQuery {
    pub pid: i32,
    pub user: String,
    pub database: String,
    pub query: String,
    pub query_start: DateTime<Utc>,
}

/// Source of running-statement snapshots.
pub trait ActivitySource: Send {
    fn running_queries(&mut self) -> Result<Vec<ActiveQuery>, CollectorError>;
}

/// Reads `pg_stat_activity`, skipping our own backend.
pub struct PgActivitySource {
    client: Client,
}

impl PgActivitySource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ActivitySource for PgActivitySource {
    fn running_queries(&mut self) -> Result<Vec<ActiveQuery>, CollectorError> {
        let rows = self
            .client
            .query(ACTIVITY_QUERY, &[])
            .map_err(|e| CollectorError::Query {
                context: "pg_stat_activity".to_string(),
                message: format_postgres_error(&e),
            })?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let start_ms: i64 = row.try_get("query_start_ms").ok()?;
                Some(ActiveQuery {
                    pid: row.try_get("pid").ok()?,
                    user: row.try_get("usename").unwrap_or_default(),
                    database: row.try_get("datname").unwrap_or_default(),
                    query: row.try_get("query").unwrap_or_default(),
                    query_start: DateTime::from_timestamp_millis(start_ms)?,
                })
            })
            .collect())
    }
}

/// Synthesizes query events from successive activity snapshots.
pub struct SamplingCollector {
    source: Box<dyn ActivitySource>,
    interval: Duration,
    /// Statements seen running, keyed by backend pid. First sighting wins.
    tracked: HashMap<i32, ActiveQuery>,
    events_tx: Publisher<QueryEvent>,
    errors_tx: Publisher<CollectorError>,
    events_rx: Receiver<QueryEvent>,
    errors_rx: Receiver<CollectorError>,
}

impl SamplingCollector {
    pub fn new(
        source: Box<dyn ActivitySource>,
        interval: Duration,
        event_capacity: usize,
        error_capacity: usize,
    ) -> Self {
        let (events_tx, events_rx) = stream::bounded(event_capacity, "events");
        let (errors_tx, errors_rx) = stream::bounded(error_capacity, "errors");
        Self {
            source,
            interval,
            tracked: HashMap::new(),
            events_tx,
            errors_tx: errors_tx.quiet(),
            events_rx,
            errors_rx,
        }
    }

    /// Number of statements currently tracked as running.
    pub fn tracked(&self) -> usize {
        self.tracked.len()
    }

    /// Takes one snapshot at wall-clock `now`. Returns events published.
    pub fn sample(&mut self, now: DateTime<Utc>) -> usize {
        let running = match self.source.running_queries() {
            Ok(running) => running,
            Err(e) => {
                debug!(error = %e, "activity snapshot failed");
                self.errors_tx.publish(e);
                return 0;
            }
        };

        let present: HashSet<i32> = running.iter().map(|q| q.pid).collect();
        for query in running {
            self.tracked.entry(query.pid).or_insert(query);
        }

        let finished: Vec<i32> = self
            .tracked
            .keys()
            .filter(|pid| !present.contains(pid))
            .copied()
            .collect();

        let mut published = 0;
        for pid in finished {
            let Some(done) = self.tracked.remove(&pid) else {
                continue;
            };
            let Some(duration_ms) = (now - done.query_start)
                .num_microseconds()
                .map(|us| us as f64 / 1000.0)
            else {
                continue;
            };
            if duration_ms <= 0.0 {
                debug!(pid, duration_ms, "dropping sample with non-positive duration");
                continue;
            }

            let event = QueryEvent {
                query: done.query,
                duration_ms,
                rows: 0,
                timestamp: now,
                database: done.database,
                user: done.user,
                params: None,
            };
            if self.events_tx.publish(event) {
                published += 1;
            }
        }
        published
    }

    /// Producer loop: immediate snapshot, then one per interval until `stop`.
    pub fn run(mut self, stop: StopSignal) {
        info!(interval_ms = self.interval.as_millis() as u64, "sampling collector started");

        self.sample(Utc::now());
        while !stop.wait(self.interval) {
            self.sample(Utc::now());
        }

        info!(tracked = self.tracked.len(), "sampling collector stopped");
    }
}

impl QueryCollector for SamplingCollector {
    fn events(&self) -> Receiver<QueryEvent> {
        self.events_rx.clone()
    }

    fn errors(&self) -> Receiver<CollectorError> {
        self.errors_rx.clone()
    }

    fn dropped_events(&self) -> Arc<AtomicU64> {
        self.events_tx.drop_counter()
    }

    fn start(self: Box<Self>, stop: StopSignal) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("pgqstat-sampling".to_string())
            .spawn(move || (*self).run(stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::VecDeque;

    /// Replays scripted snapshots; empty once exhausted.
    struct ScriptedActivity {
        snapshots: VecDeque<Result<Vec<ActiveQuery>, CollectorError>>,
    }

    impl ActivitySource for ScriptedActivity {
        fn running_queries(&mut self) -> Result<Vec<ActiveQuery>, CollectorError> {
            self.snapshots.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_735_689_600_000 + ms).unwrap()
    }

    fn active(pid: i32, query: &str, start_ms: i64) -> ActiveQuery {
        ActiveQuery {
            pid,
            user: "app".to_string(),
            database: "shop".to_string(),
            query: query.to_string(),
            query_start: at(start_ms),
        }
    }

    fn collector(snapshots: Vec<Result<Vec<ActiveQuery>, CollectorError>>) -> SamplingCollector {
        let source = ScriptedActivity {
            snapshots: snapshots.into(),
        };
        SamplingCollector::new(Box::new(source), DEFAULT_REFRESH_INTERVAL, 16, 4)
    }

    #[test]
    fn test_completed_statement_becomes_event() {
        let mut c = collector(vec![
            Ok(vec![active(10, "SELECT slow()", 0), active(11, "SELECT other()", 0)]),
            Ok(vec![active(11, "SELECT other()", 0)]),
        ]);
        let events = c.events();

        assert_eq!(c.sample(at(1_000)), 0);
        assert_eq!(c.tracked(), 2);

        assert_eq!(c.sample(at(5_000)), 1);
        let event = events.try_recv().unwrap();
        assert_eq!(event.query, "SELECT slow()");
        assert_eq!(event.duration_ms, 5_000.0);
        assert_eq!(event.rows, 0);
        assert_eq!(event.database, "shop");
        assert_eq!(event.user, "app");
        assert_eq!(event.timestamp, at(5_000));
        assert_eq!(c.tracked(), 1);
    }

    #[test]
    fn test_first_sighting_is_kept() {
        let mut c = collector(vec![
            Ok(vec![active(10, "SELECT a()", 0)]),
            Ok(vec![active(10, "SELECT b()", 3_000)]),
            Ok(vec![]),
        ]);
        let events = c.events();
        c.sample(at(1_000));
        c.sample(at(4_000));
        c.sample(at(6_000));

        let event = events.try_recv().unwrap();
        assert_eq!(event.query, "SELECT a()");
        assert_eq!(event.duration_ms, 6_000.0);
    }

    #[test]
    fn test_non_positive_duration_is_dropped() {
        let mut c = collector(vec![Ok(vec![active(10, "SELECT skew()", 10_000)]), Ok(vec![])]);
        let events = c.events();
        c.sample(at(0));
        assert_eq!(c.sample(at(5_000)), 0);
        assert!(events.try_recv().is_err());
        assert_eq!(c.tracked(), 0);
    }

    #[test]
    fn test_source_failure_goes_to_error_stream() {
        let mut c = collector(vec![Err(CollectorError::Query {
            context: "pg_stat_activity".to_string(),
            message: "FATAL: terminating connection".to_string(),
        })]);
        let errors = c.errors();
        assert_eq!(c.sample(at(0)), 0);
        assert!(matches!(errors.try_recv().unwrap(), CollectorError::Query { .. }));
    }

    #[test]
    fn test_thread_closes_streams_on_stop() {
        let c = Box::new(SamplingCollector::new(
            Box::new(ScriptedActivity {
                snapshots: VecDeque::new(),
            }),
            Duration::from_millis(20),
            4,
            4,
        ));
        let events = c.events();
        let stop = StopSignal::new();
        let handle = c.start(stop.clone()).unwrap();
        stop.trigger();
        handle.join().unwrap();
        assert!(events.recv().is_err());
    }
}

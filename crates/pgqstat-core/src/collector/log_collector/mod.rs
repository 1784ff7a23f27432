//! PostgreSQL log file collector.
//!
//! Tails every log file matching `log_dir/log_pattern`, reassembles
//! multi-line entries, correlates statement and duration lines per backend
//! pid, deduplicates re-read executions and publishes `QueryEvent`s.

pub mod dedup;
#[cfg(test)]
pub(crate) mod mock;
pub mod parser;
pub mod source;
pub mod tailer;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;
use tracing::{debug, info, warn};

use super::error::NO_LOG_FILES_GUIDANCE;
use super::stream::{self, Publisher};
use super::{CollectorError, QueryCollector, QueryEvent, StopSignal};
use crate::storage::PositionStore;

use dedup::Deduplicator;
use parser::{LineClassifier, PendingState};
use source::LogSource;
use tailer::FileTailer;

/// Default tick between reads.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How long a dedup key is remembered.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Tick for dedup purge and pending-state ceiling checks.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);
/// Pending-state size above which the maps are cleared wholesale.
pub const DEFAULT_PENDING_CEILING: usize = 1000;
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;
pub const DEFAULT_ERROR_CAPACITY: usize = 10;

/// Log collector settings.
#[derive(Debug, Clone)]
pub struct LogCollectorConfig {
    pub log_dir: PathBuf,
    /// Glob matched against file names in `log_dir`.
    pub log_pattern: String,
    pub poll_interval: Duration,
    pub dedup_window: Duration,
    pub purge_interval: Duration,
    pub pending_ceiling: usize,
    pub event_capacity: usize,
    pub error_capacity: usize,
}

impl LogCollectorConfig {
    pub fn new(log_dir: impl Into<PathBuf>, log_pattern: impl Into<String>) -> Self {
        Self {
            log_dir: log_dir.into(),
            log_pattern: log_pattern.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            pending_ceiling: DEFAULT_PENDING_CEILING,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            error_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }
}

/// State touched for every log entry: owned by the producer thread only.
struct EntryReader {
    source: Box<dyn LogSource>,
    tailer: FileTailer,
    classifier: LineClassifier,
    pending: PendingState,
    dedup: Deduplicator,
}

impl EntryReader {
    /// Reads `path` and passes every new, non-duplicate event to `sink`.
    fn read_file(
        &mut self,
        path: &Path,
        stop: &StopSignal,
        mut sink: impl FnMut(QueryEvent),
    ) -> Result<(), CollectorError> {
        let Self {
            source,
            tailer,
            classifier,
            pending,
            dedup,
        } = self;

        tailer.read_file(source.as_mut(), path, stop, |entry| {
            if let Some(event) = classifier.process(entry, pending)
                && dedup.observe(&event, Instant::now())
            {
                sink(event);
            }
        })?;
        Ok(())
    }
}

/// Collects query events from PostgreSQL log files.
pub struct LogCollector {
    config: LogCollectorConfig,
    reader: EntryReader,
    events_tx: Publisher<QueryEvent>,
    errors_tx: Publisher<CollectorError>,
    events_rx: Receiver<QueryEvent>,
    errors_rx: Receiver<CollectorError>,
}

impl LogCollector {
    /// Creates a collector reading through `source`.
    ///
    /// Without a position store every run starts each file from offset 0.
    pub fn new(
        config: LogCollectorConfig,
        source: Box<dyn LogSource>,
        positions: Option<Arc<dyn PositionStore>>,
    ) -> Self {
        let (events_tx, events_rx) = stream::bounded(config.event_capacity, "events");
        let (errors_tx, errors_rx) = stream::bounded(config.error_capacity, "errors");

        Self {
            reader: EntryReader {
                source,
                tailer: FileTailer::new(positions),
                classifier: LineClassifier::new(),
                pending: PendingState::new(),
                dedup: Deduplicator::new(config.dedup_window),
            },
            config,
            events_tx,
            errors_tx: errors_tx.quiet(),
            events_rx,
            errors_rx,
        }
    }

    pub fn config(&self) -> &LogCollectorConfig {
        &self.config
    }

    /// Lists log files matching the configured pattern, oldest first.
    pub fn find_log_files(&mut self) -> Result<Vec<PathBuf>, CollectorError> {
        let files = self
            .reader
            .source
            .list_files(&self.config.log_dir, &self.config.log_pattern)?;

        if files.is_empty() {
            return Err(CollectorError::NoLogFiles {
                pattern: self
                    .config
                    .log_dir
                    .join(&self.config.log_pattern)
                    .display()
                    .to_string(),
                guidance: NO_LOG_FILES_GUIDANCE.to_string(),
            });
        }
        Ok(files)
    }

    /// Seeds per-file offsets from the position store.
    pub fn load_positions(&mut self) {
        match self.find_log_files() {
            Ok(files) => {
                self.reader.tailer.load_positions(&files);
                debug!(files = files.len(), "positions loaded");
            }
            Err(e) => debug!(error = %e, "no files to load positions for"),
        }
    }

    /// Reads every matching file once. Returns the number of events published.
    ///
    /// Failures are reported on the error stream; a failing file does not
    /// stop the others from being read.
    pub fn read_all_files(&mut self, stop: &StopSignal) -> usize {
        let files = match self.find_log_files() {
            Ok(files) => files,
            Err(e) => {
                self.report(e);
                return 0;
            }
        };

        let mut published = 0;
        for path in &files {
            if stop.is_stopped() {
                break;
            }
            match self.read_file(path, stop) {
                Ok(n) => published += n,
                Err(e) => self.report(e),
            }
        }
        published
    }

    /// Reads new entries from one file. Returns the number of events published.
    pub fn read_file(&mut self, path: &Path, stop: &StopSignal) -> Result<usize, CollectorError> {
        let mut published = 0;
        let events_tx = &self.events_tx;
        self.reader.read_file(path, stop, |event| {
            if events_tx.publish(event) {
                published += 1;
            }
        })?;
        Ok(published)
    }

    /// Reads every matching file once, passing events straight to `on_event`
    /// instead of the event stream. `progress(current, total)` is called
    /// after each file.
    pub fn parse_all(
        &mut self,
        stop: &StopSignal,
        mut progress: impl FnMut(usize, usize),
        mut on_event: impl FnMut(QueryEvent),
    ) -> Result<usize, CollectorError> {
        let files = self.find_log_files()?;
        let total = files.len();
        let mut count = 0;

        for (i, path) in files.iter().enumerate() {
            if stop.is_stopped() {
                break;
            }
            let result = self.reader.read_file(path, stop, |event| {
                count += 1;
                on_event(event);
            });
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "failed to parse log file");
                self.report(e);
            }
            progress(i + 1, total);
        }
        Ok(count)
    }

    /// Forgets expired dedup keys and abandoned pending state.
    pub fn purge_stale(&mut self, now: Instant) {
        let purged = self.reader.dedup.purge(now);
        let cleared = self
            .reader
            .pending
            .clear_if_over(self.config.pending_ceiling);
        if purged > 0 || cleared {
            debug!(purged, pending_cleared = cleared, "purged stale collector state");
        }
    }

    fn report(&self, error: CollectorError) {
        match error.guidance() {
            Some(guidance) => debug!(error = %error, guidance, "log collector error"),
            None => debug!(error = %error, "log collector error"),
        }
        self.errors_tx.publish(error);
    }

    /// Producer loop: immediate read, then one read per poll interval until
    /// `stop` is triggered. Dropping `self` closes both streams.
    pub fn run(mut self, stop: StopSignal) {
        info!(
            dir = %self.config.log_dir.display(),
            pattern = %self.config.log_pattern,
            "log collector started"
        );

        self.load_positions();
        self.read_all_files(&stop);

        let mut last_purge = Instant::now();
        while !stop.wait(self.config.poll_interval) {
            self.read_all_files(&stop);

            if last_purge.elapsed() >= self.config.purge_interval {
                self.purge_stale(Instant::now());
                last_purge = Instant::now();
            }
        }

        info!("log collector stopped");
    }
}

impl QueryCollector for LogCollector {
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
            .name("pgqstat-logs".to_string())
            .spawn(move || (*self).run(stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::mock::MockLogSource;
    use super::source::FsLogSource;
    use std::sync::atomic::Ordering;

    fn collector(dir: &Path) -> LogCollector {
        let config = LogCollectorConfig::new(dir, "postgresql-*.log");
        LogCollector::new(config, Box::new(FsLogSource::new()), None)
    }

    fn write_log(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(&path, content).unwrap();
        path
    }

    fn drain(rx: &Receiver<QueryEvent>) -> Vec<QueryEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_health_check_never_reaches_stream() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "postgresql-1.log",
            &["2025-01-01 00:00:00.000 UTC [10] LOG:  duration: 1.234 ms  statement: SELECT 1"],
        );

        let mut c = collector(dir.path());
        let events = c.events();
        assert_eq!(c.read_all_files(&StopSignal::new()), 0);
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn test_pid_correlation_across_file() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "postgresql-1.log",
            &[
                "2025-01-01 00:00:00.000 UTC [100] LOG:  execute <unnamed>: SELECT A FROM t",
                "2025-01-01 00:00:00.000 UTC [200] LOG:  statement: SELECT B FROM t",
                "2025-01-01 00:00:00.010 UTC [200] LOG:  duration: 2.000 ms",
                "2025-01-01 00:00:00.020 UTC [100] LOG:  duration: 9.000 ms",
            ],
        );

        let mut c = collector(dir.path());
        let events = c.events();
        c.read_all_files(&StopSignal::new());

        let got: Vec<_> = drain(&events)
            .into_iter()
            .map(|e| (e.query, e.duration_ms))
            .collect();
        assert_eq!(
            got,
            vec![
                ("SELECT B FROM t".to_string(), 2.0),
                ("SELECT A FROM t".to_string(), 9.0)
            ]
        );
    }

    #[test]
    fn test_reread_after_restart_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            dir.path(),
            "postgresql-1.log",
            &["2025-01-01 00:00:00.000 UTC [5] LOG:  duration: 3.000 ms  statement: SELECT * FROM orders"],
        );

        let mut c = collector(dir.path());
        let events = c.events();
        assert_eq!(c.read_all_files(&StopSignal::new()), 1);

        // Offset lost: the same bytes are read again.
        c.reader.tailer.set_offset(&path, 0);
        assert_eq!(c.read_all_files(&StopSignal::new()), 0);
        assert_eq!(drain(&events).len(), 1);
    }

    #[test]
    fn test_detail_parameters_consumed_once() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "postgresql-1.log",
            &[
                "2025-01-01 00:00:00.000 UTC [77] LOG:  execute S_1: SELECT * FROM users WHERE id = $1 AND org = $2",
                "2025-01-01 00:00:00.000 UTC [77] DETAIL:  parameters: $1 = '500', $2 = 'acme'",
                "2025-01-01 00:00:00.001 UTC [77] LOG:  duration: 0.500 ms",
                "2025-01-01 00:00:01.000 UTC [77] LOG:  duration: 0.700 ms  statement: SELECT now() FROM t",
            ],
        );

        let mut c = collector(dir.path());
        let events = c.events();
        c.read_all_files(&StopSignal::new());

        let got = drain(&events);
        assert_eq!(got.len(), 2);
        let params = got[0].params.as_ref().unwrap();
        assert_eq!(params["$1"], "500");
        assert_eq!(params["$2"], "acme");
        assert!(got[1].params.is_none());
    }

    #[test]
    fn test_no_log_files_reported_with_guidance() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = collector(dir.path());
        let errors = c.errors();

        c.read_all_files(&StopSignal::new());

        let err = errors.try_recv().unwrap();
        assert!(matches!(err, CollectorError::NoLogFiles { .. }));
        assert!(err.guidance().unwrap().contains("log_directory"));
    }

    #[test]
    fn test_full_event_stream_drops_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "postgresql-1.log",
            &[
                "2025-01-01 00:00:00.000 UTC [1] LOG:  duration: 1.0 ms  statement: SELECT a FROM t",
                "2025-01-01 00:00:00.000 UTC [1] LOG:  duration: 1.0 ms  statement: SELECT b FROM t",
                "2025-01-01 00:00:00.000 UTC [1] LOG:  duration: 1.0 ms  statement: SELECT c FROM t",
            ],
        );

        let config = LogCollectorConfig::new(dir.path(), "postgresql-*.log").with_event_capacity(1);
        let mut c = LogCollector::new(config, Box::new(FsLogSource::new()), None);
        let events = c.events();
        let dropped = c.dropped_events();

        assert_eq!(c.read_all_files(&StopSignal::new()), 1);
        assert_eq!(dropped.load(Ordering::Relaxed), 2);
        assert_eq!(drain(&events).len(), 1);
    }

    #[test]
    fn test_parse_all_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "postgresql-1.log",
            &["2025-01-01 00:00:00.000 UTC [1] LOG:  duration: 1.0 ms  statement: SELECT a FROM t"],
        );
        write_log(
            dir.path(),
            "postgresql-2.log",
            &["2025-01-01 00:00:01.000 UTC [2] LOG:  duration: 2.0 ms  statement: SELECT b FROM t"],
        );

        let mut c = collector(dir.path());
        let mut progress = Vec::new();
        let mut seen = Vec::new();
        let count = c
            .parse_all(
                &StopSignal::new(),
                |cur, total| progress.push((cur, total)),
                |e| seen.push(e.query),
            )
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_purge_clears_oversized_pending_state() {
        let dir = tempfile::tempdir().unwrap();
        let lines: Vec<String> = (0..5)
            .map(|pid| format!("2025-01-01 00:00:00.000 UTC [{pid}] LOG:  statement: SELECT {pid} FROM t"))
            .collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        write_log(dir.path(), "postgresql-1.log", &refs);

        let mut config = LogCollectorConfig::new(dir.path(), "postgresql-*.log");
        config.pending_ceiling = 3;
        let mut c = LogCollector::new(config, Box::new(FsLogSource::new()), None);
        c.read_all_files(&StopSignal::new());
        assert_eq!(c.reader.pending.query_count(), 5);

        c.purge_stale(Instant::now());
        assert_eq!(c.reader.pending.query_count(), 0);
    }

    #[test]
    fn test_thread_closes_streams_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "postgresql-1.log",
            &["2025-01-01 00:00:00.000 UTC [1] LOG:  duration: 1.0 ms  statement: SELECT a FROM t"],
        );

        let config = LogCollectorConfig::new(dir.path(), "postgresql-*.log")
            .with_poll_interval(Duration::from_millis(20));
        let c = Box::new(LogCollector::new(config, Box::new(FsLogSource::new()), None));
        let events = c.events();
        let stop = StopSignal::new();
        let handle = c.start(stop.clone()).unwrap();

        let first = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.query, "SELECT a FROM t");

        stop.trigger();
        handle.join().unwrap();
        assert!(events.recv().is_err());
    }

    #[test]
    fn test_failing_file_reported_while_others_are_read() {
        let mut source = MockLogSource::new(1024);
        source.append(
            "/logs/postgresql-1.log",
            "2025-01-01 00:00:00.000 UTC [1] LOG:  duration: 1.0 ms  statement: SELECT a FROM t\n",
        );
        source.append(
            "/logs/postgresql-2.log",
            "2025-01-01 00:00:01.000 UTC [2] LOG:  duration: 2.0 ms  statement: SELECT b FROM t\n",
        );
        source.fail_reads("/logs/postgresql-1.log");

        let config = LogCollectorConfig::new("/logs", "postgresql-*.log");
        let mut c = LogCollector::new(config, Box::new(source), None);
        let events = c.events();
        let errors = c.errors();

        assert_eq!(c.read_all_files(&StopSignal::new()), 1);
        let got = drain(&events);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].query, "SELECT b FROM t");

        let err = errors.try_recv().unwrap();
        assert!(matches!(err, CollectorError::Query { .. }));
        assert!(err.to_string().contains("postgresql-1.log"));
        assert!(errors.try_recv().is_err());
    }

    #[test]
    fn test_capped_reads_yield_whole_multiline_statement() {
        let head = "2025-01-01 00:00:00.000 UTC [1] LOG:  duration: 1.000 ms  statement: SELECT id\n";
        let mut source = MockLogSource::new(head.len() as u64 + 5);
        source.append("/logs/postgresql-1.log", head);
        source.append("/logs/postgresql-1.log", "\tFROM accounts WHERE id = 1\n");

        let config = LogCollectorConfig::new("/logs", "postgresql-*.log");
        let mut c = LogCollector::new(config, Box::new(source), None);
        let events = c.events();

        assert_eq!(c.read_all_files(&StopSignal::new()), 0);
        assert_eq!(c.read_all_files(&StopSignal::new()), 1);
        let got = drain(&events);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].query, "SELECT id\nFROM accounts WHERE id = 1");
        assert_eq!(got[0].duration_ms, 1.0);
    }
}

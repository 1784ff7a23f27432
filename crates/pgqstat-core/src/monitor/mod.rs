//! Query monitor.
//!
//! Chooses a collector, runs it on a producer thread and consumes its event
//! stream on a second thread: every event is fingerprinted and upserted into
//! the stats store, and retention cleanup runs on a slower tick.
//!
//! Source selection:
//! - log directory + pattern configured and reachable -> `LogCollector`
//!   (direct file access, or read-through via the server)
//! - otherwise -> `SamplingCollector` over `pg_stat_activity`
//!
//! With a connection, SELECTs reporting zero rows get the planner's row
//! estimate (see `explain`).

pub mod explain;
pub mod logging;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, select};
use postgres::Client;
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::collector::log_collector::source::{FsLogSource, LogSource, PgReadFileSource};
use crate::collector::log_collector::{
    DEFAULT_ERROR_CAPACITY, DEFAULT_EVENT_CAPACITY, DEFAULT_POLL_INTERVAL,
};
use crate::collector::sampling::DEFAULT_REFRESH_INTERVAL;
use crate::collector::{
    CollectorError, LogCollector, LogCollectorConfig, PgActivitySource, QueryCollector,
    QueryEvent, SamplingCollector, StopSignal,
};
use crate::fingerprint::{Fingerprinter, QueryFingerprinter};
use crate::pg::{self, format_postgres_error};
use crate::storage::{MemoryPositionStore, PositionStore, StatsStore, StoreError};

use explain::{ExplainCache, ExplainError, ExplainResult, PgPlanner, Planner, estimate_rows, plan_sql};
pub use logging::{LoggingStatus, check_logging_status, enable_logging, log_filename_to_glob};

/// How long the consumer waits for an event before re-checking the stop signal.
const CONSUMER_STOP_CHECK: Duration = Duration::from_millis(100);

/// Monitor start failure.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("read-through log access requires a database connection")]
    NoDatabase,

    #[error("no log directory configured")]
    NoLogDirectory,

    #[error("PostgreSQL: {0}")]
    Connect(String),

    #[error("{context}: {message}")]
    Query { context: String, message: String },

    #[error("monitor is already running")]
    AlreadyRunning,

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    Explain(#[from] ExplainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    Stopped,
    Running,
    /// The last start attempt failed.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Sampling,
    LogParsing,
}

/// How log files are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogAccess {
    /// Direct access when the directory is readable, else read-through,
    /// else sampling.
    #[default]
    Auto,
    FileSystem,
    ReadThrough,
}

/// Monitor settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sampling tick.
    pub refresh_interval: Duration,
    /// Log read tick.
    pub log_poll_interval: Duration,
    /// Aggregates not seen for this long are deleted.
    pub retention: Duration,
    pub cleanup_interval: Duration,
    pub log_dir: Option<PathBuf>,
    pub log_pattern: Option<String>,
    /// Server `log_line_prefix`, as discovered.
    pub log_line_prefix: Option<String>,
    pub access: LogAccess,
    pub connection_string: Option<String>,
    /// Ask the planner for a row estimate when a SELECT reports none.
    pub estimate_rows: bool,
    pub event_capacity: usize,
    pub error_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            log_poll_interval: DEFAULT_POLL_INTERVAL,
            retention: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
            log_dir: None,
            log_pattern: None,
            log_line_prefix: None,
            access: LogAccess::Auto,
            connection_string: None,
            estimate_rows: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            error_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }
}

impl MonitorConfig {
    pub fn with_log_files(mut self, dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        self.log_dir = Some(dir.into());
        self.log_pattern = Some(pattern.into());
        self
    }

    pub fn with_access(mut self, access: LogAccess) -> Self {
        self.access = access;
        self
    }

    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_log_poll_interval(mut self, interval: Duration) -> Self {
        self.log_poll_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_estimate_rows(mut self, estimate_rows: bool) -> Self {
        self.estimate_rows = estimate_rows;
        self
    }

    fn log_collector_config(&self) -> Option<LogCollectorConfig> {
        let dir = self.log_dir.as_ref()?;
        let pattern = self.log_pattern.as_ref().filter(|p| !p.is_empty())?;
        Some(
            LogCollectorConfig::new(dir, pattern.as_str())
                .with_poll_interval(self.log_poll_interval)
                .with_event_capacity(self.event_capacity)
                .with_error_capacity(self.error_capacity),
        )
    }
}

/// Fingerprints events and writes them to the stats store.
#[derive(Clone)]
pub struct EventProcessor {
    store: Arc<dyn StatsStore>,
    fingerprinter: Arc<dyn QueryFingerprinter>,
    planner: Option<Arc<dyn Planner>>,
}

impl EventProcessor {
    pub fn new(store: Arc<dyn StatsStore>, fingerprinter: Arc<dyn QueryFingerprinter>) -> Self {
        Self {
            store,
            fingerprinter,
            planner: None,
        }
    }

    /// Fills in missing SELECT row counts from `planner` estimates.
    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// `(fingerprint, normalized)` for `query`. A normalization failure falls
    /// back to the raw text so the execution is still counted.
    pub fn fingerprint(&self, query: &str) -> (u64, String) {
        match self.fingerprinter.fingerprint(query) {
            Ok(result) => result,
            Err(e) => {
                debug!(error = %e, "fingerprint failed, using raw query");
                (xxh3_64(query.as_bytes()), query.to_string())
            }
        }
    }

    /// Aggregates one event.
    pub fn process(&self, event: QueryEvent) {
        let (fingerprint, normalized) = self.fingerprint(&event.query);

        let rows = match &self.planner {
            Some(planner) if event.rows == 0 => {
                estimate_rows(planner.as_ref(), &event.query, event.params.as_ref())
            }
            _ => event.rows,
        };

        let sample_params = event
            .params
            .as_ref()
            .filter(|p| !p.is_empty())
            .and_then(|p| serde_json::to_string(p).ok());

        if let Err(e) = self.store.upsert(
            fingerprint,
            &normalized,
            event.duration_ms,
            rows,
            sample_params,
        ) {
            warn!(fingerprint, error = %e, "failed to store query stats");
        }
    }

    pub fn cleanup(&self, retention: Duration) {
        match self.store.cleanup(retention) {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "removed expired query stats"),
            Err(e) => warn!(error = %e, "query stats cleanup failed"),
        }
    }

    /// Consumer loop.
    ///
    /// Returns when the event stream closes. Once `stop` is triggered the
    /// events already queued are drained before returning.
    pub fn run(
        &self,
        events: Receiver<QueryEvent>,
        errors: Receiver<CollectorError>,
        stop: &StopSignal,
        retention: Duration,
        cleanup_interval: Duration,
    ) {
        let ticker = channel::tick(cleanup_interval);
        let mut errors = errors;
        let mut error_log = ErrorLog::default();

        while !stop.is_stopped() {
            select! {
                recv(events) -> msg => match msg {
                    Ok(event) => {
                        error_log.clear();
                        self.process(event);
                    }
                    Err(_) => return,
                },
                recv(errors) -> msg => match msg {
                    Ok(err) => {
                        error_log.report(&err);
                    }
                    Err(_) => errors = channel::never(),
                },
                recv(ticker) -> _ => self.cleanup(retention),
                default(CONSUMER_STOP_CHECK) => {}
            }
        }

        let mut drained = 0usize;
        for event in events.iter() {
            self.process(event);
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "drained queued events on shutdown");
        }
    }
}

/// Warns about a collector error once, not on every poll that repeats it.
///
/// A different error, or events flowing again, re-arms the warning.
#[derive(Debug, Default)]
struct ErrorLog {
    last: Option<String>,
}

impl ErrorLog {
    /// Logs `err`. Returns `true` if it was logged at warn level.
    fn report(&mut self, err: &CollectorError) -> bool {
        let text = err.to_string();
        if self.last.as_deref() == Some(text.as_str()) {
            debug!(error = %err, "collector error repeated");
            return false;
        }
        match err.guidance() {
            Some(guidance) => warn!(error = %err, guidance, "collector error"),
            None => warn!(error = %err, "collector error"),
        }
        self.last = Some(text);
        true
    }

    fn clear(&mut self) {
        self.last = None;
    }
}

/// Orchestrates collection and aggregation.
pub struct Monitor {
    config: MonitorConfig,
    processor: EventProcessor,
    positions: Option<Arc<dyn PositionStore>>,
    status: MonitorStatus,
    data_source: DataSource,
    logging_checked: bool,
    stop: StopSignal,
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
    dropped_events: Option<Arc<AtomicU64>>,
    planner: Option<Arc<dyn Planner>>,
    explain_cache: ExplainCache,
}

impl Monitor {
    pub fn new(config: MonitorConfig, store: Arc<dyn StatsStore>) -> Self {
        Self {
            config,
            processor: EventProcessor::new(store, Arc::new(Fingerprinter::new())),
            positions: None,
            status: MonitorStatus::Stopped,
            data_source: DataSource::Sampling,
            logging_checked: false,
            stop: StopSignal::new(),
            producer: None,
            consumer: None,
            dropped_events: None,
            planner: None,
            explain_cache: ExplainCache::default(),
        }
    }

    /// Persists log offsets across restarts.
    pub fn with_positions(mut self, positions: Arc<dyn PositionStore>) -> Self {
        self.positions = Some(positions);
        self
    }

    pub fn with_fingerprinter(mut self, fingerprinter: Arc<dyn QueryFingerprinter>) -> Self {
        self.processor.fingerprinter = fingerprinter;
        self
    }

    /// Uses `planner` instead of connecting one on first use.
    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn status(&self) -> MonitorStatus {
        self.status
    }

    pub fn data_source(&self) -> DataSource {
        self.data_source
    }

    /// Events dropped by the current collector because its stream was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
            .as_ref()
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Discovers the server's log location once, when none is configured.
    ///
    /// Only adopts the discovered directory when duration logging is on.
    pub fn configure(&mut self) -> Result<Option<LoggingStatus>, MonitorError> {
        if self.logging_checked || self.config.log_dir.is_some() {
            return Ok(None);
        }
        let Some(mut client) = self.connect_optional()? else {
            return Ok(None);
        };
        self.logging_checked = true;

        let status = check_logging_status(&mut client)?;
        if status.enabled {
            info!(
                dir = %status.log_dir.display(),
                pattern = %status.log_pattern,
                prefix = %status.log_line_prefix,
                "statement logging detected"
            );
            self.config.log_dir = Some(status.log_dir.clone());
            self.config.log_pattern = Some(status.log_pattern.clone());
            self.config.log_line_prefix = Some(status.log_line_prefix.clone());
        } else {
            info!("statement logging disabled (log_min_duration_statement = -1)");
        }
        Ok(Some(status))
    }

    /// Enables statement logging on the server.
    pub fn enable_logging(&self) -> Result<(), MonitorError> {
        let mut client = self.connect_optional()?.ok_or(MonitorError::NoDatabase)?;
        enable_logging(&mut client)
    }

    /// Selects a collector and starts the producer and consumer threads.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        if self.status == MonitorStatus::Running {
            return Err(MonitorError::AlreadyRunning);
        }
        if let Err(e) = self.configure() {
            warn!(error = %e, "logging discovery failed");
        }
        self.attach_planner();

        let selected = match self.log_source() {
            Ok(Some((config, source))) => Ok((
                Box::new(LogCollector::new(config, source, self.positions.clone()))
                    as Box<dyn QueryCollector>,
                DataSource::LogParsing,
            )),
            Ok(None) => self.sampling_collector().map(|c| {
                (Box::new(c) as Box<dyn QueryCollector>, DataSource::Sampling)
            }),
            Err(e) => Err(e),
        };

        match selected {
            Ok((collector, data_source)) => self.start_with(collector, data_source),
            Err(e) => {
                self.status = MonitorStatus::Error;
                Err(e)
            }
        }
    }

    /// Starts with an already-built collector.
    pub fn start_with(
        &mut self,
        collector: Box<dyn QueryCollector>,
        data_source: DataSource,
    ) -> Result<(), MonitorError> {
        if self.status == MonitorStatus::Running {
            return Err(MonitorError::AlreadyRunning);
        }

        let stop = StopSignal::new();
        let events = collector.events();
        let errors = collector.errors();
        self.dropped_events = Some(collector.dropped_events());

        let producer = collector.start(stop.clone()).map_err(|source| {
            self.status = MonitorStatus::Error;
            MonitorError::Spawn {
                name: "collector",
                source,
            }
        })?;

        let processor = self.processor.clone();
        let consumer_stop = stop.clone();
        let retention = self.config.retention;
        let cleanup_interval = self.config.cleanup_interval;
        let consumer = thread::Builder::new()
            .name("pgqstat-consumer".to_string())
            .spawn(move || {
                processor.run(events, errors, &consumer_stop, retention, cleanup_interval)
            });
        let consumer = match consumer {
            Ok(handle) => handle,
            Err(source) => {
                stop.trigger();
                if producer.join().is_err() {
                    error!("collector thread panicked");
                }
                self.status = MonitorStatus::Error;
                return Err(MonitorError::Spawn {
                    name: "consumer",
                    source,
                });
            }
        };

        self.stop = stop;
        self.producer = Some(producer);
        self.consumer = Some(consumer);
        self.data_source = data_source;
        self.status = MonitorStatus::Running;
        info!(source = ?data_source, "query monitor started");
        Ok(())
    }

    /// Stops both threads. Events already queued are aggregated first.
    pub fn stop(&mut self) {
        if self.producer.is_none() && self.consumer.is_none() {
            return;
        }
        self.stop.trigger();

        if let Some(handle) = self.producer.take()
            && handle.join().is_err()
        {
            error!("collector thread panicked");
        }
        if let Some(handle) = self.consumer.take()
            && handle.join().is_err()
        {
            error!("consumer thread panicked");
        }

        self.status = MonitorStatus::Stopped;
        info!(dropped = self.dropped_events(), "query monitor stopped");
    }

    /// Reads every matching log file once, aggregating events synchronously.
    ///
    /// `progress(current, total)` is called after each file. Returns the
    /// number of events aggregated. Without a position store an in-memory one
    /// is installed so a later `start` resumes where the backfill ended.
    pub fn parse_with_progress(
        &mut self,
        stop: &StopSignal,
        progress: impl FnMut(usize, usize),
    ) -> Result<usize, MonitorError> {
        if let Err(e) = self.configure() {
            warn!(error = %e, "logging discovery failed");
        }
        let (config, source) = self.log_source()?.ok_or(MonitorError::NoLogDirectory)?;
        self.attach_planner();
        let positions = self
            .positions
            .get_or_insert_with(|| {
                Arc::new(MemoryPositionStore::new()) as Arc<dyn PositionStore>
            })
            .clone();

        let mut collector = LogCollector::new(config, source, Some(positions));
        let processor = &self.processor;
        let count = collector.parse_all(stop, progress, |event| processor.process(event))?;
        info!(events = count, "log backfill complete");
        Ok(count)
    }

    /// Forgets saved log offsets. A running monitor is restarted so every
    /// log file is read again from the start.
    pub fn reset_positions(&mut self) -> Result<(), MonitorError> {
        let was_running = self.status == MonitorStatus::Running;
        if was_running {
            self.stop();
        }
        if let Some(positions) = &self.positions {
            positions.reset()?;
        }
        info!("log positions reset");
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Plans `query` with EXPLAIN, or EXPLAIN ANALYZE when `analyze` is set
    /// (which executes it, inside a rolled-back transaction).
    ///
    /// Plain plans are cached per fingerprint.
    pub fn explain_plan(&mut self, query: &str, analyze: bool) -> Result<ExplainResult, MonitorError> {
        let (fingerprint, _) = self.processor.fingerprint(query);
        if !analyze && let Some(cached) = self.explain_cache.get(fingerprint) {
            debug!(fingerprint, "explain cache hit");
            return Ok(cached.clone());
        }

        let sql = plan_sql(query, analyze)?;
        let plan = self.planner()?.explain(&sql)?;
        let result = ExplainResult {
            fingerprint,
            query: query.to_string(),
            plan,
            analyze,
            executed_at: chrono::Utc::now().timestamp(),
        };
        if !analyze {
            self.explain_cache.put(result.clone());
        }
        Ok(result)
    }

    /// The planner, connecting one on first use.
    fn planner(&mut self) -> Result<Arc<dyn Planner>, MonitorError> {
        if let Some(planner) = &self.planner {
            return Ok(planner.clone());
        }
        let client = self.connect_optional()?.ok_or(MonitorError::NoDatabase)?;
        let planner: Arc<dyn Planner> = Arc::new(PgPlanner::new(client));
        self.planner = Some(planner.clone());
        Ok(planner)
    }

    /// Hands the planner to the event processor for row estimates.
    fn attach_planner(&mut self) {
        if !self.config.estimate_rows || self.processor.planner.is_some() {
            return;
        }
        match self.planner() {
            Ok(planner) => self.processor.planner = Some(planner),
            Err(MonitorError::NoDatabase) => debug!("no connection, row estimates disabled"),
            Err(e) => warn!(error = %e, "row estimates disabled"),
        }
    }

    /// Log source per the access setting, or `None` to fall back to sampling.
    fn log_source(
        &self,
    ) -> Result<Option<(LogCollectorConfig, Box<dyn LogSource>)>, MonitorError> {
        let Some(config) = self.config.log_collector_config() else {
            return Ok(None);
        };

        match self.config.access {
            LogAccess::FileSystem => Ok(Some((config, Box::new(FsLogSource::new())))),
            LogAccess::ReadThrough => {
                let client = self.connect_optional()?.ok_or(MonitorError::NoDatabase)?;
                Ok(Some((config, Box::new(PgReadFileSource::new(client)))))
            }
            LogAccess::Auto => {
                if std::fs::read_dir(&config.log_dir).is_ok() {
                    debug!(dir = %config.log_dir.display(), "using direct log file access");
                    return Ok(Some((config, Box::new(FsLogSource::new()))));
                }

                let client = match self.connect_optional() {
                    Ok(Some(client)) => client,
                    Ok(None) => return Ok(None),
                    Err(e) => {
                        debug!(error = %e, "read-through check skipped");
                        return Ok(None);
                    }
                };
                match check_read_through(client, &config) {
                    Ok(client) => {
                        debug!(dir = %config.log_dir.display(), "using read-through log access");
                        Ok(Some((config, Box::new(PgReadFileSource::new(client)))))
                    }
                    Err(e) => {
                        info!(error = %e, "log files unreachable, falling back to sampling");
                        Ok(None)
                    }
                }
            }
        }
    }

    fn sampling_collector(&self) -> Result<SamplingCollector, MonitorError> {
        let client = self.connect_optional()?.ok_or(MonitorError::NoDatabase)?;
        Ok(SamplingCollector::new(
            Box::new(PgActivitySource::new(client)),
            self.config.refresh_interval,
            self.config.event_capacity,
            self.config.error_capacity,
        ))
    }

    /// Connects when a connection string is configured.
    fn connect_optional(&self) -> Result<Option<Client>, MonitorError> {
        let Some(conn) = self.config.connection_string.as_deref() else {
            return Ok(None);
        };
        pg::connect(conn)
            .map(Some)
            .map_err(|e| MonitorError::Connect(format_postgres_error(&e)))
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Checks that `pg_ls_dir` works on the log directory.
fn check_read_through(
    mut client: Client,
    config: &LogCollectorConfig,
) -> Result<Client, MonitorError> {
    let dir = config.log_dir.to_string_lossy().into_owned();
    client
        .query_one(
            "/* pgqstat */ SELECT count(*) FROM (SELECT pg_ls_dir($1) LIMIT 1) AS dirs",
            &[&dir],
        )
        .map_err(|e| MonitorError::Query {
            context: "pg_ls_dir".to_string(),
            message: format_postgres_error(&e),
        })?;
    Ok(client)
}

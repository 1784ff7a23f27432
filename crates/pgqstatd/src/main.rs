//! pgqstatd - PostgreSQL query statistics daemon.
//!
//! Tails the server's statement log (or samples pg_stat_activity when the
//! log is unreachable), aggregates executions per normalized query and
//! periodically reports the top queries.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Releases unused memory back to the operating system.
/// Called after a log backfill, which can allocate heavily.
fn release_memory_to_os() {
    // SAFETY: mallctl with a valid NUL-terminated name and no in/out buffers.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgqstat_core::collector::StopSignal;
use pgqstat_core::monitor::{LogAccess, Monitor, MonitorConfig, MonitorError};
use pgqstat_core::pg;
use pgqstat_core::storage::{FilePositionStore, MemoryStatsStore, QueryStats, SortField};

/// PostgreSQL query statistics daemon.
#[derive(Parser)]
#[command(name = "pgqstatd", about = "PostgreSQL query statistics daemon", version)]
struct Args {
    /// Server log directory. Discovered from the server settings when omitted.
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Glob matching log file names inside --log-dir.
    #[arg(long, default_value = "*.log")]
    log_pattern: String,

    /// How log files are read.
    #[arg(long, value_enum, default_value_t = AccessArg::Auto)]
    access: AccessArg,

    /// Sampling interval in seconds (pg_stat_activity fallback).
    #[arg(short, long, default_value = "5")]
    interval: u64,

    /// Log poll interval in milliseconds.
    #[arg(long, default_value = "1000")]
    poll_ms: u64,

    /// Drop statistics for queries not seen for this many days.
    #[arg(long, default_value = "7")]
    retention_days: u64,

    /// Persist log read offsets to this file across restarts.
    #[arg(long, value_name = "PATH")]
    positions_file: Option<PathBuf>,

    /// Parse all existing log files before tailing.
    #[arg(long)]
    backfill: bool,

    /// Enable statement logging on the server (ALTER SYSTEM) and exit.
    #[arg(long)]
    enable_logging: bool,

    /// Print the EXPLAIN plan (JSON) of QUERY and exit.
    #[arg(long, value_name = "QUERY")]
    explain: Option<String>,

    /// With --explain, run EXPLAIN ANALYZE. Executes the query in a rolled-back transaction.
    #[arg(long, requires = "explain")]
    analyze: bool,

    /// Forget saved log positions so every log file is read again.
    #[arg(long, requires = "positions_file")]
    reset_positions: bool,

    /// Estimate rows of SELECTs the log reports none for. Disable with --estimate-rows=false.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    estimate_rows: bool,

    /// Connect to PostgreSQL. Uses PGUSER or $USER. Disable with --postgres=false.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    postgres: bool,

    /// Seconds between top-query reports.
    #[arg(long, default_value = "60")]
    report_interval: u64,

    /// Number of queries per report.
    #[arg(long, default_value = "10")]
    top: usize,

    /// Report ordering.
    #[arg(long, value_enum, default_value_t = SortArg::Total)]
    sort: SortArg,

    /// Print reports to stdout as JSON lines instead of logging them.
    #[arg(long)]
    json: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum AccessArg {
    Auto,
    Fs,
    ReadThrough,
}

impl From<AccessArg> for LogAccess {
    fn from(arg: AccessArg) -> Self {
        match arg {
            AccessArg::Auto => LogAccess::Auto,
            AccessArg::Fs => LogAccess::FileSystem,
            AccessArg::ReadThrough => LogAccess::ReadThrough,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Total,
    Calls,
    Mean,
    Rows,
}

impl From<SortArg> for SortField {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Total => SortField::TotalTime,
            SortArg::Calls => SortField::Calls,
            SortArg::Mean => SortField::MeanTime,
            SortArg::Rows => SortField::Rows,
        }
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgqstatd", "pgqstat_core"] {
        match format!("{target}={level}").parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("invalid log directive for {target}: {e}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Collapses whitespace and truncates a query for single-line display.
fn shorten_query(query: &str, max_chars: usize) -> String {
    let flat = query.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let mut short: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
        short.push_str("...");
        short
    }
}

/// Formats one report row.
fn describe_stats(rank: usize, stats: &QueryStats) -> String {
    format!(
        "#{rank} calls={} total={:.1}ms mean={:.2}ms min={:.2}ms max={:.2}ms rows={} {}",
        stats.calls,
        stats.total_time_ms,
        stats.mean_time_ms(),
        stats.min_time_ms,
        stats.max_time_ms,
        stats.total_rows,
        shorten_query(&stats.query, 120)
    )
}

fn report(store: &MemoryStatsStore, monitor: &Monitor, args: &Args) {
    let top = store.top(args.sort.into(), args.top);

    if args.json {
        match serde_json::to_string(&top) {
            Ok(line) => println!("{line}"),
            Err(e) => error!("Failed to encode report: {}", e),
        }
        return;
    }

    info!(
        "Report: {} distinct queries, {} events dropped",
        store.len(),
        monitor.dropped_events()
    );
    for (i, stats) in top.iter().enumerate() {
        info!("{}", describe_stats(i + 1, stats));
    }
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    info!("pgqstatd {} starting", env!("CARGO_PKG_VERSION"));

    let connection_string = if args.postgres {
        let conn = pg::connection_string_from_env();
        if conn.is_none() {
            warn!("PostgreSQL: neither PGUSER nor USER is set");
            print_pg_warning("neither PGUSER nor USER is set");
        }
        conn
    } else {
        debug!("PostgreSQL connection disabled");
        None
    };

    let mut config = MonitorConfig::default()
        .with_access(args.access.into())
        .with_refresh_interval(Duration::from_secs(args.interval.max(1)))
        .with_log_poll_interval(Duration::from_millis(args.poll_ms.max(10)))
        .with_retention(Duration::from_secs(args.retention_days * 24 * 3600))
        .with_estimate_rows(args.estimate_rows);
    if let Some(ref dir) = args.log_dir {
        config = config.with_log_files(dir.clone(), args.log_pattern.as_str());
    }
    if let Some(conn) = connection_string {
        config = config.with_connection_string(conn);
    }

    let store = Arc::new(MemoryStatsStore::new());
    let mut monitor = Monitor::new(config, store.clone());

    if let Some(ref path) = args.positions_file {
        match FilePositionStore::open(path) {
            Ok(positions) => {
                info!("Log positions persisted at {}", path.display());
                monitor = monitor.with_positions(Arc::new(positions));
            }
            Err(e) => {
                error!("Failed to open positions file: {}", e);
                std::process::exit(1);
            }
        }
    }

    if args.reset_positions
        && let Err(e) = monitor.reset_positions()
    {
        error!("Failed to reset log positions: {}", e);
        std::process::exit(1);
    }

    if let Some(ref query) = args.explain {
        match monitor.explain_plan(query, args.analyze) {
            Ok(result) => {
                println!("{}", result.plan);
                return;
            }
            Err(e) => {
                error!("EXPLAIN failed: {}", e);
                if matches!(e, MonitorError::NoDatabase | MonitorError::Connect(_)) {
                    print_pg_warning(&e.to_string());
                }
                std::process::exit(1);
            }
        }
    }

    if args.enable_logging {
        match monitor.enable_logging() {
            Ok(()) => {
                info!("Statement logging enabled; restart the server if logging_collector was off");
                return;
            }
            Err(e) => {
                error!("Failed to enable statement logging: {}", e);
                std::process::exit(1);
            }
        }
    }

    // Setup graceful shutdown
    let stop = StopSignal::new();
    let s = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        s.trigger();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    if args.backfill {
        let result = monitor.parse_with_progress(&stop, |current, total| {
            info!("Backfill: {}/{} files", current, total);
        });
        match result {
            Ok(count) => info!("Backfill: {} events, {} distinct queries", count, store.len()),
            Err(e) => warn!("Backfill failed: {}", e),
        }
        release_memory_to_os();
        if stop.is_stopped() {
            info!("Shutdown complete");
            return;
        }
    }

    if let Err(e) = monitor.start() {
        error!("Failed to start monitor: {}", e);
        if matches!(e, MonitorError::NoDatabase | MonitorError::Connect(_)) {
            print_pg_warning(&e.to_string());
        }
        std::process::exit(1);
    }
    info!(
        "Collecting from {:?}, reporting every {}s",
        monitor.data_source(),
        args.report_interval
    );

    let report_interval = Duration::from_secs(args.report_interval.max(1));
    while !stop.wait(report_interval) {
        report(&store, &monitor, &args);
    }

    info!("Shutting down...");
    monitor.stop();
    report(&store, &monitor, &args);
    info!("Shutdown complete");
}

/// Prints a colored PostgreSQL warning with configuration hints.
fn print_pg_warning(error: &str) {
    // ANSI colors: red for error, yellow for hints, reset after
    const RED: &str = "\x1b[1;31m";
    const YELLOW: &str = "\x1b[33m";
    const RESET: &str = "\x1b[0m";

    eprintln!("{RED}PostgreSQL: {error}{RESET}");
    eprintln!();
    eprintln!("{YELLOW}  Configure connection with environment variables:");
    eprintln!("    export PGHOST=localhost");
    eprintln!("    export PGPORT=5432");
    eprintln!("    export PGUSER=postgres");
    eprintln!("    export PGPASSWORD=secret");
    eprintln!("    export PGDATABASE=postgres");
    eprintln!();
    eprintln!("  Without a connection only --log-dir with direct file access works.{RESET}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(query: &str) -> QueryStats {
        QueryStats {
            fingerprint: 1,
            query: query.to_string(),
            calls: 4,
            total_time_ms: 10.0,
            min_time_ms: 1.0,
            max_time_ms: 4.0,
            total_rows: 8,
            first_seen: 0,
            last_seen: 0,
            sample_params: None,
        }
    }

    #[test]
    fn test_shorten_query_flattens_and_truncates() {
        assert_eq!(shorten_query("SELECT *\n  FROM t", 50), "SELECT * FROM t");
        assert_eq!(shorten_query("SELECT abcdefgh", 10), "SELECT ...");
    }

    #[test]
    fn test_describe_stats_lists_aggregates() {
        let desc = describe_stats(1, &stats("SELECT * FROM t WHERE id = $1"));
        assert!(desc.starts_with("#1 calls=4"));
        assert!(desc.contains("mean=2.50ms"));
        assert!(desc.contains("rows=8"));
        assert!(desc.ends_with("SELECT * FROM t WHERE id = $1"));
    }

    #[test]
    fn test_args_map_to_core_types() {
        let args = Args::parse_from(["pgqstatd", "--access", "read-through", "--sort", "calls"]);
        assert_eq!(LogAccess::from(args.access), LogAccess::ReadThrough);
        assert_eq!(SortField::from(args.sort), SortField::Calls);
        assert!(args.postgres);
    }

    #[test]
    fn test_explain_flags() {
        let args = Args::parse_from(["pgqstatd", "--explain", "SELECT 1 FROM t", "--analyze"]);
        assert_eq!(args.explain.as_deref(), Some("SELECT 1 FROM t"));
        assert!(args.analyze);
        assert!(args.estimate_rows);

        assert!(Args::try_parse_from(["pgqstatd", "--analyze"]).is_err());
        assert!(Args::try_parse_from(["pgqstatd", "--reset-positions"]).is_err());

        let args = Args::parse_from(["pgqstatd", "--estimate-rows", "false"]);
        assert!(!args.estimate_rows);
    }
}

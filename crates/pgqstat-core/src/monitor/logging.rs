//! Discovery and configuration of server-side statement logging.

use std::path::{Path, PathBuf};

use postgres::Client;
use tracing::info;

use super::MonitorError;
use crate::pg::format_postgres_error;

/// `log_line_prefix` written by `enable_logging`: timestamp, pid, user@db.
pub const QUERY_LOG_LINE_PREFIX: &str = "%t [%p] %u@%d ";

/// strftime escapes PostgreSQL accepts in `log_filename`.
const FILENAME_PLACEHOLDERS: &[&str] = &[
    "%Y", "%m", "%d", "%H", "%M", "%S", "%a", "%b", "%j", "%W", "%y", "%I", "%p", "%e", "%c",
    "%n",
];

/// Server logging configuration relevant to log-based collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingStatus {
    /// `log_min_duration_statement` is not `-1`.
    pub enabled: bool,
    /// Absolute log directory.
    pub log_dir: PathBuf,
    /// Glob matching `log_filename`.
    pub log_pattern: String,
    pub log_line_prefix: String,
}

/// Reads the logging settings.
///
/// `log_min_duration_statement` is taken from the configuration files when
/// readable, so a session-level override does not mask the server value.
pub fn check_logging_status(client: &mut Client) -> Result<LoggingStatus, MonitorError> {
    let row = client
        .query_one(
            "/* pgqstat */ SELECT COALESCE(
                (SELECT setting FROM pg_file_settings
                  WHERE name = 'log_min_duration_statement' AND error IS NULL
                  ORDER BY seqno DESC LIMIT 1),
                (SELECT reset_val FROM pg_settings WHERE name = 'log_min_duration_statement')
            )",
            &[],
        )
        .map_err(|e| query_error("log_min_duration_statement", &e))?;
    let min_duration: Option<String> = row
        .try_get(0)
        .map_err(|e| query_error("log_min_duration_statement", &e))?;

    let data_directory = show_setting(client, "data_directory")?;
    let log_directory = show_setting(client, "log_directory")?;
    let log_filename = show_setting(client, "log_filename")?;
    let log_line_prefix = show_setting(client, "log_line_prefix")?;

    Ok(LoggingStatus {
        enabled: min_duration.as_deref().is_some_and(is_duration_logging_enabled),
        log_dir: resolve_log_dir(Path::new(&data_directory), &log_directory),
        log_pattern: log_filename_to_glob(&log_filename),
        log_line_prefix,
    })
}

/// Turns on duration and parameter logging for every statement and
/// reloads the configuration.
///
/// `logging_collector` only takes effect after a server restart.
pub fn enable_logging(client: &mut Client) -> Result<(), MonitorError> {
    let settings = [
        ("log_min_duration_statement", "0".to_string()),
        ("log_statement", "'all'".to_string()),
        ("log_parameter_max_length", "-1".to_string()),
        ("log_error_verbosity", "'default'".to_string()),
        ("log_executor_stats", "off".to_string()),
        ("log_line_prefix", format!("'{QUERY_LOG_LINE_PREFIX}'")),
        ("logging_collector", "on".to_string()),
    ];

    // ALTER SYSTEM cannot share a transaction block.
    for (name, value) in &settings {
        client
            .batch_execute(&format!("/* pgqstat */ ALTER SYSTEM SET {name} = {value}"))
            .map_err(|e| query_error(name, &e))?;
    }
    client
        .batch_execute("/* pgqstat */ SELECT pg_reload_conf()")
        .map_err(|e| query_error("pg_reload_conf", &e))?;

    info!("statement logging enabled");
    Ok(())
}

/// `-1` disables duration logging; any other value enables it.
pub fn is_duration_logging_enabled(value: &str) -> bool {
    value.trim() != "-1"
}

/// Resolves a relative `log_directory` against the data directory.
pub fn resolve_log_dir(data_directory: &Path, log_directory: &str) -> PathBuf {
    let dir = Path::new(log_directory);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        data_directory.join(dir)
    }
}

/// Converts a `log_filename` strftime pattern into a glob.
pub fn log_filename_to_glob(pattern: &str) -> String {
    let mut result = pattern.to_string();
    for placeholder in FILENAME_PLACEHOLDERS {
        result = result.replace(placeholder, "*");
    }
    while result.contains("**") {
        result = result.replace("**", "*");
    }
    result
}

fn show_setting(client: &mut Client, name: &str) -> Result<String, MonitorError> {
    let query = format!("/* pgqstat */ SHOW {}", name);
    client
        .query_one(&query as &str, &[])
        .and_then(|row| row.try_get::<_, String>(0))
        .map_err(|e| query_error(name, &e))
}

fn query_error(context: &str, e: &postgres::Error) -> MonitorError {
    MonitorError::Query {
        context: context.to_string(),
        message: format_postgres_error(e),
    }
}

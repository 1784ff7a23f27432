//! Errors surfaced by the collectors on their error stream.

use std::io;

/// Remediation text for read-through access failures.
pub const READ_SERVER_FILES_GUIDANCE: &str =
    "Grant pg_read_server_files role to the database user: GRANT pg_read_server_files TO <user>;";

/// Remediation text for local log directory permission failures.
pub const LOCAL_READ_GUIDANCE: &str =
    "Ensure pgqstat has read access to the PostgreSQL log directory";

/// Remediation text when no log file matches the configured pattern.
pub const NO_LOG_FILES_GUIDANCE: &str = "Verify log_directory and log_filename in postgresql.conf";

/// Error reported by a collector.
///
/// None of these stop the collector; they are diagnostics delivered
/// best-effort on the error stream.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("permission denied: {message}")]
    PermissionDenied { message: String, guidance: String },

    #[error("no log files found matching pattern: {pattern}")]
    NoLogFiles { pattern: String, guidance: String },

    #[error("invalid log file pattern {pattern}: {message}")]
    Pattern { pattern: String, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {message}")]
    Query { context: String, message: String },

    #[error("read-through log access requires a database connection")]
    NoDatabase,
}

impl CollectorError {
    /// Returns the remediation hint attached to this error, if any.
    pub fn guidance(&self) -> Option<&str> {
        match self {
            CollectorError::PermissionDenied { guidance, .. }
            | CollectorError::NoLogFiles { guidance, .. } => Some(guidance),
            _ => None,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        CollectorError::Io {
            context: context.into(),
            source,
        }
    }
}

//! PostgreSQL stderr log entry classification.
//!
//! Recognizes the entries that make up one statement execution when
//! `log_min_duration_statement` (and optionally `log_statement`) is enabled:
//!
//! ```text
//! 2025-01-01 12:00:00.000 UTC [1234] LOG:  execute S_1: SELECT * FROM t WHERE id = $1
//! 2025-01-01 12:00:00.000 UTC [1234] DETAIL:  parameters: $1 = '500'
//! 2025-01-01 12:00:00.000 UTC [1234] LOG:  duration: 1.234 ms
//! 2025-01-01 12:00:00.000 UTC [1234] SELECT 42  duration: 1.234 ms  statement: SELECT count(*) FROM t
//! ```
//!
//! Statement and duration lines for one backend are correlated through the
//! `[pid]` in the line prefix, so interleaved output from concurrent
//! connections is attributed correctly.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;

use crate::collector::QueryEvent;

/// Comment prefixed to every statement pgqstat itself sends to the server.
pub const INTERNAL_QUERY_MARKER: &str = "/* pgqstat */";

/// Prefix of the plan queries issued for row estimates, never workload.
const EXPLAIN_PREFIX: &str = "EXPLAIN (FORMAT JSON)";

/// Kind of a single (possibly multi-line) log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind<'a> {
    /// `DETAIL:  parameters: $1 = '...', ...`
    Parameters(BTreeMap<String, String>),
    /// `LOG:  statement: <sql>` without a duration.
    Statement(&'a str),
    /// `LOG:  execute <name>: <sql>` or `LOG:  bind <name>: <sql>`.
    Execute(&'a str),
    /// Entry carrying `duration: <ms> ms`. `query` is set when the statement
    /// text is on the same entry (single-line format).
    Duration {
        duration_ms: f64,
        query: Option<&'a str>,
    },
    /// Anything else: connection messages, errors, checkpoints.
    Other,
}

/// A classified entry plus the backend pid extracted from its prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedLine<'a> {
    pub pid: Option<&'a str>,
    pub kind: LineKind<'a>,
}

/// Per-connection correlation state.
///
/// At most one pending query and one pending parameter set per pid; a new
/// statement for the same pid overwrites the previous one.
#[derive(Debug, Default)]
pub struct PendingState {
    queries: HashMap<String, String>,
    params: HashMap<String, BTreeMap<String, String>>,
}

impl PendingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_query(&self, pid: &str) -> Option<&str> {
        self.queries.get(pid).map(|q| q.as_str())
    }

    pub fn pending_params(&self, pid: &str) -> Option<&BTreeMap<String, String>> {
        self.params.get(pid)
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn params_count(&self) -> usize {
        self.params.len()
    }

    /// Wholesale-clears either map once it grows past `ceiling`.
    ///
    /// Entries that large are from connections that ended mid-statement.
    /// Returns `true` if anything was cleared.
    pub fn clear_if_over(&mut self, ceiling: usize) -> bool {
        let mut cleared = false;
        if self.queries.len() > ceiling {
            self.queries = HashMap::new();
            cleared = true;
        }
        if self.params.len() > ceiling {
            self.params = HashMap::new();
            cleared = true;
        }
        cleared
    }

    fn forget(&mut self, pid: Option<&str>) {
        if let Some(pid) = pid {
            self.queries.remove(pid);
            self.params.remove(pid);
        }
    }
}

/// Compiled classification rules.
pub struct LineClassifier {
    statement_only: Regex,
    execute: Regex,
    duration: Regex,
    inline_statement: Regex,
    command_tag: Regex,
    user_at_db: Regex,
    user_kv: Regex,
    db_kv: Regex,
    timestamp: Regex,
    param: Regex,
    pid: Regex,
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn compile(name: &str, pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid built-in pattern {name}: {e}"))
}

impl LineClassifier {
    pub fn new() -> Self {
        Self {
            statement_only: compile("statement_only", r"(?s)LOG:\s+statement:\s*(.+)$"),
            execute: compile("execute", r"(?s)LOG:\s+(?:execute|bind)\s+\S+:\s*(.+)$"),
            duration: compile("duration", r"duration:\s+([\d.]+)\s+ms"),
            inline_statement: compile(
                "inline_statement",
                r"(?s)(?:statement|execute\s+\S+|bind\s+\S+):\s*(.+)$",
            ),
            command_tag: compile(
                "command_tag",
                r"\]\s+(SELECT|INSERT|UPDATE|DELETE|COPY)\s+(?:\d+\s+)?(\d+)\s+duration:",
            ),
            user_at_db: compile("user_at_db", r"\]\s+(\w+)@(\w+)\s+"),
            user_kv: compile("user_kv", r"user=(\w+)"),
            db_kv: compile("db_kv", r"db=(\w+)"),
            timestamp: compile(
                "timestamp",
                r"^(\d{4}-\d{2}-\d{2})\s+(\d{2}:\d{2}:\d{2})",
            ),
            param: compile("param", r"\$(\d+)\s*=\s*'([^']*)'"),
            pid: compile("pid", r"\[(\d+)\]"),
        }
    }

    /// Classifies one complete log entry. Pure; does not touch pending state.
    pub fn classify<'a>(&self, line: &'a str) -> ClassifiedLine<'a> {
        let pid = self
            .pid
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str());

        let kind = self.classify_kind(line);
        ClassifiedLine { pid, kind }
    }

    fn classify_kind<'a>(&self, line: &'a str) -> LineKind<'a> {
        if line.contains("DETAIL:") && line.to_ascii_lowercase().contains("parameters:") {
            return LineKind::Parameters(self.parse_params(line));
        }

        if let Some(query) = capture(&self.statement_only, line) {
            return LineKind::Statement(query.trim());
        }

        if let Some(query) = capture(&self.execute, line) {
            return LineKind::Execute(query.trim());
        }

        let Some(raw) = capture(&self.duration, line) else {
            return LineKind::Other;
        };
        let Ok(duration_ms) = raw.parse::<f64>() else {
            return LineKind::Other;
        };

        LineKind::Duration {
            duration_ms,
            query: capture(&self.inline_statement, line).map(str::trim),
        }
    }

    /// Applies one entry to `pending`, returning a finished event when the
    /// entry terminates a statement that survives filtering.
    pub fn process(&self, line: &str, pending: &mut PendingState) -> Option<QueryEvent> {
        let ClassifiedLine { pid, kind } = self.classify(line);

        match kind {
            LineKind::Parameters(params) => {
                if let Some(pid) = pid {
                    pending.params.insert(pid.to_string(), params);
                }
                None
            }
            LineKind::Statement(query) | LineKind::Execute(query) => {
                if let Some(pid) = pid
                    && !query.is_empty()
                    && !is_internal_query(query)
                {
                    pending.queries.insert(pid.to_string(), query.to_string());
                }
                None
            }
            LineKind::Duration { duration_ms, query } => {
                self.finish(line, pid, duration_ms, query, pending)
            }
            LineKind::Other => None,
        }
    }

    fn finish(
        &self,
        line: &str,
        pid: Option<&str>,
        duration_ms: f64,
        inline_query: Option<&str>,
        pending: &mut PendingState,
    ) -> Option<QueryEvent> {
        let query = match inline_query {
            Some(q) => q.to_string(),
            None => pid.and_then(|p| pending.queries.remove(p))?,
        };
        if query.is_empty() {
            return None;
        }

        if is_internal_query(&query) || is_comment_only(&query) || is_noise_query(&query) {
            pending.forget(pid);
            return None;
        }

        let rows = self
            .command_tag
            .captures(line)
            .and_then(|c| c.get(2))
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .unwrap_or(0);

        let (user, database) = self.extract_user_db(line);
        let timestamp = self.extract_timestamp(line).unwrap_or_else(Utc::now);
        let params = pid.and_then(|p| pending.params.remove(p));

        Some(QueryEvent {
            query,
            duration_ms,
            rows,
            timestamp,
            database,
            user,
            params,
        })
    }

    /// Extracts `(user, database)` from a `user@db` or `user=X,db=Y` prefix.
    fn extract_user_db(&self, line: &str) -> (String, String) {
        if let Some(caps) = self.user_at_db.captures(line) {
            return (caps[1].to_string(), caps[2].to_string());
        }
        let user = capture(&self.user_kv, line).unwrap_or_default();
        let database = capture(&self.db_kv, line).unwrap_or_default();
        (user.to_string(), database.to_string())
    }

    /// Parses the leading `YYYY-MM-DD HH:MM:SS` as UTC.
    pub fn extract_timestamp(&self, line: &str) -> Option<DateTime<Utc>> {
        let caps = self.timestamp.captures(line)?;
        let text = format!("{} {}", &caps[1], &caps[2]);
        NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Extracts `$n = 'value'` pairs following `parameters:` (any case).
    pub fn parse_params(&self, line: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        let lower = line.to_ascii_lowercase();
        let Some(idx) = lower.find("parameters:") else {
            return params;
        };

        let rest = &line[idx + "parameters:".len()..];
        for caps in self.param.captures_iter(rest) {
            params.insert(format!("${}", &caps[1]), caps[2].to_string());
        }
        params
    }
}

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Returns `true` if `line` starts a new log entry (`YYYY-MM-DD HH:MM:SS.mmm`).
///
/// Anything else is a continuation of the previous entry.
pub fn is_new_log_entry(line: &str) -> bool {
    let b = line.as_bytes();
    b.len() >= 23 && b[4] == b'-' && b[7] == b'-' && b[10] == b' ' && b[13] == b':' && b[16] == b':'
}

/// Returns `true` for statements pgqstat issued itself.
pub fn is_internal_query(query: &str) -> bool {
    let trimmed = query.trim_start();
    trimmed.starts_with(INTERNAL_QUERY_MARKER)
        || trimmed.to_ascii_uppercase().starts_with(EXPLAIN_PREFIX)
}

/// Transaction control, session management and trivial health checks.
///
/// Matching is exact after uppercasing, trimming and stripping one trailing
/// semicolon; prefix checks catch parameterized variants.
pub fn is_noise_query(query: &str) -> bool {
    let upper = query.trim().to_uppercase();
    let q = upper.strip_suffix(';').unwrap_or(&upper).trim();

    if q.is_empty() {
        return true;
    }

    // Transaction control
    if matches!(q, "BEGIN" | "START TRANSACTION" | "COMMIT" | "ROLLBACK" | "END")
        || q.starts_with("BEGIN ")
        || q.starts_with("START TRANSACTION ")
    {
        return true;
    }

    // Savepoints
    const SAVEPOINT_PREFIXES: &[&str] = &[
        "SAVEPOINT ",
        "RELEASE SAVEPOINT ",
        "RELEASE ",
        "ROLLBACK TO SAVEPOINT ",
        "ROLLBACK TO ",
    ];
    if SAVEPOINT_PREFIXES.iter().any(|p| q.starts_with(p)) {
        return true;
    }

    // Session management
    if q.starts_with("SET ")
        || q.starts_with("RESET ")
        || q.starts_with("SHOW ")
        || matches!(
            q,
            "DISCARD ALL" | "DISCARD TEMP" | "DISCARD TEMPORARY" | "DISCARD PLANS" | "DISCARD SEQUENCES"
        )
    {
        return true;
    }

    // Health checks
    matches!(q, "SELECT 1" | "SELECT TRUE" | "SELECT 'PING'") || q.starts_with("SELECT 1 AS ")
}

/// Returns `true` if `query` has no content outside `--` and `/* */` comments.
pub fn is_comment_only(query: &str) -> bool {
    let q = query.trim().as_bytes();
    let mut in_block = false;
    let mut in_line = false;
    let mut i = 0;

    while i < q.len() {
        let c = q[i];
        let next = q.get(i + 1).copied();

        if in_line {
            if c == b'\n' {
                in_line = false;
            }
            i += 1;
            continue;
        }
        if in_block {
            if c == b'*' && next == Some(b'/') {
                in_block = false;
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }

        match (c, next) {
            (b'-', Some(b'-')) => {
                in_line = true;
                i += 2;
            }
            (b'/', Some(b'*')) => {
                in_block = true;
                i += 2;
            }
            (b' ' | b'\t' | b'\n' | b'\r', _) => i += 1,
            _ => return false,
        }
    }

    true
}

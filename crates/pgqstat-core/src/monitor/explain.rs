//! Planner access through `EXPLAIN`.
//!
//! Log lines carry no row count for SELECT, so completed SELECTs that report
//! zero rows get the planner's estimate instead. The same machinery serves
//! on-demand plans for a single query, with plain plans cached per
//! fingerprint.
//!
//! Captured query text is not always runnable: parameters may be missing,
//! several statements may have been joined, or a broken entry may have
//! swallowed log text. Queries are cut to their first statement, leftover
//! `$n` placeholders are replaced, and text that looks like log debris is
//! refused.

use std::collections::{BTreeMap, HashMap};
use std::sync::{LazyLock, Mutex, PoisonError};

use postgres::{Client, SimpleQueryMessage};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collector::log_collector::parser::INTERNAL_QUERY_MARKER;
use crate::pg::format_postgres_error;

pub const DEFAULT_EXPLAIN_CACHE_CAPACITY: usize = 100;

static ANY_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(=\s*ANY\s*\(\s*)\$\d+(\s*\))").unwrap());
static PARAM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\d+").unwrap());
static EXTRACT_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)EXTRACT\s*\(\s*\$\d+").unwrap());
static LIMIT_PARAM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)LIMIT\s+\$\d+").unwrap());
static OFFSET_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)OFFSET\s+\$\d+").unwrap());
static TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}").unwrap());

/// Log prefix pieces that never occur in SQL outside string literals.
const LOG_FRAGMENTS: [&str; 3] = [" UTC [", " LOG:", "] LOG:"];
/// Seams left where two unrelated statements were joined.
const JOIN_FRAGMENTS: [&str; 3] = ["NULLS LAST  ", " FROM PG_STAT_REPLICATION", "::TEXT AS TIME_LAG"];

#[derive(Debug, thiserror::Error)]
pub enum ExplainError {
    #[error("query appears corrupted (contains log line fragments)")]
    Corrupted,

    #[error("empty query")]
    Empty,

    #[error("EXPLAIN failed: {0}")]
    Query(String),

    #[error("unexpected EXPLAIN output: {0}")]
    Output(String),
}

/// Runs EXPLAIN statements.
pub trait Planner: Send + Sync {
    /// Runs one EXPLAIN statement and returns its JSON output.
    fn explain(&self, sql: &str) -> Result<String, ExplainError>;
}

/// Planner over a dedicated server connection.
///
/// Each statement runs in its own transaction with a statement timeout and is
/// rolled back, since `EXPLAIN ANALYZE` executes the query.
pub struct PgPlanner {
    client: Mutex<Client>,
}

impl PgPlanner {
    pub fn new(client: Client) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }
}

fn query_error(e: postgres::Error) -> ExplainError {
    ExplainError::Query(format_postgres_error(&e))
}

impl Planner for PgPlanner {
    fn explain(&self, sql: &str) -> Result<String, ExplainError> {
        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tx = client.transaction().map_err(query_error)?;
        tx.batch_execute("/* pgqstat */ SET LOCAL statement_timeout = '5s'")
            .map_err(query_error)?;
        let messages = tx.simple_query(sql).map_err(query_error)?;
        tx.rollback().map_err(query_error)?;

        messages
            .iter()
            .find_map(|message| match message {
                SimpleQueryMessage::Row(row) => row.try_get(0).ok().flatten().map(str::to_string),
                _ => None,
            })
            .ok_or_else(|| ExplainError::Output("no plan returned".to_string()))
    }
}

/// Walks `query` outside string literals and block comments, calling
/// `visit(index)` for every byte of plain SQL. Stops early when `visit`
/// returns `false`.
fn scan_plain(query: &str, mut visit: impl FnMut(usize) -> bool) {
    let b = query.as_bytes();
    let mut quote: Option<u8> = None;
    let mut in_comment = false;
    let mut i = 0;
    while i < b.len() {
        let c = b[i];
        let next = b.get(i + 1).copied();
        if in_comment {
            if c == b'*' && next == Some(b'/') {
                in_comment = false;
                i += 1;
            }
        } else if let Some(q) = quote {
            if c == q {
                if next == Some(q) {
                    i += 1;
                } else {
                    quote = None;
                }
            }
        } else if c == b'/' && next == Some(b'*') {
            in_comment = true;
            i += 1;
        } else if c == b'\'' || c == b'"' {
            quote = Some(c);
        } else if !visit(i) {
            return;
        }
        i += 1;
    }
}

/// The first statement of `query`: text before the first `;` outside quotes
/// and block comments, trimmed. The whole query when there is none.
pub fn extract_first_statement(query: &str) -> &str {
    let mut end = None;
    scan_plain(query, |i| {
        if query.as_bytes()[i] == b';' && !query[..i].trim().is_empty() {
            end = Some(i);
            return false;
        }
        true
    });
    match end {
        Some(i) => query[..i].trim(),
        None => query.trim(),
    }
}

/// `query` with the contents of every quoted string or identifier removed.
/// The quote characters themselves are kept.
fn remove_string_literals(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                out.push(c);
            }
            Some(q) if c == q => {
                if chars.peek() == Some(&q) {
                    chars.next();
                } else {
                    quote = None;
                    out.push(c);
                }
            }
            Some(_) => {}
        }
    }
    out
}

/// A `--` comment running to the end of the text comments out whatever was
/// joined after it.
fn has_unterminated_line_comment(query: &str) -> bool {
    let b = query.as_bytes();
    let mut found = false;
    let mut skip_until = 0;
    scan_plain(query, |i| {
        if i < skip_until {
            return true;
        }
        if b[i] == b'-' && b.get(i + 1) == Some(&b'-') {
            match query[i..].find('\n') {
                Some(nl) => skip_until = i + nl,
                None => {
                    found = true;
                    return false;
                }
            }
        }
        true
    });
    found
}

/// Returns `true` when `query` holds log debris or the seam of two joined
/// statements and should not be sent to the planner.
pub fn looks_corrupted(query: &str) -> bool {
    let unquoted = remove_string_literals(query);
    let upper = unquoted.to_uppercase();
    LOG_FRAGMENTS
        .iter()
        .chain(JOIN_FRAGMENTS.iter())
        .any(|fragment| upper.contains(fragment))
        || TIMESTAMP.is_match(&unquoted)
        || has_unterminated_line_comment(query)
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn is_select(query: &str) -> bool {
    query
        .trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("SELECT"))
}

/// EXPLAIN statement estimating the rows returned by `query`, or `None` when
/// `query` is not a SELECT or cannot be planned.
///
/// Known parameter values are inlined as quoted literals. Values starting
/// with `/` are file paths captured from broken entries and are ignored.
/// Arrays passed to `= ANY($n)` become empty arrays and any other unknown
/// placeholder becomes NULL.
pub fn row_estimate_sql(query: &str, params: Option<&BTreeMap<String, String>>) -> Option<String> {
    if !is_select(query) || looks_corrupted(query) {
        return None;
    }
    let statement = extract_first_statement(query);
    if statement.is_empty() {
        return None;
    }

    let statement = ANY_PARAM.replace_all(statement, "${1}ARRAY[]::text[]${2}");
    let statement = PARAM.replace_all(&statement, |caps: &Captures| {
        params
            .and_then(|p| p.get(&caps[0]))
            .filter(|value| !value.starts_with('/'))
            .map(|value| quote_literal(value))
            .unwrap_or_else(|| "NULL".to_string())
    });
    Some(format!("{INTERNAL_QUERY_MARKER} EXPLAIN (FORMAT JSON) {statement}"))
}

/// EXPLAIN statement for showing the plan of `query`.
///
/// Placeholders that need a concrete value get a neutral one (`EXTRACT`
/// field, `LIMIT 100`, `OFFSET 0`), the rest become NULL. With `analyze`
/// the statement is executed for timings and buffer counts.
pub fn plan_sql(query: &str, analyze: bool) -> Result<String, ExplainError> {
    if looks_corrupted(query) {
        return Err(ExplainError::Corrupted);
    }
    let statement = extract_first_statement(query);
    if statement.is_empty() {
        return Err(ExplainError::Empty);
    }

    let statement = EXTRACT_PARAM.replace_all(statement, "EXTRACT(epoch");
    let statement = LIMIT_PARAM.replace_all(&statement, "LIMIT 100");
    let statement = OFFSET_PARAM.replace_all(&statement, "OFFSET 0");
    let statement = ANY_PARAM.replace_all(&statement, "${1}ARRAY[]::text[]${2}");
    let statement = PARAM.replace_all(&statement, "NULL");

    let options = if analyze {
        "ANALYZE, COSTS, VERBOSE, BUFFERS, FORMAT JSON"
    } else {
        "FORMAT JSON"
    };
    Ok(format!("{INTERNAL_QUERY_MARKER} EXPLAIN ({options}) {statement}"))
}

#[derive(Deserialize)]
struct PlanEntry {
    #[serde(rename = "Plan")]
    plan: PlanNode,
}

#[derive(Deserialize)]
struct PlanNode {
    #[serde(rename = "Plan Rows")]
    rows: f64,
}

/// Top-level row estimate from `EXPLAIN (FORMAT JSON)` output.
pub fn plan_rows(json: &str) -> Result<i64, ExplainError> {
    let entries: Vec<PlanEntry> =
        serde_json::from_str(json).map_err(|e| ExplainError::Output(e.to_string()))?;
    entries
        .first()
        .map(|entry| entry.plan.rows as i64)
        .ok_or_else(|| ExplainError::Output("empty plan list".to_string()))
}

/// Planner row estimate for `query`, 0 when it cannot be estimated.
pub fn estimate_rows(
    planner: &dyn Planner,
    query: &str,
    params: Option<&BTreeMap<String, String>>,
) -> i64 {
    let Some(sql) = row_estimate_sql(query, params) else {
        return 0;
    };
    match planner.explain(&sql).and_then(|json| plan_rows(&json)) {
        Ok(rows) => rows,
        Err(e) => {
            debug!(error = %e, "row estimate failed");
            0
        }
    }
}

/// One EXPLAIN outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplainResult {
    pub fingerprint: u64,
    pub query: String,
    /// Plan as returned by the server (JSON text).
    pub plan: String,
    pub analyze: bool,
    /// Unix timestamp (seconds).
    pub executed_at: i64,
}

/// Least-recently-used plans keyed by fingerprint.
#[derive(Debug)]
pub struct ExplainCache {
    capacity: usize,
    clock: u64,
    entries: HashMap<u64, (u64, ExplainResult)>,
}

impl ExplainCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clock: 0,
            entries: HashMap::new(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Cached plan for `fingerprint`, marking it most recently used.
    pub fn get(&mut self, fingerprint: u64) -> Option<&ExplainResult> {
        let now = self.tick();
        let (used, result) = self.entries.get_mut(&fingerprint)?;
        *used = now;
        Some(result)
    }

    /// Stores `result`, replacing any plan for the same fingerprint and
    /// evicting the least recently used one when full.
    pub fn put(&mut self, result: ExplainResult) {
        let now = self.tick();
        self.entries.insert(result.fingerprint, (now, result));
        if self.entries.len() <= self.capacity {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, (used, _))| *used)
            .map(|(fingerprint, _)| *fingerprint);
        if let Some(oldest) = oldest {
            self.entries.remove(&oldest);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ExplainCache {
    fn default() -> Self {
        Self::new(DEFAULT_EXPLAIN_CACHE_CAPACITY)
    }
}

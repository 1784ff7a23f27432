//! Query normalization and fingerprinting.
//!
//! Replaces literal values with positional placeholders so that
//! `SELECT * FROM users WHERE id = 1` and `... WHERE id = 2` both become
//! `SELECT * FROM users WHERE id = $1` and share one fingerprint.
//! Identifiers, quoted identifiers, comments and existing `$n` parameters
//! are kept as written.

use std::sync::LazyLock;

use regex::Regex;
use xxhash_rust::xxh3::xxh3_64;

static TRAILING_LIMIT_OFFSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s+(LIMIT\s+(\$\d+|\d+)(\s+OFFSET\s+(\$\d+|\d+))?|OFFSET\s+(\$\d+|\d+)(\s+LIMIT\s+(\$\d+|\d+))?)\s*$",
    )
    .unwrap()
});

/// Normalization failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    #[error("unterminated {kind} starting at byte {position}")]
    Unterminated { kind: &'static str, position: usize },
}

/// Maps raw SQL to `(hash, normalized text)`.
pub trait QueryFingerprinter: Send + Sync {
    fn fingerprint(&self, query: &str) -> Result<(u64, String), FingerprintError>;
}

/// Literal-stripping fingerprinter hashing with xxh3-64.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fingerprinter;

impl Fingerprinter {
    pub fn new() -> Self {
        Self
    }
}

impl QueryFingerprinter for Fingerprinter {
    fn fingerprint(&self, query: &str) -> Result<(u64, String), FingerprintError> {
        let normalized = strip_limit_offset(&normalize_query(query)?);
        Ok((xxh3_64(normalized.as_bytes()), normalized))
    }
}

/// Removes a trailing `LIMIT x [OFFSET y]` or `OFFSET y [LIMIT x]` clause.
///
/// Pagination variants of one query then share a fingerprint. Clauses
/// inside subqueries are not at the end of the text and stay.
pub fn strip_limit_offset(query: &str) -> String {
    TRAILING_LIMIT_OFFSET.replace(query, "").into_owned()
}

/// Replaces string and numeric literals with `$n` placeholders.
///
/// New placeholders are numbered after the highest `$n` already present.
pub fn normalize_query(query: &str) -> Result<String, FingerprintError> {
    // 1. Trim and drop one trailing semicolon
    let q = query.trim();
    let q = q.strip_suffix(';').unwrap_or(q).trim_end();

    let mut next_param = max_placeholder(q) + 1;
    let mut out = String::with_capacity(q.len());
    let chars: Vec<(usize, char)> = q.char_indices().collect();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|&(_, c)| c);

        match c {
            // 2. Line comment: copy through end of line
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i].1 != '\n' {
                    out.push(chars[i].1);
                    i += 1;
                }
            }
            // 3. Block comment: copy through `*/`
            '/' if next == Some('*') => {
                let end = (i + 2..chars.len().saturating_sub(1))
                    .find(|&j| chars[j].1 == '*' && chars[j + 1].1 == '/')
                    .map(|j| j + 2)
                    .unwrap_or(chars.len());
                for &(_, ch) in &chars[i..end] {
                    out.push(ch);
                }
                i = end;
            }
            // 4. Quoted identifier: copy verbatim
            '"' => {
                let end = find_quote_end(&chars, i, '"', false).ok_or(
                    FingerprintError::Unterminated {
                        kind: "quoted identifier",
                        position: pos,
                    },
                )?;
                for &(_, ch) in &chars[i..=end] {
                    out.push(ch);
                }
                i = end + 1;
            }
            // 5. String literal, with E'' backslash escapes
            '\'' => {
                let escaped = ends_with_escape_prefix(&out);
                if escaped {
                    out.pop();
                }
                let end = find_quote_end(&chars, i, '\'', escaped).ok_or(
                    FingerprintError::Unterminated {
                        kind: "string literal",
                        position: pos,
                    },
                )?;
                push_param(&mut out, &mut next_param);
                i = end + 1;
            }
            // 6. `$n` parameter or dollar-quoted string
            '$' => {
                if next.is_some_and(|c| c.is_ascii_digit()) {
                    out.push('$');
                    i += 1;
                    while i < chars.len() && chars[i].1.is_ascii_digit() {
                        out.push(chars[i].1);
                        i += 1;
                    }
                } else if let Some(tag_end) = dollar_tag_end(&chars, i) {
                    let tag: String = chars[i..=tag_end].iter().map(|&(_, c)| c).collect();
                    let body_start = chars[tag_end].0 + 1;
                    let close = q[body_start..].find(&tag).ok_or(FingerprintError::Unterminated {
                        kind: "dollar-quoted string",
                        position: pos,
                    })?;
                    let resume = body_start + close + tag.len();
                    push_param(&mut out, &mut next_param);
                    while i < chars.len() && chars[i].0 < resume {
                        i += 1;
                    }
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            // 7. Numeric literal not part of an identifier
            c if c.is_ascii_digit() && !out.chars().next_back().is_some_and(is_ident_char) => {
                i = skip_number(&chars, i);
                push_param(&mut out, &mut next_param);
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(out)
}

fn push_param(out: &mut String, next_param: &mut u32) {
    out.push('$');
    out.push_str(&next_param.to_string());
    *next_param += 1;
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// `true` if `out` ends with a standalone `E`/`e` escape-string prefix.
fn ends_with_escape_prefix(out: &str) -> bool {
    let mut rev = out.chars().rev();
    match rev.next() {
        Some('E' | 'e') => !rev.next().is_some_and(is_ident_char),
        _ => false,
    }
}

/// Index of the closing `quote` for the quote at `start`. A doubled quote is
/// an escaped quote; with `backslash`, so is `\'`.
fn find_quote_end(chars: &[(usize, char)], start: usize, quote: char, backslash: bool) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i].1;
        if backslash && c == '\\' {
            i += 2;
            continue;
        }
        if c == quote {
            if chars.get(i + 1).is_some_and(|&(_, n)| n == quote) {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

/// For `$tag$` or `$$` at `start`, the index of the tag's closing `$`.
fn dollar_tag_end(chars: &[(usize, char)], start: usize) -> Option<usize> {
    let mut i = start + 1;
    if chars.get(i).is_some_and(|&(_, c)| c.is_ascii_digit()) {
        return None;
    }
    while let Some(&(_, c)) = chars.get(i) {
        if c == '$' {
            return Some(i);
        }
        if !(c.is_alphanumeric() || c == '_') {
            return None;
        }
        i += 1;
    }
    None
}

/// Skips `123`, `1.5`, `1e-3` and returns the index after the literal.
fn skip_number(chars: &[(usize, char)], start: usize) -> usize {
    let mut i = start;
    let digits = |i: &mut usize| {
        while *i < chars.len() && chars[*i].1.is_ascii_digit() {
            *i += 1;
        }
    };

    digits(&mut i);
    if chars.get(i).is_some_and(|&(_, c)| c == '.')
        && chars.get(i + 1).is_some_and(|&(_, c)| c.is_ascii_digit())
    {
        i += 1;
        digits(&mut i);
    }
    if chars.get(i).is_some_and(|&(_, c)| c == 'e' || c == 'E') {
        let mut j = i + 1;
        if chars.get(j).is_some_and(|&(_, c)| c == '+' || c == '-') {
            j += 1;
        }
        if chars.get(j).is_some_and(|&(_, c)| c.is_ascii_digit()) {
            i = j;
            digits(&mut i);
        }
    }
    i
}

/// Highest `$n` placeholder in `q`, 0 if none.
fn max_placeholder(q: &str) -> u32 {
    let bytes = q.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start
                && let Ok(n) = q[start..end].parse::<u32>()
            {
                max = max.max(n);
            }
            i = end.max(i + 1);
        } else {
            i += 1;
        }
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(q: &str) -> String {
        normalize_query(q).unwrap()
    }

    #[test]
    fn test_integer_literal() {
        assert_eq!(
            norm("SELECT * FROM users WHERE id = 1"),
            "SELECT * FROM users WHERE id = $1"
        );
    }

    #[test]
    fn test_string_literal() {
        assert_eq!(
            norm("SELECT * FROM users WHERE name = 'alice'"),
            "SELECT * FROM users WHERE name = $1"
        );
        assert_eq!(
            norm("INSERT INTO users (name) VALUES ('bob')"),
            "INSERT INTO users (name) VALUES ($1)"
        );
    }

    #[test]
    fn test_multiple_literals_numbered_in_order() {
        assert_eq!(
            norm("UPDATE users SET name = 'x' WHERE id = 5"),
            "UPDATE users SET name = $1 WHERE id = $2"
        );
        assert_eq!(
            norm("SELECT * FROM users WHERE id IN (1, 2, 3)"),
            "SELECT * FROM users WHERE id IN ($1, $2, $3)"
        );
        assert_eq!(
            norm("SELECT * FROM users WHERE id = 1 AND name = 'test'"),
            "SELECT * FROM users WHERE id = $1 AND name = $2"
        );
    }

    #[test]
    fn test_existing_params_are_kept() {
        assert_eq!(
            norm("SELECT * FROM t WHERE a = $2 AND b = 7"),
            "SELECT * FROM t WHERE a = $2 AND b = $3"
        );
    }

    #[test]
    fn test_identifiers_and_comments_untouched() {
        assert_eq!(
            norm(r#"SELECT t1.col2 FROM "Table 9" t1 /* 42 */ -- 'x'"#),
            r#"SELECT t1.col2 FROM "Table 9" t1 /* 42 */ -- 'x'"#
        );
    }

    #[test]
    fn test_escaped_quotes_and_e_strings() {
        assert_eq!(norm("SELECT 'it''s'"), "SELECT $1");
        assert_eq!(norm(r"SELECT E'a\'b', 2"), "SELECT $1, $2");
        assert_eq!(norm("SELECT $$body$$ || $fn$x$fn$"), "SELECT $1 || $2");
    }

    #[test]
    fn test_numeric_forms() {
        assert_eq!(norm("SELECT 1.5, 2e10, -3"), "SELECT $1, $2, -$3");
    }

    #[test]
    fn test_trailing_semicolon_removed() {
        assert_eq!(norm("  SELECT a FROM t WHERE b = 1;  "), "SELECT a FROM t WHERE b = $1");
    }

    #[test]
    fn test_unterminated_literal_is_error() {
        let err = normalize_query("SELECT 'oops").unwrap_err();
        assert_eq!(
            err,
            FingerprintError::Unterminated {
                kind: "string literal",
                position: 7
            }
        );
    }

    #[test]
    fn test_limit_offset_variants_share_fingerprint() {
        let f = Fingerprinter::new();
        let (a, _) = f.fingerprint("SELECT * FROM users WHERE id = 1").unwrap();
        let (b, _) = f
            .fingerprint("SELECT * FROM users WHERE id = 2 LIMIT 100 OFFSET 0")
            .unwrap();
        let (c, _) = f
            .fingerprint("SELECT * FROM users WHERE id = 3 offset 5 limit 10")
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);

        let (d, _) = f.fingerprint("SELECT * FROM orders WHERE id = 1").unwrap();
        assert_ne!(a, d);
    }

    #[test]
    fn test_subquery_limit_preserved() {
        let f = Fingerprinter::new();
        let (_, normalized) = f
            .fingerprint("SELECT * FROM (SELECT * FROM t LIMIT 10) sub WHERE x = 1")
            .unwrap();
        assert_eq!(normalized, "SELECT * FROM (SELECT * FROM t LIMIT $1) sub WHERE x = $2");
    }

    #[test]
    fn test_strip_limit_offset_with_params() {
        assert_eq!(
            strip_limit_offset(r#"SELECT count(*) FROM public."Inventory" WHERE "ID" > $1 LIMIT $3 OFFSET $2"#),
            r#"SELECT count(*) FROM public."Inventory" WHERE "ID" > $1"#
        );
        assert_eq!(strip_limit_offset("SELECT a FROM t LIMIT 5"), "SELECT a FROM t");
        assert_eq!(strip_limit_offset("SELECT a FROM t"), "SELECT a FROM t");
    }
}

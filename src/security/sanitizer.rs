//! SQL sanitizer.
//!
//! Pattern-based injection detection plus escaping helpers for building
//! query fragments from untrusted input. This is a defense-in-depth filter,
//! not a parser: it cannot prove a statement is semantically safe.

use crate::error::{SecurityError, SecurityResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::fmt::Write as _;
use tracing::{debug, warn};

/// Postgres truncates identifiers longer than this (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

static IDENTIFIER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex: identifier pattern")
});

static WHITESPACE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("Invalid regex: whitespace pattern"));

/// Comment markers. `#` is included even though Postgres only uses it in
/// operators, since it is the MySQL comment marker and shows up in payloads.
static COMMENT_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("line comment", Regex::new(r"--").expect("Invalid regex: line comment pattern")),
        (
            "block comment",
            Regex::new(r"/\*|\*/").expect("Invalid regex: block comment pattern"),
        ),
        ("hash comment", Regex::new(r"#").expect("Invalid regex: hash comment pattern")),
    ]
});

/// DML/DDL keywords juxtaposed with FROM/INTO in ways legitimate queries don't need.
static JUXTAPOSITION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "UNION SELECT from credential catalog",
            Regex::new(
                r"(?is)\bUNION\b(\s+ALL)?\s+SELECT\b.*\bFROM\s+(pg_catalog\s*\.\s*)?(pg_shadow|pg_authid|pg_user)\b",
            )
            .expect("Invalid regex: UNION credential pattern"),
        ),
        (
            "SELECT INTO file",
            Regex::new(r"(?i)\bINTO\s+(OUTFILE|DUMPFILE)\b")
                .expect("Invalid regex: INTO OUTFILE pattern"),
        ),
        (
            "COPY PROGRAM",
            Regex::new(r"(?is)\bCOPY\b.*\b(FROM|TO)\s+PROGRAM\b")
                .expect("Invalid regex: COPY PROGRAM pattern"),
        ),
    ]
});

/// `OR 1=1` style tautologies. Operand equality is checked after matching
/// because the regex crate has no backreferences.
static NUMERIC_TAUTOLOGY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(OR|AND)\s+(\d+)\s*=\s*(\d+)\b")
        .expect("Invalid regex: numeric tautology pattern")
});

static STRING_TAUTOLOGY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(OR|AND)\s+'([^']*)'\s*=\s*'([^']*)'")
        .expect("Invalid regex: string tautology pattern")
});

static TRUE_TAUTOLOGY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bOR\s+TRUE\b").expect("Invalid regex: OR TRUE pattern"));

/// Statement chaining. `||` is string concatenation and is not a separator.
static CHAINING_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r";|&&|(^|[^|])\|([^|]|$)").expect("Invalid regex: chaining pattern")
});

static DANGEROUS_PROCEDURES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(xp_\w+|sp_\w+|pg_read_file|pg_read_binary_file|pg_ls_dir|lo_import|lo_export|dblink\w*|pg_sleep|pg_terminate_backend)\b",
    )
    .expect("Invalid regex: dangerous procedure pattern")
});

/// Comparison operators accepted by [`SqlSanitizer::build_where_clause`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    ILike,
    IsNull,
    IsNotNull,
    In,
}

impl ComparisonOp {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Like => "LIKE",
            Self::ILike => "ILIKE",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
            Self::In => "IN",
        }
    }
}

/// One `column op value` term of a WHERE clause.
#[derive(Debug, Clone)]
pub struct Condition {
    pub column: String,
    pub op: ComparisonOp,
    pub value: Value,
}

impl Condition {
    pub fn new(column: impl Into<String>, op: ComparisonOp, value: Value) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }
}

/// Sort direction for ORDER BY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    /// Parse a direction, accepting only `ASC`/`DESC` in any case.
    pub fn parse(s: &str) -> SecurityResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(Self::Asc),
            "DESC" => Ok(Self::Desc),
            _ => Err(SecurityError::InvalidSortDirection(s.to_string())),
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// SQL sanitizer.
#[derive(Debug, Clone)]
pub struct SqlSanitizer {
    max_query_length: usize,
    max_limit: u32,
}

impl Default for SqlSanitizer {
    fn default() -> Self {
        Self {
            max_query_length: 100_000,
            max_limit: 10_000,
        }
    }
}

impl SqlSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_query_length(mut self, length: usize) -> Self {
        self.max_query_length = length;
        self
    }

    pub fn max_limit(mut self, limit: u32) -> Self {
        self.max_limit = limit;
        self
    }

    /// Validate a SQL statement before execution.
    ///
    /// Checks, in order: byte length, injection patterns, then quote balance.
    /// Injection runs first so a payload that also leaves a stray quote is
    /// still reported as an injection. Statement separators are only allowed
    /// when `allow_multiple_statements` is set, which is what DDL migrations
    /// need.
    pub fn validate(&self, sql: &str, allow_multiple_statements: bool) -> SecurityResult<()> {
        debug!("Validating query: {}", preview(sql));

        self.check_length(sql)?;
        check_comments(sql)?;
        check_tautologies(sql)?;
        check_juxtaposition(sql)?;
        if !allow_multiple_statements {
            check_chaining(sql)?;
        }
        check_procedures(sql)?;
        check_quoting(sql)?;

        debug!("Query validation passed");
        Ok(())
    }

    fn check_length(&self, sql: &str) -> SecurityResult<()> {
        if sql.len() > self.max_query_length {
            return Err(SecurityError::QueryTooLong {
                length: sql.len(),
                max: self.max_query_length,
            });
        }
        Ok(())
    }

    /// Quote an identifier, accepting only plain unquoted-style names.
    pub fn escape_identifier(name: &str) -> SecurityResult<String> {
        if name.len() > MAX_IDENTIFIER_LENGTH || !IDENTIFIER_REGEX.is_match(name) {
            return Err(SecurityError::InvalidIdentifier(name.to_string()));
        }
        Ok(format!("\"{}\"", name.replace('"', "\"\"")))
    }

    /// Quote a string literal.
    ///
    /// Single quotes are doubled. Backslashes and control characters switch
    /// the literal to the `E'...'` escape-string form; NUL bytes are dropped
    /// since Postgres text cannot hold them.
    pub fn escape_literal(value: &str) -> String {
        let mut body = String::with_capacity(value.len() + 2);
        let mut needs_escape_form = false;

        for c in value.chars() {
            match c {
                '\'' => body.push_str("''"),
                '\\' => {
                    needs_escape_form = true;
                    body.push_str("\\\\");
                }
                '\n' => {
                    needs_escape_form = true;
                    body.push_str("\\n");
                }
                '\r' => {
                    needs_escape_form = true;
                    body.push_str("\\r");
                }
                '\t' => {
                    needs_escape_form = true;
                    body.push_str("\\t");
                }
                '\0' => {}
                c if c.is_control() => {
                    needs_escape_form = true;
                    let _ = write!(body, "\\x{:02X}", c as u32);
                }
                c => body.push(c),
            }
        }

        if needs_escape_form {
            format!("E'{body}'")
        } else {
            format!("'{body}'")
        }
    }

    /// Render a JSON scalar as a SQL literal.
    pub fn escape_value(value: &Value) -> SecurityResult<String> {
        match value {
            Value::Null => Ok("NULL".into()),
            Value::Bool(true) => Ok("TRUE".into()),
            Value::Bool(false) => Ok("FALSE".into()),
            Value::Number(n) => Ok(n.to_string()),
            Value::String(s) => Ok(Self::escape_literal(s)),
            Value::Array(_) | Value::Object(_) => Err(SecurityError::InjectionDetected(
                "composite values cannot be used as literals".into(),
            )),
        }
    }

    /// Build `WHERE a = 'x' AND b IN (1, 2)`; empty input yields an empty string.
    pub fn build_where_clause(conditions: &[Condition]) -> SecurityResult<String> {
        if conditions.is_empty() {
            return Ok(String::new());
        }

        let mut terms = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let column = Self::escape_identifier(&condition.column)?;
            let term = match condition.op {
                ComparisonOp::IsNull | ComparisonOp::IsNotNull => {
                    format!("{column} {}", condition.op.as_sql())
                }
                ComparisonOp::In => {
                    let items = condition.value.as_array().ok_or_else(|| {
                        SecurityError::InjectionDetected("IN expects an array of values".into())
                    })?;
                    if items.is_empty() {
                        // `IN ()` is a syntax error; an empty set matches nothing.
                        "FALSE".to_string()
                    } else {
                        let rendered = items
                            .iter()
                            .map(Self::escape_value)
                            .collect::<SecurityResult<Vec<_>>>()?;
                        format!("{column} IN ({})", rendered.join(", "))
                    }
                }
                op => format!(
                    "{column} {} {}",
                    op.as_sql(),
                    Self::escape_value(&condition.value)?
                ),
            };
            terms.push(term);
        }

        Ok(format!("WHERE {}", terms.join(" AND ")))
    }

    /// Build `ORDER BY`; every column must appear in `allowed_columns`.
    pub fn build_order_by_clause(
        sorts: &[(&str, &str)],
        allowed_columns: &[&str],
    ) -> SecurityResult<String> {
        if sorts.is_empty() {
            return Ok(String::new());
        }

        let mut terms = Vec::with_capacity(sorts.len());
        for (column, direction) in sorts {
            if !allowed_columns.contains(column) {
                warn!("Rejected sort on non-whitelisted column: {}", column);
                return Err(SecurityError::ColumnNotAllowed((*column).to_string()));
            }
            let direction = SortDirection::parse(direction)?;
            terms.push(format!(
                "{} {}",
                Self::escape_identifier(column)?,
                direction.as_sql()
            ));
        }

        Ok(format!("ORDER BY {}", terms.join(", ")))
    }

    pub fn build_limit_clause(&self, limit: u32, offset: Option<u32>) -> SecurityResult<String> {
        if limit == 0 || limit > self.max_limit {
            return Err(SecurityError::InvalidLimit(format!(
                "limit must be between 1 and {}, got {limit}",
                self.max_limit
            )));
        }
        Ok(match offset {
            Some(offset) if offset > 0 => format!("LIMIT {limit} OFFSET {offset}"),
            _ => format!("LIMIT {limit}"),
        })
    }

    /// Trim whitespace and a single trailing semicolon.
    pub fn strip_trailing_semicolon(sql: &str) -> &str {
        let trimmed = sql.trim();
        trimmed.strip_suffix(';').map(str::trim_end).unwrap_or(trimmed)
    }

    /// Collapse whitespace, for logging.
    pub fn normalize(sql: &str) -> String {
        WHITESPACE_REGEX.replace_all(sql.trim(), " ").into_owned()
    }
}

fn preview(sql: &str) -> &str {
    match sql.char_indices().nth(100) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

fn injection(reason: impl Into<String>) -> SecurityError {
    let reason = reason.into();
    warn!("SQL injection pattern detected: {}", reason);
    SecurityError::InjectionDetected(reason)
}

fn check_quoting(sql: &str) -> SecurityResult<()> {
    for quote in ['\'', '"'] {
        if sql.chars().filter(|&c| c == quote).count() % 2 != 0 {
            return Err(SecurityError::UnbalancedQuoting(quote));
        }
    }
    Ok(())
}

fn check_comments(sql: &str) -> SecurityResult<()> {
    for (name, pattern) in COMMENT_PATTERNS.iter() {
        if pattern.is_match(sql) {
            return Err(injection(format!("{name} marker")));
        }
    }
    Ok(())
}

fn check_tautologies(sql: &str) -> SecurityResult<()> {
    for caps in NUMERIC_TAUTOLOGY.captures_iter(sql) {
        if caps[2] == caps[3] {
            return Err(injection(format!("tautology '{}'", &caps[0])));
        }
    }
    for caps in STRING_TAUTOLOGY.captures_iter(sql) {
        if caps[2] == caps[3] {
            return Err(injection(format!("tautology '{}'", &caps[0])));
        }
    }
    if TRUE_TAUTOLOGY.is_match(sql) {
        return Err(injection("tautology 'OR TRUE'"));
    }
    Ok(())
}

fn check_juxtaposition(sql: &str) -> SecurityResult<()> {
    for (name, pattern) in JUXTAPOSITION_PATTERNS.iter() {
        if pattern.is_match(sql) {
            return Err(injection(*name));
        }
    }
    Ok(())
}

fn check_chaining(sql: &str) -> SecurityResult<()> {
    let body = SqlSanitizer::strip_trailing_semicolon(sql);
    if let Some(m) = CHAINING_REGEX.find(body) {
        return Err(injection(format!(
            "statement chaining '{}' with multiple statements disabled",
            m.as_str().trim()
        )));
    }
    Ok(())
}

fn check_procedures(sql: &str) -> SecurityResult<()> {
    if let Some(m) = DANGEROUS_PROCEDURES.find(sql) {
        return Err(injection(format!("dangerous procedure '{}'", m.as_str())));
    }
    Ok(())
}

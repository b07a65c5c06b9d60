//! Structural complexity scoring for SQL statements.
//!
//! Scores are a pure function of the text, so callers can predict rejection.

use crate::error::{SecurityError, SecurityResult};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

/// Keyword weights applied per occurrence.
static KEYWORD_WEIGHTS: Lazy<Vec<(Regex, u32)>> = Lazy::new(|| {
    [
        (r"(?i)\bSELECT\b", 1),
        (r"(?i)\bINSERT\b", 2),
        (r"(?i)\bUPDATE\b", 3),
        (r"(?i)\bDELETE\b", 3),
        (r"(?i)\bJOIN\b", 5),
        (r"(?i)\bUNION\b", 8),
        (r"(?i)\bGROUP\s+BY\b", 4),
        (r"(?i)\b(COUNT|SUM|AVG|MIN|MAX)\s*\(", 3),
    ]
    .into_iter()
    .map(|(pattern, weight)| {
        (
            Regex::new(pattern).expect("Invalid regex: complexity keyword pattern"),
            weight,
        )
    })
    .collect()
});

static STRING_LITERAL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").expect("Invalid regex: string literal pattern"));

/// Weight of a subquery at nesting level 1; deeper levels multiply it.
const SUBQUERY_WEIGHT: u32 = 10;

/// Characters of text per point of length penalty.
const LENGTH_DIVISOR: usize = 100;

/// SQL complexity analyzer.
#[derive(Debug, Clone)]
pub struct ComplexityAnalyzer {
    max_complexity: u32,
}

impl Default for ComplexityAnalyzer {
    fn default() -> Self {
        Self { max_complexity: 50 }
    }
}

impl ComplexityAnalyzer {
    pub fn new(max_complexity: u32) -> Self {
        Self { max_complexity }
    }

    pub fn max_complexity(&self) -> u32 {
        self.max_complexity
    }

    /// Score a statement. Keywords inside string literals do not count.
    pub fn score(sql: &str) -> u32 {
        let stripped = STRING_LITERAL_REGEX.replace_all(sql, "''");

        let keywords: u32 = KEYWORD_WEIGHTS
            .iter()
            .map(|(pattern, weight)| pattern.find_iter(&stripped).count() as u32 * weight)
            .sum();

        let length = u32::try_from(sql.len() / LENGTH_DIVISOR).unwrap_or(u32::MAX);

        keywords
            .saturating_add(subquery_score(&stripped))
            .saturating_add(length)
    }

    /// Fail with `ComplexityExceeded` when the score is above the configured ceiling.
    pub fn enforce(&self, sql: &str) -> SecurityResult<u32> {
        Self::enforce_limit(sql, self.max_complexity)
    }

    pub fn enforce_limit(sql: &str, max: u32) -> SecurityResult<u32> {
        let score = Self::score(sql);
        if score > max {
            warn!("Query complexity {} exceeds limit {}", score, max);
            return Err(SecurityError::ComplexityExceeded { score, max });
        }
        Ok(score)
    }
}

/// Each `(SELECT` scores `SUBQUERY_WEIGHT` times its parenthesis depth.
fn subquery_score(sql: &str) -> u32 {
    let bytes = sql.as_bytes();
    let mut depth: u32 = 0;
    let mut score: u32 = 0;

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => {
                depth += 1;
                let rest = sql[i + 1..].trim_start();
                let is_select = rest
                    .get(..6)
                    .is_some_and(|word| word.eq_ignore_ascii_case("select"))
                    && !rest[6..]
                        .chars()
                        .next()
                        .is_some_and(|c| c.is_alphanumeric() || c == '_');
                if is_select {
                    score = score.saturating_add(SUBQUERY_WEIGHT * depth);
                }
            }
            b')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_select() {
        assert_eq!(ComplexityAnalyzer::score("SELECT * FROM t"), 1);
    }

    #[test]
    fn test_join_and_subquery_score_higher() {
        let simple = ComplexityAnalyzer::score("SELECT * FROM t");
        let complex = ComplexityAnalyzer::score(
            "SELECT * FROM a JOIN b ON a.id=b.id WHERE x IN (SELECT y FROM c)",
        );
        assert!(simple < complex);
        // 2 SELECT + 1 JOIN + 1 subquery at depth 1
        assert_eq!(complex, 2 + 5 + 10);
    }

    #[test]
    fn test_nested_subqueries_weigh_by_depth() {
        let sql = "SELECT * FROM a WHERE x IN (SELECT y FROM b WHERE z IN (SELECT w FROM c))";
        // 3 SELECT + depth 1 (10) + depth 2 (20)
        assert_eq!(ComplexityAnalyzer::score(sql), 3 + 10 + 20);
    }

    #[test]
    fn test_aggregates_and_grouping() {
        let sql = "SELECT status, COUNT(*), MAX(created_at) FROM orders GROUP BY status";
        assert_eq!(ComplexityAnalyzer::score(sql), 1 + 3 + 3 + 4);
    }

    #[test]
    fn test_keywords_in_literals_ignored() {
        let sql = "SELECT * FROM t WHERE note = 'JOIN UNION SELECT'";
        assert_eq!(ComplexityAnalyzer::score(sql), 1);
    }

    #[test]
    fn test_length_penalty() {
        let sql = format!("SELECT '{}'", "x".repeat(300));
        assert_eq!(ComplexityAnalyzer::score(&sql), 1 + 3);
    }

    #[test]
    fn test_deterministic() {
        let sql = "SELECT a FROM b UNION SELECT c FROM d";
        assert_eq!(ComplexityAnalyzer::score(sql), ComplexityAnalyzer::score(sql));
    }

    #[test]
    fn test_enforce_limit() {
        let sql = "SELECT * FROM a UNION SELECT * FROM b UNION SELECT * FROM c";
        assert!(ComplexityAnalyzer::enforce_limit(sql, 50).is_ok());
        assert!(matches!(
            ComplexityAnalyzer::enforce_limit(sql, 10),
            Err(SecurityError::ComplexityExceeded { score: 19, max: 10 })
        ));
        assert!(ComplexityAnalyzer::new(50).enforce("SELECT 1").is_ok());
    }
}

//! Gate between model output and the query executor.
//!
//! Accepts one read-only statement carrying a row limit. Validation is total:
//! every input maps to a [`ValidatedSql`] or a [`SqlRejection`].

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Row cap appended when the statement carries no LIMIT of its own.
pub const DEFAULT_ROW_LIMIT: usize = 1000;

/// Mutating and DDL keywords, matched as whole words.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "GRANT", "REVOKE",
];

/// Statement separator and comment introducers, matched anywhere.
pub const FORBIDDEN_TOKENS: &[&str] = &[";", "--", "/*"];

lazy_static! {
    static ref KEYWORD_PATTERNS: Vec<(&'static str, Regex)> = FORBIDDEN_KEYWORDS
        .iter()
        .map(|kw| (*kw, keyword_regex(kw)))
        .collect();
    static ref SELECT_PREFIX: Regex = Regex::new(r"(?i)^\s*SELECT\b").unwrap();
    static ref LIMIT_CLAUSE: Regex = keyword_regex("LIMIT");
}

fn keyword_regex(keyword: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(keyword))).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlRejection {
    #[error("the model returned no SQL")]
    EmptyOutput,
    #[error("SQL contains forbidden pattern: {0}")]
    ForbiddenPattern(&'static str),
    #[error("only SELECT statements are allowed")]
    NotASelect,
}

impl SqlRejection {
    pub fn kind(&self) -> &'static str {
        match self {
            SqlRejection::EmptyOutput => "empty_model_output",
            SqlRejection::ForbiddenPattern(_) => "forbidden_sql_pattern",
            SqlRejection::NotASelect => "not_a_select_statement",
        }
    }
}

/// A single bounded SELECT statement. Only [`validate_sql`] constructs one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSql(String);

impl ValidatedSql {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ValidatedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ValidatedSql {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for ValidatedSql {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

pub fn validate_sql(candidate: &str) -> Result<ValidatedSql, SqlRejection> {
    if candidate.trim().is_empty() {
        return Err(SqlRejection::EmptyOutput);
    }

    let sql = strip_code_fences(candidate);
    if sql.is_empty() {
        return Err(SqlRejection::EmptyOutput);
    }
    if sql.contains(FENCE) {
        return Err(SqlRejection::NotASelect);
    }

    // Scan the whole candidate, not just the first statement.
    if let Some(token) = FORBIDDEN_TOKENS.iter().find(|t| sql.contains(**t)) {
        return Err(SqlRejection::ForbiddenPattern(*token));
    }
    if let Some((keyword, _)) = KEYWORD_PATTERNS.iter().find(|(_, re)| re.is_match(sql)) {
        return Err(SqlRejection::ForbiddenPattern(*keyword));
    }

    if !SELECT_PREFIX.is_match(sql) {
        return Err(SqlRejection::NotASelect);
    }

    if LIMIT_CLAUSE.is_match(sql) {
        Ok(ValidatedSql(sql.to_string()))
    } else {
        Ok(ValidatedSql(format!("{} LIMIT {}", sql, DEFAULT_ROW_LIMIT)))
    }
}

const FENCE: &str = "```";

/// Strip one optional leading fence (with language tag) and one trailing fence.
///
/// A word after the opening fence is a language tag only when a line break
/// follows it, or when it is `sql`.
fn strip_code_fences(s: &str) -> &str {
    let mut out = s.trim();
    if let Some(rest) = out.strip_prefix(FENCE) {
        let tag_len = rest
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(rest.len());
        let (tag, after) = rest.split_at(tag_len);
        let is_tag = tag.eq_ignore_ascii_case("sql")
            || after.is_empty()
            || after.starts_with(['\n', '\r']);
        out = if is_tag { after } else { rest }.trim_start();
    }
    if let Some(rest) = out.strip_suffix(FENCE) {
        out = rest.trim_end();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn drop_statement_hits_pattern_scan_first() {
        assert_eq!(
            validate_sql("DROP TABLE account"),
            Err(SqlRejection::ForbiddenPattern("DROP"))
        );
    }

    #[test]
    fn second_statement_is_caught_by_separator() {
        assert_eq!(
            validate_sql("SELECT * FROM account; DROP TABLE account"),
            Err(SqlRejection::ForbiddenPattern(";"))
        );
    }

    #[test]
    fn appends_default_limit() {
        let sql = validate_sql("SELECT account_id FROM account").unwrap();
        assert_eq!(sql.as_str(), "SELECT account_id FROM account LIMIT 1000");
    }

    #[test]
    fn keeps_existing_limit() {
        let input = "select a.account_id from account a limit 10";
        assert_eq!(validate_sql(input).unwrap().as_str(), input);
    }

    #[test]
    fn empty_and_blank_output() {
        assert_eq!(validate_sql(""), Err(SqlRejection::EmptyOutput));
        assert_eq!(validate_sql("  \n\t "), Err(SqlRejection::EmptyOutput));
    }

    #[test]
    fn strips_sql_fence() {
        let sql = validate_sql("```sql\nSELECT partner_name FROM partner\n```").unwrap();
        assert_eq!(sql.as_str(), "SELECT partner_name FROM partner LIMIT 1000");

        let sql = validate_sql("```SQL\nSELECT 1 LIMIT 1```").unwrap();
        assert_eq!(sql.as_str(), "SELECT 1 LIMIT 1");

        let sql = validate_sql("```\nSELECT 1 LIMIT 1\n```").unwrap();
        assert_eq!(sql.as_str(), "SELECT 1 LIMIT 1");
    }

    #[test]
    fn bare_fence_is_empty_output() {
        assert_eq!(validate_sql("```sql\n```"), Err(SqlRejection::EmptyOutput));
    }

    #[test]
    fn strips_only_one_fence_layer() {
        let doubled = "```sql\n```sql\nSELECT 1\n```\n```";
        assert_eq!(validate_sql(doubled), Err(SqlRejection::NotASelect));
    }

    #[test]
    fn leftover_closing_fence_is_rejected() {
        let input = "SELECT a FROM t LIMIT 5\n```\n```";
        assert_eq!(validate_sql(input), Err(SqlRejection::NotASelect));
        assert_eq!(validate_sql("SELECT 1 ``` LIMIT 1"), Err(SqlRejection::NotASelect));
    }

    #[test]
    fn inline_fence_keeps_the_statement() {
        let sql = validate_sql("```SELECT account_id FROM account```").unwrap();
        assert_eq!(sql.as_str(), "SELECT account_id FROM account LIMIT 1000");

        let sql = validate_sql("```sql SELECT 1 LIMIT 1```").unwrap();
        assert_eq!(sql.as_str(), "SELECT 1 LIMIT 1");
    }

    #[test]
    fn comments_are_forbidden() {
        assert_eq!(
            validate_sql("SELECT 1 -- sneaky"),
            Err(SqlRejection::ForbiddenPattern("--"))
        );
        assert_eq!(
            validate_sql("SELECT /* hi */ 1"),
            Err(SqlRejection::ForbiddenPattern("/*"))
        );
    }

    #[test]
    fn keywords_are_case_insensitive_and_whole_word() {
        assert_eq!(
            validate_sql("SELECT * FROM t WHERE delete_me = 1 OR grant = 1"),
            Err(SqlRejection::ForbiddenPattern("GRANT"))
        );
        assert_eq!(
            validate_sql("select * from (select 1) t where exists (select 1) and insert into t"),
            Err(SqlRejection::ForbiddenPattern("INSERT"))
        );
        // identifiers that merely contain a keyword are fine
        let sql = validate_sql("SELECT updated_at, created_by FROM audit").unwrap();
        assert_eq!(sql.as_str(), "SELECT updated_at, created_by FROM audit LIMIT 1000");
    }

    #[test]
    fn non_select_is_rejected() {
        assert_eq!(
            validate_sql("WITH x AS (SELECT 1) SELECT * FROM x"),
            Err(SqlRejection::NotASelect)
        );
        assert_eq!(validate_sql("SELECTED FROM x"), Err(SqlRejection::NotASelect));
        assert_eq!(validate_sql("explain select 1"), Err(SqlRejection::NotASelect));
    }

    #[test]
    fn limit_inside_identifier_does_not_count() {
        let sql = validate_sql("SELECT credit_limit FROM account").unwrap();
        assert_eq!(sql.as_str(), "SELECT credit_limit FROM account LIMIT 1000");
    }

    #[test]
    fn rejection_kinds_are_stable() {
        assert_eq!(SqlRejection::EmptyOutput.kind(), "empty_model_output");
        assert_eq!(SqlRejection::ForbiddenPattern(";").kind(), "forbidden_sql_pattern");
        assert_eq!(SqlRejection::NotASelect.kind(), "not_a_select_statement");
    }

    proptest! {
        #[test]
        fn validation_is_total(input in "\\PC*") {
            let _ = validate_sql(&input);
        }

        #[test]
        fn validated_sql_is_a_fixed_point(input in "(?i)(```(sql)?\n?)?select [a-z_ ,*=0-9'`\n]{0,40}(\n?```){0,2}") {
            if let Ok(sql) = validate_sql(&input) {
                prop_assert!(SELECT_PREFIX.is_match(sql.as_str()));
                prop_assert!(LIMIT_CLAUSE.is_match(sql.as_str()));
                prop_assert!(!sql.as_str().contains(';'));
                let again = validate_sql(sql.as_str()).unwrap();
                prop_assert_eq!(again, sql);
            }
        }

        #[test]
        fn non_select_prefix_is_rejected(prefix in "[a-rt-z]{1,8}", rest in "[a-z ]{0,20}") {
            let input = format!("{prefix} {rest}");
            let result = validate_sql(&input);
            prop_assert!(matches!(
                result,
                Err(SqlRejection::NotASelect) | Err(SqlRejection::ForbiddenPattern(_))
            ));
        }
    }
}

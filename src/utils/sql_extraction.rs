//! SQL extraction utilities for parsing LLM responses.
//!
//! Generation stages answer with SQL wrapped in prose, markdown fences or
//! labelled lines. The extraction functions try the following strategies in
//! order and return the first statement found:
//! 1. The last fenced block tagged `sql`
//! 2. The last generic fenced block whose body starts with a SQL keyword
//! 3. A line labelled `SQL:`
//! 4. The first upper-case `SELECT`/`WITH` statement anywhere in the content
//!
//! # Example
//!
//! ```
//! use sqlforge::utils::sql_extraction::extract_sql_from_response;
//!
//! let response = "Here you go:\n```sql\nSELECT count(*) FROM singer;\n```";
//! assert_eq!(extract_sql_from_response(response).as_deref(), Some("SELECT count(*) FROM singer"));
//! ```

use regex::Regex;

/// Keywords a standalone query may start with.
const STATEMENT_KEYWORDS: [&str; 2] = ["SELECT", "WITH"];

/// Extract a single SQL statement from an LLM response.
///
/// Returns `None` if no statement could be identified. The returned
/// statement is trimmed and cut at its first `;` outside a quoted string.
pub fn extract_sql_from_response(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }

    extract_from_sql_code_block(trimmed)
        .or_else(|| extract_from_generic_code_block(trimmed))
        .or_else(|| extract_from_labelled_line(trimmed))
        .or_else(|| extract_bare_statement(trimmed))
        .map(|sql| first_statement(&sql))
        .filter(|sql| !sql.is_empty())
}

/// Extract SQL from the last ```sql ... ``` code block.
pub fn extract_from_sql_code_block(content: &str) -> Option<String> {
    let re = Regex::new(r"(?i)```sql\s*\n?([\s\S]*?)\n?```").ok()?;
    re.captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|sql| !sql.is_empty())
        .last()
}

/// Extract SQL from the last generic ``` ... ``` code block that holds a query.
pub fn extract_from_generic_code_block(content: &str) -> Option<String> {
    let re = Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").ok()?;
    re.captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|block| starts_with_keyword(block))
        .last()
}

/// Extract SQL from a `SQL: ...` line.
pub fn extract_from_labelled_line(content: &str) -> Option<String> {
    let re = Regex::new(r"(?im)^\s*(?:final\s+)?sql\s*:\s*(.+)$").ok()?;
    re.captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|sql| starts_with_keyword(sql))
        .last()
}

/// Extract the first bare statement, ending at an unquoted `;` or a blank line.
pub fn extract_bare_statement(content: &str) -> Option<String> {
    let re = Regex::new(r"(?s)\b(SELECT|WITH)\b([\s\S]*?)(?:\n\s*\n|$)").ok()?;
    let caps = re.captures(content)?;
    let keyword = caps.get(1)?.as_str();
    let body = caps.get(2)?.as_str();
    Some(first_statement(&format!("{}{}", keyword, body)))
}

/// Whether `sql` starts with a query keyword, ignoring case.
pub fn starts_with_keyword(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    STATEMENT_KEYWORDS.iter().any(|kw| {
        upper.starts_with(kw)
            && upper[kw.len()..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_alphanumeric() && c != '_')
    })
}

/// The text before the first `;` that is not inside a quoted string or
/// identifier, trimmed.
///
/// Single quotes, double quotes and backticks are tracked. A doubled quote
/// (`'it''s'`) closes and reopens the literal, which leaves it quoted.
pub fn first_statement(sql: &str) -> String {
    let mut quote: Option<char> = None;
    for (idx, c) in sql.char_indices() {
        match (quote, c) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, ';') => return sql[..idx].trim().to_string(),
            (None, _) => {}
        }
    }
    sql.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_code_block() {
        let input = "Final query:\n```sql\nSELECT name FROM singer WHERE age > 30;\n```\nDone.";
        assert_eq!(
            extract_sql_from_response(input).as_deref(),
            Some("SELECT name FROM singer WHERE age > 30")
        );
    }

    #[test]
    fn test_last_sql_block_wins() {
        let input = "First try:\n```sql\nSELECT nme FROM singer\n```\nFixed:\n```sql\nSELECT name FROM singer\n```";
        assert_eq!(
            extract_sql_from_response(input).as_deref(),
            Some("SELECT name FROM singer")
        );
    }

    #[test]
    fn test_generic_block_requires_keyword() {
        let input = "```\nnot sql\n```\n```\nselect 1\n```";
        assert_eq!(extract_sql_from_response(input).as_deref(), Some("select 1"));
    }

    #[test]
    fn test_labelled_line() {
        let input = "Reasoning: count rows.\nSQL: SELECT count(*) FROM concert;";
        assert_eq!(
            extract_sql_from_response(input).as_deref(),
            Some("SELECT count(*) FROM concert")
        );
    }

    #[test]
    fn test_bare_statement() {
        let input = "The answer is SELECT avg(age) FROM singer\n\nThis averages ages.";
        assert_eq!(
            extract_sql_from_response(input).as_deref(),
            Some("SELECT avg(age) FROM singer")
        );
    }

    #[test]
    fn test_with_clause() {
        let input = "WITH t AS (SELECT 1 AS x) SELECT x FROM t";
        assert_eq!(extract_sql_from_response(input).as_deref(), Some(input));
    }

    #[test]
    fn test_no_sql() {
        assert_eq!(extract_sql_from_response(""), None);
        assert_eq!(extract_sql_from_response("I could not find a matching table."), None);
    }

    #[test]
    fn test_semicolon_inside_string_literal_is_kept() {
        let input = "```sql\nSELECT name FROM singer WHERE song_name = 'Hey; Jude';\n```";
        assert_eq!(
            extract_sql_from_response(input).as_deref(),
            Some("SELECT name FROM singer WHERE song_name = 'Hey; Jude'")
        );

        let bare = "Try SELECT \"a;b\", `c;d` FROM t WHERE x = 'it''s; fine'; SELECT 2";
        assert_eq!(
            extract_sql_from_response(bare).as_deref(),
            Some("SELECT \"a;b\", `c;d` FROM t WHERE x = 'it''s; fine'")
        );
    }

    #[test]
    fn test_first_statement() {
        assert_eq!(first_statement(" SELECT 1; SELECT 2 "), "SELECT 1");
        assert_eq!(first_statement("SELECT ';'"), "SELECT ';'");
        assert_eq!(first_statement("SELECT 'unterminated; x"), "SELECT 'unterminated; x");
    }

    #[test]
    fn test_starts_with_keyword() {
        assert!(starts_with_keyword("  select * from t"));
        assert!(starts_with_keyword("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(!starts_with_keyword("selection criteria"));
        assert!(!starts_with_keyword("DROP TABLE singer"));
    }
}

//! Turns raw provider completions into SQL or a structured query.
//!
//! Accepted shapes, in order: a JSON object with a `sql` field, a JSON
//! object with `measures` (structured semantic query), a fenced ```sql
//! block, or bare SQL continuing a prompt that ended inside a fence.
//! Anything else is `LlmError::Malformed`; nothing is patched up.

use crate::llm::LlmError;
use crate::llm::models::SqlGenerationOutput;
use crate::semantic::SemanticQuery;
use serde_json::Value;
use tracing::debug;

const QUERY_KEYWORDS: &[&str] = &["SELECT", "WITH"];

pub fn parse_completion(content: &str) -> Result<SqlGenerationOutput, LlmError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(LlmError::Malformed("empty response".to_string()));
    }

    if trimmed.starts_with('{') || trimmed.contains("```json") {
        return parse_json(trimmed);
    }

    if let Some((sql, explanation)) = fenced_block(trimmed) {
        debug!("Extracted SQL from fenced block");
        return Ok(SqlGenerationOutput::Sql {
            sql: check_sql(sql)?,
            explanation,
        });
    }

    if starts_with_keyword(trimmed) {
        let sql = match trimmed.find("```") {
            Some(end) => &trimmed[..end],
            None => trimmed,
        };
        debug!("Using bare SQL completion");
        return Ok(SqlGenerationOutput::Sql {
            sql: check_sql(sql)?,
            explanation: None,
        });
    }

    Err(LlmError::Malformed(format!(
        "no SQL found in response: {}",
        preview(trimmed)
    )))
}

fn parse_json(content: &str) -> Result<SqlGenerationOutput, LlmError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if e > s => &content[s..=e],
        _ => {
            return Err(LlmError::Malformed(format!(
                "unterminated JSON in response: {}",
                preview(content)
            )));
        }
    };

    let value: Value = serde_json::from_str(body)
        .map_err(|e| LlmError::Malformed(format!("invalid JSON in response: {}", e)))?;
    let Value::Object(object) = &value else {
        return Err(LlmError::Malformed("JSON response is not an object".to_string()));
    };

    if let Some(sql) = object.get("sql") {
        let sql = sql
            .as_str()
            .ok_or_else(|| LlmError::Malformed("`sql` field is not a string".to_string()))?;
        let explanation = object
            .get("explanation")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(SqlGenerationOutput::Sql {
            sql: check_sql(sql)?,
            explanation,
        });
    }

    if object.contains_key("measures") {
        let query: SemanticQuery = serde_json::from_value(value)
            .map_err(|e| LlmError::Malformed(format!("invalid structured query: {}", e)))?;
        return Ok(SqlGenerationOutput::Semantic(query));
    }

    Err(LlmError::Malformed(
        "JSON response has neither `sql` nor `measures`".to_string(),
    ))
}

/// Body of the first ```sql (or bare ```) block plus any trailing prose.
fn fenced_block(content: &str) -> Option<(&str, Option<String>)> {
    let (open, skip) = match content.find("```sql") {
        Some(i) => (i, 6),
        None => (content.find("```")?, 3),
    };
    let body_start = open + skip;
    let close = content[body_start..].find("```")? + body_start;

    let trailing = content[close + 3..].trim();
    let explanation = (!trailing.is_empty()).then(|| trailing.to_string());
    Some((&content[body_start..close], explanation))
}

fn starts_with_keyword(sql: &str) -> bool {
    let first = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();
    QUERY_KEYWORDS.contains(&first.as_str())
}

fn check_sql(sql: &str) -> Result<String, LlmError> {
    let sql = sql.trim();
    if sql.is_empty() {
        return Err(LlmError::Malformed("empty SQL".to_string()));
    }
    if !starts_with_keyword(sql) {
        return Err(LlmError::Malformed(format!(
            "expected a SELECT or WITH statement, got: {}",
            preview(sql)
        )));
    }
    Ok(sql.to_string())
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    match text.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql_of(output: SqlGenerationOutput) -> (String, Option<String>) {
        match output {
            SqlGenerationOutput::Sql { sql, explanation } => (sql, explanation),
            other => panic!("expected SQL, got {:?}", other),
        }
    }

    #[test]
    fn fenced_sql_with_explanation() {
        let content = "Here you go:\n```sql\nSELECT 1;\n```\nCounts one thing.";
        let (sql, explanation) = sql_of(parse_completion(content).unwrap());
        assert_eq!(sql, "SELECT 1;");
        assert_eq!(explanation.as_deref(), Some("Counts one thing."));
    }

    #[test]
    fn bare_completion_stops_at_fence() {
        let content = "select traffic_source, sum(revenue) from sessions_fct group by 1;\n```";
        let (sql, explanation) = sql_of(parse_completion(content).unwrap());
        assert_eq!(sql, "select traffic_source, sum(revenue) from sessions_fct group by 1;");
        assert!(explanation.is_none());
    }

    #[test]
    fn json_with_sql_field() {
        let content = r#"{"sql": "WITH t AS (SELECT 1) SELECT * FROM t", "explanation": "cte"}"#;
        let (sql, explanation) = sql_of(parse_completion(content).unwrap());
        assert!(sql.starts_with("WITH"));
        assert_eq!(explanation.as_deref(), Some("cte"));
    }

    #[test]
    fn fenced_json_structured_query() {
        let content = "```json\n{\"table\": \"sessions\", \"dimensions\": [\"traffic_source\"], \"measures\": [\"revenue\"], \"explanation\": \"x\"}\n```";
        match parse_completion(content).unwrap() {
            SqlGenerationOutput::Semantic(query) => {
                assert_eq!(query.table, "sessions");
                assert_eq!(query.measures, vec!["revenue"]);
                assert!(query.filters.is_empty());
            }
            other => panic!("expected structured query, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unusable_output() {
        let bad = [
            "",
            "I cannot help with that.",
            "```sql\n```",
            "```sql\nDROP TABLE sessions_fct;\n```",
            r#"{"answer": 42}"#,
            r#"{"sql": 42}"#,
            r#"{"sql": "DELETE FROM t"}"#,
            "{not json",
        ];
        for content in bad {
            assert!(
                matches!(parse_completion(content), Err(LlmError::Malformed(_))),
                "{:?} should be malformed",
                content
            );
        }
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        assert!(preview(&long).ends_with("..."));
        assert_eq!(preview("short"), "short");
    }
}

use super::context::SchemaContext;
use super::sanitize::{FORBIDDEN_KEYWORDS, FORBIDDEN_TOKENS};
use crate::db::ResultTable;
use serde_json::Value;
use tracing::warn;

/// Rows of the result shown to the model when explaining it.
pub const MAX_RESULT_ROWS: usize = 50;
/// Character budget for the rendered sample rows.
pub const SAMPLE_CHAR_BUDGET: usize = 10_000;
pub const TRUNCATION_MARKER: &str = "\n...TRUNCATED...";

const EXAMPLES: &str = r#"- Input: "List active accounts for BR-abc123"
  Expected SQL: SELECT a.account_id, a.account_iban, a.account_currency
                FROM account a
                JOIN br_to_account bta ON a.account_id = bta.account_id
                WHERE bta.br_id = 'BR-ABC123' AND bta.relationship_status_code = 1
                LIMIT 1000

- Input: "Show last 5 transactions for account X"
  Expected SQL: SELECT "Transaction ID", "Debit/Credit", Amount, Currency, Date
                FROM transactions
                WHERE "Account ID" = 'ACCOUNT-X'
                ORDER BY Date DESC
                LIMIT 5

- Input: "Total debited amount per currency"
  Expected SQL: SELECT Currency, SUM(Amount) AS total_debited
                FROM transactions
                WHERE "Debit/Credit" = 'Debit'
                GROUP BY Currency
                LIMIT 1000"#;

pub fn build_generation_prompt(question: &str, schema: &SchemaContext) -> String {
    let ddl = schema.to_ddl_summary();
    let semantic_json = schema.semantics_json();
    let rules = render_rules(schema);
    let instructions = tool_instructions();

    format!(
        "### CONTEXT: Database schema\n{ddl}\n\
         ### CONTEXT: Semantic layer (JSON)\n{semantic_json}\n\n\
         ### BUSINESS RULES\n{rules}\n\n\
         ### USAGE EXAMPLES\n{EXAMPLES}\n\n\
         ### TOOL INSTRUCTIONS (strict)\n{instructions}\n\n\
         ### USER QUESTION\n{question}\n\n\
         ### REQUIRED OUTPUT\n\
         Produce ONLY a single valid SELECT SQL statement (no surrounding text).\n"
    )
}

/// Generation prompt for a second attempt, carrying why the first was refused.
pub fn build_generation_prompt_with_feedback(
    question: &str,
    schema: &SchemaContext,
    rejected_sql: &str,
    reason: &str,
) -> String {
    let mut prompt = build_generation_prompt(question, schema);
    prompt.push_str(&format!(
        "\n### PREVIOUS ATTEMPT REJECTED\n\
         Your previous answer was:\n{rejected_sql}\n\
         It was rejected because: {reason}\n\
         Return a corrected statement that satisfies every tool instruction.\n"
    ));
    prompt
}

pub fn build_explanation_prompt(
    question: &str,
    sql: &str,
    result: &ResultTable,
    schema: &SchemaContext,
) -> String {
    let summary = summarize_result(result);
    let semantic_json = schema.semantics_json();

    format!(
        "You are an assistant that explains SQL query results for financial-crime compliance investigators.\n\n\
         USER QUESTION:\n{question}\n\n\
         SQL EXECUTED:\n{sql}\n\n\
         RESULT SUMMARY:\n{summary}\n\n\
         SEMANTIC LAYER:\n{semantic_json}\n\n\
         TASK: Provide a concise (3-7 sentence) explanation of what the SQL returned, focusing on:\n\
         - The answer to the user's question.\n\
         - Any notable numbers (row count, sums, maxima/minima if relevant).\n\
         Do NOT provide additional SQL or perform further queries. Be factual and cite the column names you used.\n\
         Give an executive summary of the information rather than technical detail on how it was obtained.\n"
    )
}

/// Bounded textual view of a result: row count, typed columns, CSV sample.
pub fn summarize_result(result: &ResultTable) -> String {
    let head = &result.rows[..result.rows.len().min(MAX_RESULT_ROWS)];

    let col_types = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{}({})", col.name, infer_column_type(head, i, &col.data_type)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sample = render_csv(&result.column_names(), head);
    if sample.chars().count() > SAMPLE_CHAR_BUDGET {
        sample = sample.chars().take(SAMPLE_CHAR_BUDGET).collect();
        sample.push_str(TRUNCATION_MARKER);
    }

    format!(
        "ROWS_RETURNED: {}\nCOLUMNS: {}\nSAMPLE_ROWS:\n{}",
        result.row_count, col_types, sample
    )
}

fn infer_column_type(rows: &[Vec<Value>], idx: usize, declared: &str) -> String {
    let mut inferred: Option<&'static str> = None;
    for value in rows.iter().filter_map(|r| r.get(idx)) {
        let kind = match value {
            Value::Null => continue,
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
            Value::Number(_) => "real",
            _ => "text",
        };
        inferred = Some(match (inferred, kind) {
            (None, k) => k,
            (Some(a), b) if a == b => a,
            (Some("integer"), "real") | (Some("real"), "integer") => "real",
            _ => "text",
        });
    }
    match inferred {
        Some(kind) => kind.to_string(),
        None if !declared.is_empty() => declared.to_lowercase(),
        None => "null".to_string(),
    }
}

fn render_csv(headers: &[String], rows: &[Vec<Value>]) -> String {
    if headers.is_empty() {
        return String::new();
    }
    match write_csv(headers, rows) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, rows = rows.len(), "failed to render sample rows");
            format!("(sample rows unavailable: {e})")
        }
    }
}

fn write_csv(headers: &[String], rows: &[Vec<Value>]) -> Result<String, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row.iter().map(cell_text))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_rules(schema: &SchemaContext) -> String {
    let mut lines: Vec<String> = schema
        .semantics
        .business_rules
        .iter()
        .map(|r| format!("- {r}"))
        .collect();
    for (table, sem) in &schema.semantics.tables {
        for (column, meaning) in &sem.columns {
            lines.push(format!("- {table}.{column}: {meaning}"));
        }
    }
    if lines.is_empty() {
        "- (none)".into()
    } else {
        lines.join("\n")
    }
}

fn tool_instructions() -> String {
    let tokens = FORBIDDEN_TOKENS
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "1) You MUST output only one SQL SELECT statement in your response: no explanation, no commentary, no backticks.\n\
         2) The SQL must be read-only and start with SELECT. Never use {keywords}.\n\
         3) No statement separators or comments: the output must not contain {tokens}.\n\
         4) Use the tables and columns exactly as in the schema provided above; quote column names that contain spaces or slashes.\n\
         5) When joining BR <-> Account links, prefer relationship_status_code = 1 to filter active links unless the user asks for historical data.\n\
         6) Return column names in the SELECT that are meaningful and descriptive.\n\
         7) If the user requests aggregates (sums, counts), include GROUP BY appropriately.",
        keywords = FORBIDDEN_KEYWORDS.join(", "),
    )
}

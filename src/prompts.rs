//! Prompts - language-model prompts used by the pipeline
//!
//! The schema summary travels separately as the connector's schema context;
//! these builders only carry the task and the output contract.

use crate::intent::ValidatedIntent;

/// Output contract for intent extraction.
pub const INTENT_EXTRACTION_PROMPT: &str = r#"Extract the structure of the user's question about housing-estate data.

Use ONLY table and column names from the DATABASE SCHEMA. Do not write SQL.

Return a single JSON object with exactly these fields:
{
  "tables": ["table_name", ...],
  "columns": [{"table": "table_name", "column": "column_name"}, ...],
  "filters": [{"table": "table_name", "column": "column_name", "operator": "=", "value": "literal"}, ...],
  "aggregation": null or {"function": "avg|sum|count|min|max", "group_by": [{"table": "...", "column": "..."}]},
  "order_by": null or {"column": "column_name", "direction": "asc|desc"},
  "limit": null or integer
}

Rules:
- "columns" lists what the user wants to see; put aggregated columns here too
- operators: =, !=, >, >=, <, <=, like, is null, is not null
- values are plain JSON strings or numbers, never SQL fragments
- use "limit" only when the user asks for a number of results (e.g. "top 5")"#;

pub fn build_intent_prompt(question: &str) -> String {
    format!("{}\n\nQUESTION: {}\n\nJSON:", INTENT_EXTRACTION_PROMPT, question)
}

/// Re-prompt after output that could not be decoded.
pub fn build_clarifying_prompt(question: &str, problem: &str) -> String {
    format!(
        "{}\n\nQUESTION: {}\n\nYour previous answer could not be used ({}). \
         Respond again with ONLY the JSON object described above, no prose and no code fences.\n\nJSON:",
        INTENT_EXTRACTION_PROMPT, question, problem
    )
}

/// Constrained SQL generation for intents no template covers.
pub fn build_fallback_sql_prompt(question: &str, intent: &ValidatedIntent, limit: u32) -> String {
    let columns: Vec<String> = intent.projections().iter().map(|c| c.to_string()).collect();
    let filters: Vec<String> = intent
        .filters()
        .iter()
        .map(|f| {
            if f.operator.takes_value() {
                format!("{} {} ?", f.target, f.operator.as_sql())
            } else {
                format!("{} {}", f.target, f.operator.as_sql())
            }
        })
        .collect();

    format!(
        r#"Write ONE SQLite SELECT statement answering the question, using only the DATABASE SCHEMA.

QUESTION: {question}
TABLES: {tables}
COLUMNS: {columns}
FILTERS (in this order, one ? placeholder each): {filters}

Rules:
- read-only SELECT only, a single statement
- every filter value MUST be a ? placeholder, in the order listed; no literal values
- join tables with explicit JOIN ... ON conditions
- end with LIMIT {limit}

Return only the SQL."#,
        question = question,
        tables = intent.tables().join(", "),
        columns = if columns.is_empty() { "(any relevant)".to_string() } else { columns.join(", ") },
        filters = if filters.is_empty() { "(none)".to_string() } else { filters.join(" AND ") },
        limit = limit,
    )
}

/// Short narrative over an aggregate result.
pub fn build_narrative_prompt(question: &str, table_text: &str) -> String {
    format!(
        "Summarize the answer to the question in one or two sentences, using only the data shown. \
         Format prices as HK$ with thousands separators. Do not mention SQL, tables or columns.\n\n\
         QUESTION: {}\n\nDATA:\n{}\n\nSUMMARY:",
        question, table_text
    )
}

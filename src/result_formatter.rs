//! Result Formatter
//!
//! Turns an `ExecutionResult` (or a failure from any stage) into the answer
//! the user sees. Success answers are deterministic: an aggregate sentence, a
//! single value, or a short text table. Failure answers come from the error
//! kind alone, so SQL text and schema identifiers never reach the user.

use crate::db::{Row, RowSet};
use crate::error::{ErrorDescriptor, ErrorKind};
use crate::executor::ExecutionResult;
use crate::intent::AggregateFunction;
use crate::llm::LanguageModel;
use crate::pipeline::context::Stage;
use crate::prompts;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const NO_RECORDS_ANSWER: &str = "No matching records were found for your question.";

/// Column-name tokens that mark a currency amount.
const CURRENCY_TOKENS: &[&str] = &["price", "rent"];

/// What the run's intent says about the result rows. Without an intent the
/// formatter falls back to reading aggregate-style column names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultShape {
    #[default]
    Unknown,
    Aggregated,
    Plain,
}

impl ResultShape {
    pub fn from_aggregation(aggregated: bool) -> Self {
        if aggregated {
            ResultShape::Aggregated
        } else {
            ResultShape::Plain
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerKind {
    Aggregation,
    SingleValue,
    Table,
    Empty,
    Failure,
}

/// Machine-readable part of a failed answer, for upstream routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnswerError {
    pub kind: ErrorKind,
    pub stage: Stage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedAnswer {
    pub answer: String,
    pub kind: AnswerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<RowSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AnswerError>,
}

impl FormattedAnswer {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct ResultFormatter {
    max_display_rows: usize,
    narrator: Option<Arc<dyn LanguageModel>>,
    narrative_timeout: Duration,
}

impl ResultFormatter {
    pub fn new(max_display_rows: usize) -> Self {
        Self {
            max_display_rows: max_display_rows.max(1),
            narrator: None,
            narrative_timeout: Duration::from_secs(10),
        }
    }

    /// Ask `model` for a short narrative over multi-row aggregate results.
    /// The deterministic answer is used whenever the model fails.
    pub fn with_narrative(mut self, model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        self.narrator = Some(model);
        self.narrative_timeout = timeout;
        self
    }

    pub async fn format(&self, result: &ExecutionResult, original_query: &str) -> FormattedAnswer {
        self.format_for(result, original_query, ResultShape::Unknown).await
    }

    /// Format with the intent's aggregation deciding whether the rows are
    /// aggregate output. A plain intent never gets an aggregate narrative,
    /// whatever its column names look like.
    pub async fn format_for(
        &self,
        result: &ExecutionResult,
        original_query: &str,
        shape: ResultShape,
    ) -> FormattedAnswer {
        let rows = match (&result.rows, &result.error) {
            (Some(rows), None) if result.success => rows,
            (_, Some(error)) => return self.format_failure(Stage::Executing, error),
            _ => {
                let missing = ErrorDescriptor {
                    kind: ErrorKind::ExecutionRuntime,
                    message: "execution produced neither rows nor an error".to_string(),
                    fragment: None,
                };
                return self.format_failure(Stage::Executing, &missing);
            }
        };

        if rows.is_empty() {
            info!("No rows for query: {}", original_query);
            return FormattedAnswer {
                answer: NO_RECORDS_ANSWER.to_string(),
                kind: AnswerKind::Empty,
                rows: Some(rows.clone()),
                error: None,
            };
        }

        let named_aggregates = rows.columns.iter().any(|c| describe_aggregate(c).is_some());
        let aggregated = match shape {
            ResultShape::Unknown => named_aggregates,
            ResultShape::Aggregated => true,
            ResultShape::Plain => false,
        };

        let (kind, answer) = if rows.len() == 1 && aggregated && named_aggregates {
            (AnswerKind::Aggregation, aggregate_sentence(&rows.columns, &rows.rows[0]))
        } else if rows.len() == 1 && rows.columns.len() == 1 {
            let column = &rows.columns[0];
            let value = format_value(rows.rows[0].get(column).unwrap_or(&Value::Null), column);
            let subject = describe_aggregate(column).unwrap_or_else(|| "result".to_string());
            (AnswerKind::SingleValue, format!("The {} is {}.", subject, value))
        } else {
            let table = self.text_table(rows);
            let answer = if !aggregated {
                table
            } else {
                match self.narrate(original_query, &table).await {
                    Some(narrative) => format!("{}\n\n{}", narrative, table),
                    None => table,
                }
            };
            (AnswerKind::Table, answer)
        };

        debug!("Formatted {:?} answer ({} chars)", kind, answer.len());
        FormattedAnswer {
            answer,
            kind,
            rows: Some(rows.clone()),
            error: None,
        }
    }

    /// User-safe answer for a run that failed at `stage`. Only the error kind
    /// shapes the text; the descriptor's message stays in the run log.
    pub fn format_failure(&self, stage: Stage, error: &ErrorDescriptor) -> FormattedAnswer {
        warn!("Answering with failure from {} stage: {:?}", stage, error.kind);
        FormattedAnswer {
            answer: failure_message(error.kind).to_string(),
            kind: AnswerKind::Failure,
            rows: None,
            error: Some(AnswerError {
                kind: error.kind,
                stage,
            }),
        }
    }

    fn text_table(&self, rows: &RowSet) -> String {
        let shown = rows.rows.iter().take(self.max_display_rows);
        let mut lines = Vec::new();
        let total = if rows.truncated {
            format!("more than {}", rows.len())
        } else {
            rows.len().to_string()
        };
        lines.push(format!("Found {} results:", total));
        let header = rows.columns.join(" | ");
        let rule = "-".repeat(header.len());
        lines.push(header);
        lines.push(rule);
        for row in shown {
            let cells: Vec<String> = rows
                .columns
                .iter()
                .map(|c| format_value(row.get(c).unwrap_or(&Value::Null), c))
                .collect();
            lines.push(cells.join(" | "));
        }
        if rows.len() > self.max_display_rows {
            lines.push(format!("... and {} more rows", rows.len() - self.max_display_rows));
        }
        lines.join("\n")
    }

    async fn narrate(&self, question: &str, table: &str) -> Option<String> {
        let model = self.narrator.as_ref()?;
        let prompt = prompts::build_narrative_prompt(question, table);
        match timeout(self.narrative_timeout, model.complete(&prompt, "")).await {
            Ok(Ok(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!("Narrative summary failed, using table only: {}", e);
                None
            }
            Err(_) => {
                warn!("Narrative summary timed out, using table only");
                None
            }
        }
    }
}

fn failure_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::SchemaLoad => {
            "I'm temporarily unable to access the housing database. Please try again later."
        }
        ErrorKind::IntentParse => {
            "I couldn't understand that question. Could you rephrase it, for example by naming the estate or district?"
        }
        ErrorKind::SchemaMismatch => {
            "I couldn't find information about that in the housing database."
        }
        ErrorKind::TemplateSelection => {
            "I couldn't work out how to answer that question from the available data."
        }
        ErrorKind::QueryValidation => {
            "I couldn't answer that question safely from the available data. Please try asking it differently."
        }
        ErrorKind::ExecutionTimeout => {
            "That question took too long to answer. Please try a narrower question."
        }
        ErrorKind::ExecutionConnection => {
            "I'm temporarily unable to retrieve data. Please try again later."
        }
        ErrorKind::ExecutionRuntime => {
            "Something went wrong while retrieving the data. Please try again later."
        }
    }
}

/// "The average price is HK$15,800." for each aggregate column of a
/// single-row result; other columns are appended as context.
fn aggregate_sentence(columns: &[String], row: &Row) -> String {
    let mut sentences = Vec::new();
    let mut context = Vec::new();
    for column in columns {
        let value = format_value(row.get(column).unwrap_or(&Value::Null), column);
        match describe_aggregate(column) {
            Some(description) => sentences.push(format!("The {} is {}.", description, value)),
            None => context.push(format!("{}: {}", humanize(column), value)),
        }
    }
    let mut answer = sentences.join(" ");
    if !context.is_empty() {
        answer.push_str(&format!(" ({})", context.join(", ")));
    }
    answer
}

/// Human description of an aggregate output column, e.g. `avg_avg_price` →
/// "average price", `record_count` → "number of records".
fn describe_aggregate(column: &str) -> Option<String> {
    let lower = column.to_lowercase();
    let tokens: Vec<&str> = lower.split('_').filter(|t| !t.is_empty()).collect();

    if tokens.last() == Some(&"count") {
        let subject = tokens[..tokens.len() - 1].join(" ");
        return Some(if subject.is_empty() {
            "number of records".to_string()
        } else {
            format!("number of {}s", subject)
        });
    }

    let (first, rest) = tokens.split_first()?;
    let function = AggregateFunction::parse(first)?;
    // `avg_avg_price` reads as "average price", not "average avg price".
    let measure = match rest.split_first() {
        Some((prefix, tail)) if AggregateFunction::parse(prefix) == Some(function) => tail,
        _ => rest,
    };
    Some(match function {
        AggregateFunction::Count if measure.is_empty() => "number of records".to_string(),
        _ if measure.is_empty() => format!("{} value", function.describe()),
        _ => format!("{} {}", function.describe(), measure.join(" ")),
    })
}

fn humanize(column: &str) -> String {
    column.replace('_', " ")
}

fn is_currency_column(column: &str) -> bool {
    let lower = column.to_lowercase();
    lower.split('_').any(|t| CURRENCY_TOKENS.contains(&t))
}

/// Render one cell. NULL is "N/A"; currency columns get `HK$` and thousands
/// separators.
pub fn format_value(value: &Value, column: &str) -> String {
    match value {
        Value::Null => "N/A".to_string(),
        Value::Number(n) => {
            if is_currency_column(column) {
                if let Some(amount) = n.as_f64() {
                    return format!("HK${}", group_thousands(amount.round() as i64));
                }
            }
            if let Some(i) = n.as_i64() {
                group_thousands(i)
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => group_thousands(f as i64),
                    Some(f) => format!("{:.2}", f),
                    None => n.to_string(),
                }
            }
        }
        Value::String(s) => s.clone(),
        Value::Bool(true) => "yes".to_string(),
        Value::Bool(false) => "no".to_string(),
        other => other.to_string(),
    }
}

fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if value < 0 {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

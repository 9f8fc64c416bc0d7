//! Intent Parser
//!
//! Asks the language model for a fixed JSON shape and decodes it into an
//! `Intent`. Output that cannot be decoded earns one clarifying re-prompt;
//! the attempt counter lives in the `PipelineContext`.

use super::{
    AggregateFunction, Aggregation, ColumnRef, Filter, FilterOperator, Intent, SortDirection,
    SortSpec,
};
use crate::db::SqlValue;
use crate::error::{PipelineError, Result};
use crate::llm::{strip_code_fences, LanguageModel, LlmError};
use crate::pipeline::context::PipelineContext;
use crate::prompts;
use crate::schema::SchemaSnapshot;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct IntentParser {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl IntentParser {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    /// Parse `ctx.query()` with `schema` as prompt context.
    ///
    /// Fails with `IntentParse` on connector errors and timeouts (no retry),
    /// or when the attempts allowed by the context all produce undecodable
    /// output.
    pub async fn parse(&self, ctx: &mut PipelineContext, schema: &SchemaSnapshot) -> Result<Intent> {
        let schema_context = schema.summary();
        let mut prompt = prompts::build_intent_prompt(ctx.query());
        let mut last_problem = String::from("no attempt made");

        while let Some(attempt) = ctx.begin_parse_attempt() {
            debug!("Intent parse attempt {}/{}", attempt, ctx.max_parse_attempts());
            let response = timeout(self.timeout, self.model.complete(&prompt, &schema_context)).await;

            let problem = match response {
                Err(_) => {
                    return Err(PipelineError::IntentParse(format!(
                        "language model did not answer within {}s",
                        self.timeout.as_secs()
                    )))
                }
                Ok(Err(LlmError::EmptyResponse)) => "empty response".to_string(),
                Ok(Err(LlmError::MissingContent)) => "response had no content".to_string(),
                Ok(Err(e)) => return Err(PipelineError::IntentParse(e.to_string())),
                Ok(Ok(text)) => match decode_intent(&text) {
                    Ok(intent) => {
                        info!(
                            "Parsed intent: tables={:?}, {} projections, {} filters",
                            intent.tables,
                            intent.projections.len(),
                            intent.filters.len()
                        );
                        ctx.log(format!("intent decoded on attempt {}", attempt));
                        return Ok(intent);
                    }
                    Err(problem) => problem,
                },
            };

            warn!("Intent output unusable on attempt {}: {}", attempt, problem);
            ctx.log(format!("attempt {} unusable: {}", attempt, problem));
            prompt = prompts::build_clarifying_prompt(ctx.query(), &problem);
            last_problem = problem;
        }

        Err(PipelineError::IntentParse(format!(
            "model output could not be decoded after {} attempts: {}",
            ctx.parse_attempts(),
            last_problem
        )))
    }
}

/// Either a list or a single value. `Many` is tried first so a two-element
/// list is never read positionally as one struct.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

/// JSON `null`, a missing field, one value or a list, as a list.
fn items<T>(value: Option<OneOrMany<T>>) -> Vec<T> {
    value.map(OneOrMany::into_vec).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawColumn {
    Name(String),
    Qualified {
        #[serde(default)]
        table: Option<String>,
        column: String,
    },
}

impl RawColumn {
    fn into_ref(self) -> ColumnRef {
        match self {
            RawColumn::Name(text) => ColumnRef::parse(&text),
            RawColumn::Qualified { table: Some(table), column } => ColumnRef::qualified(table, column),
            RawColumn::Qualified { table: None, column } => ColumnRef::parse(&column),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFilter {
    Legacy(String),
    Structured {
        #[serde(default)]
        table: Option<String>,
        column: RawColumn,
        #[serde(default, alias = "op")]
        operator: Option<String>,
        #[serde(default)]
        value: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAggregation {
    Function(String),
    Spec {
        function: String,
        #[serde(default)]
        column: Option<RawColumn>,
        #[serde(default)]
        group_by: Option<OneOrMany<RawColumn>>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSort {
    /// `"price"` or `"price DESC"`
    Text(String),
    Spec {
        column: RawColumn,
        #[serde(default, alias = "order")]
        direction: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawIntent {
    #[serde(default)]
    tables: Option<OneOrMany<String>>,
    #[serde(default, alias = "projections", alias = "select")]
    columns: Option<OneOrMany<RawColumn>>,
    #[serde(default)]
    filters: Option<OneOrMany<RawFilter>>,
    #[serde(default)]
    aggregation: Option<RawAggregation>,
    #[serde(default)]
    group_by: Option<OneOrMany<RawColumn>>,
    #[serde(default, alias = "sort")]
    order_by: Option<OneOrMany<RawSort>>,
    #[serde(default)]
    limit: Option<serde_json::Value>,
}

/// Decode model output into an `Intent`. The error text describes the
/// problem for the clarifying re-prompt.
pub(crate) fn decode_intent(response: &str) -> std::result::Result<Intent, String> {
    let body = extract_json_object(response).ok_or_else(|| "no JSON object found".to_string())?;
    let raw: RawIntent =
        serde_json::from_str(body).map_err(|e| format!("JSON did not match the expected shape: {}", e))?;

    let mut projections: Vec<ColumnRef> = items(raw.columns).into_iter().map(RawColumn::into_ref).collect();

    let filters = items(raw.filters)
        .into_iter()
        .map(decode_filter)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut group_by: Vec<ColumnRef> = items(raw.group_by).into_iter().map(RawColumn::into_ref).collect();
    let aggregation = match raw.aggregation {
        None => None,
        Some(RawAggregation::Function(name)) if name.trim().is_empty() || name.eq_ignore_ascii_case("none") => None,
        Some(RawAggregation::Function(name)) => Some(parse_function(&name)?),
        Some(RawAggregation::Spec { function, column, group_by: nested }) => {
            if let Some(column) = column.map(RawColumn::into_ref) {
                if !column.is_wildcard() && !projections.contains(&column) {
                    projections.push(column);
                }
            }
            group_by.extend(items(nested).into_iter().map(RawColumn::into_ref));
            Some(parse_function(&function)?)
        }
    };
    let aggregation = match aggregation {
        Some(function) => {
            group_by.dedup();
            Some(Aggregation { function, group_by })
        }
        None if !group_by.is_empty() => {
            return Err("group_by given without an aggregation function".to_string())
        }
        None => None,
    };

    let sort = match items(raw.order_by).into_iter().next() {
        None => None,
        Some(raw_sort) => Some(decode_sort(raw_sort)?),
    };

    let limit = match raw.limit {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(n)) => match n.as_u64() {
            Some(0) | None => return Err(format!("limit must be a positive integer, got {}", n)),
            Some(v) => Some(u32::try_from(v).unwrap_or(u32::MAX)),
        },
        Some(serde_json::Value::String(s)) => Some(
            s.trim()
                .parse::<u32>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| format!("limit must be a positive integer, got '{}'", s))?,
        ),
        Some(other) => return Err(format!("limit must be a positive integer, got {}", other)),
    };

    let mut tables: Vec<String> = Vec::new();
    for table in items(raw.tables) {
        let table = table.trim().to_string();
        if !table.is_empty() && !tables.contains(&table) {
            tables.push(table);
        }
    }
    let qualified = projections
        .iter()
        .chain(filters.iter().map(|f| &f.target))
        .chain(group_by_refs(&aggregation))
        .filter_map(|c| c.table.clone());
    for table in qualified {
        if !tables.contains(&table) {
            tables.push(table);
        }
    }

    if tables.is_empty() {
        return Err("no tables identified".to_string());
    }
    if projections.is_empty() && aggregation.is_none() {
        return Err("no columns or aggregation identified".to_string());
    }

    Ok(Intent {
        tables,
        projections,
        filters,
        aggregation,
        sort,
        limit,
    })
}

fn group_by_refs(aggregation: &Option<Aggregation>) -> impl Iterator<Item = &ColumnRef> {
    aggregation.iter().flat_map(|a| a.group_by.iter())
}

fn parse_function(name: &str) -> std::result::Result<AggregateFunction, String> {
    AggregateFunction::parse(name).ok_or_else(|| format!("unsupported aggregation '{}'", name))
}

fn decode_sort(raw: RawSort) -> std::result::Result<SortSpec, String> {
    let (column, direction) = match raw {
        RawSort::Text(text) => {
            let mut parts = text.split_whitespace();
            let column = parts.next().ok_or_else(|| "empty order_by".to_string())?;
            (ColumnRef::parse(column), parts.next().map(str::to_string))
        }
        RawSort::Spec { column, direction } => (column.into_ref(), direction),
    };
    let direction = match direction.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("asc") | Some("ascending") => SortDirection::Asc,
        Some("desc") | Some("descending") => SortDirection::Desc,
        Some(other) => return Err(format!("unknown sort direction '{}'", other)),
    };
    Ok(SortSpec {
        target: column,
        direction,
    })
}

fn decode_filter(raw: RawFilter) -> std::result::Result<Filter, String> {
    match raw {
        RawFilter::Legacy(text) => parse_filter_string(&text),
        RawFilter::Structured {
            table,
            column,
            operator,
            value,
        } => {
            let mut target = column.into_ref();
            if target.table.is_none() {
                target.table = table;
            }
            let operator = match operator.as_deref() {
                None => FilterOperator::Eq,
                Some(op) => FilterOperator::parse(op).ok_or_else(|| format!("unknown operator '{}'", op))?,
            };
            let value = if operator.takes_value() {
                let value = SqlValue::from_json(&value)
                    .ok_or_else(|| format!("filter on {} has a non-scalar value", target))?;
                if value.is_null() {
                    return Err(format!("filter on {} has no value", target));
                }
                value
            } else {
                SqlValue::Null
            };
            Ok(Filter {
                target,
                operator,
                value,
            })
        }
    }
}

fn filter_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*([A-Za-z_][\w]*(?:\.[A-Za-z_][\w]*)?)\s*(is\s+not\s+null|is\s+null|like|<>|!=|>=|<=|==|=|>|<)\s*(.*?)\s*;?\s*$",
        )
        .expect("filter pattern is a valid regex")
    })
}

/// Parse a legacy filter string such as `estate_name_en = 'Lohas Park'`.
pub(crate) fn parse_filter_string(text: &str) -> std::result::Result<Filter, String> {
    let caps = filter_pattern()
        .captures(text)
        .ok_or_else(|| format!("cannot read filter '{}'", text))?;
    let target = ColumnRef::parse(&caps[1]);
    let operator =
        FilterOperator::parse(&caps[2]).ok_or_else(|| format!("unknown operator in '{}'", text))?;
    let literal = caps[3].trim();

    let value = if operator.takes_value() {
        parse_literal(literal).ok_or_else(|| format!("cannot read value in filter '{}'", text))?
    } else if literal.is_empty() {
        SqlValue::Null
    } else {
        return Err(format!("unexpected value after {} in '{}'", operator.as_sql(), text));
    };

    Ok(Filter {
        target,
        operator,
        value,
    })
}

fn parse_literal(literal: &str) -> Option<SqlValue> {
    if literal.len() >= 2 {
        for quote in ['\'', '"'] {
            if literal.starts_with(quote) && literal.ends_with(quote) {
                let inner = &literal[1..literal.len() - 1];
                let unescaped = if quote == '\'' { inner.replace("''", "'") } else { inner.to_string() };
                return Some(SqlValue::Text(unescaped));
            }
        }
    }
    if let Ok(i) = literal.parse::<i64>() {
        return Some(SqlValue::Integer(i));
    }
    if let Ok(f) = literal.parse::<f64>() {
        return Some(SqlValue::Real(f));
    }
    match literal.to_lowercase().as_str() {
        "true" => Some(SqlValue::Bool(true)),
        "false" => Some(SqlValue::Bool(false)),
        _ => None,
    }
}

/// Slice from the first `{` to the last `}`, after removing code fences.
fn extract_json_object(response: &str) -> Option<&str> {
    let cleaned = strip_code_fences(response);
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    (end > start).then(|| &cleaned[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::schema::tests::housing_snapshot;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Never answers within any reasonable timeout.
    #[derive(Default)]
    struct StalledModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for StalledModel {
        async fn complete(&self, _prompt: &str, _schema_context: &str) -> std::result::Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(SCENARIO_A.to_string())
        }
    }

    const SCENARIO_A: &str = r#"{"tables": ["estates"], "columns": [{"table": "estates", "column": "avg_price"}],
        "filters": [{"table": "estates", "column": "name", "operator": "=", "value": "Taikoo Shing"}],
        "aggregation": null, "order_by": null, "limit": null}"#;

    fn parser(model: Arc<ScriptedModel>) -> IntentParser {
        IntentParser::new(model, Duration::from_secs(5))
    }

    #[test]
    fn test_decode_structured_intent() {
        let intent = decode_intent(SCENARIO_A).unwrap();
        assert_eq!(intent.tables, vec!["estates"]);
        assert_eq!(intent.projections, vec![ColumnRef::qualified("estates", "avg_price")]);
        assert_eq!(intent.filters[0].target, ColumnRef::qualified("estates", "name"));
        assert_eq!(intent.filters[0].value, SqlValue::Text("Taikoo Shing".to_string()));
        assert_eq!(intent.limit, None);
    }

    #[test]
    fn test_decode_lenient_shapes() {
        let response = r#"Here is the intent:
```json
{"tables": "estates", "columns": ["estates.district"],
 "filters": ["avg_price >= 10000", "district = 'Sai Kung'"],
 "aggregation": {"function": "average", "column": "avg_price"},
 "group_by": ["district"], "order_by": "avg_price desc", "limit": "5"}
```"#;
        let intent = decode_intent(response).unwrap();
        assert_eq!(intent.tables, vec!["estates"]);
        assert_eq!(
            intent.projections,
            vec![ColumnRef::qualified("estates", "district"), ColumnRef::bare("avg_price")]
        );
        assert_eq!(intent.filters[0].operator, FilterOperator::Ge);
        assert_eq!(intent.filters[0].value, SqlValue::Integer(10000));
        assert_eq!(intent.filters[1].value, SqlValue::Text("Sai Kung".to_string()));
        let aggregation = intent.aggregation.unwrap();
        assert_eq!(aggregation.function, AggregateFunction::Avg);
        assert_eq!(aggregation.group_by, vec![ColumnRef::bare("district")]);
        let sort = intent.sort.unwrap();
        assert_eq!(sort.direction, SortDirection::Desc);
        assert_eq!(intent.limit, Some(5));
    }

    #[test]
    fn test_legacy_filter_strings() {
        let filter = parse_filter_string("estate_name_en = 'Lohas Park'").unwrap();
        assert_eq!(filter.target, ColumnRef::bare("estate_name_en"));
        assert_eq!(filter.value, SqlValue::Text("Lohas Park".to_string()));

        let filter = parse_filter_string("buildings.floor is not null").unwrap();
        assert_eq!(filter.operator, FilterOperator::IsNotNull);
        assert_eq!(filter.value, SqlValue::Null);

        assert!(parse_filter_string("name = Taikoo Shing").is_err());
        assert!(parse_filter_string("1; DROP TABLE estates").is_err());
    }

    #[test]
    fn test_decode_rejects_unusable_output() {
        assert!(decode_intent("I cannot help with that").is_err());
        assert!(decode_intent(r#"{"tables": []}"#).is_err());
        assert!(decode_intent(r#"{"tables": ["estates"], "columns": []}"#).is_err());
        assert!(decode_intent(r#"{"tables": ["estates"], "columns": ["name"], "aggregation": "median"}"#).is_err());
        assert!(decode_intent(r#"{"tables": ["estates"], "columns": ["name"], "limit": -3}"#).is_err());
    }

    #[tokio::test]
    async fn test_parse_succeeds_first_time() {
        let model = Arc::new(ScriptedModel::new([SCENARIO_A]));
        let mut ctx = PipelineContext::new("What is the average price in Taikoo Shing?");
        let intent = parser(model.clone()).parse(&mut ctx, &housing_snapshot()).await.unwrap();
        assert_eq!(intent.tables, vec!["estates"]);
        assert_eq!(ctx.parse_attempts(), 1);
        assert_eq!(model.call_count(), 1);
        assert!(model.prompts()[0].contains("Taikoo Shing"));
    }

    #[tokio::test]
    async fn test_parse_reprompts_once_after_malformed_output() {
        let model = Arc::new(ScriptedModel::new(["not json at all", SCENARIO_A]));
        let mut ctx = PipelineContext::new("What is the average price in Taikoo Shing?");
        let intent = parser(model.clone()).parse(&mut ctx, &housing_snapshot()).await;
        assert!(intent.is_ok());
        assert_eq!(ctx.parse_attempts(), 2);
        assert!(model.prompts()[1].contains("could not be used"));
    }

    #[tokio::test]
    async fn test_parse_gives_up_after_bounded_retry() {
        let model = Arc::new(ScriptedModel::new(["garbage", "", SCENARIO_A]));
        let mut ctx = PipelineContext::new("q");
        let err = parser(model.clone()).parse(&mut ctx, &housing_snapshot()).await.unwrap_err();
        assert!(matches!(err, PipelineError::IntentParse(_)));
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn test_connector_failure_is_not_retried() {
        let model = Arc::new(ScriptedModel::default());
        model.push_error(LlmError::Status {
            status: 503,
            body: "unavailable".to_string(),
        });
        model.push_response(SCENARIO_A);
        let mut ctx = PipelineContext::new("q");
        let err = parser(model.clone()).parse(&mut ctx, &housing_snapshot()).await.unwrap_err();
        assert!(matches!(err, PipelineError::IntentParse(_)));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_model_timeout_fails_without_retry() {
        let model = Arc::new(StalledModel::default());
        let parser = IntentParser::new(model.clone(), Duration::from_millis(50));
        let mut ctx = PipelineContext::new("What is the average price in Taikoo Shing?");
        let err = parser.parse(&mut ctx, &housing_snapshot()).await.unwrap_err();
        assert!(matches!(err, PipelineError::IntentParse(_)));
        assert!(err.to_string().contains("did not answer"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.parse_attempts(), 1);
    }
}

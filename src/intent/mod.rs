//! Intent - structured form of a natural-language question
//!
//! `Intent` holds names exactly as the language model produced them; nothing
//! in it is known to exist. `ValidatedIntent` can only be built by the schema
//! validator and carries fully resolved `table.column` references plus the
//! record of every substitution made on the way.

pub mod parser;

use crate::db::SqlValue;
use crate::fuzzy_matcher::MatchRationale;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A column reference as written by the model, optionally table-qualified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn bare(column: impl Into<String>) -> Self {
        Self {
            table: None,
            column: column.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            column: column.into(),
        }
    }

    /// Parse `"column"` or `"table.column"`.
    pub fn parse(text: &str) -> Self {
        match text.trim().split_once('.') {
            Some((table, column)) if !table.is_empty() && !column.is_empty() => {
                Self::qualified(table.trim(), column.trim())
            }
            _ => Self::bare(text.trim()),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.column == "*"
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}.{}", table, self.column),
            None => f.write_str(&self.column),
        }
    }
}

/// A column confirmed to exist in the current schema snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolvedColumn {
    pub table: String,
    pub column: String,
}

impl ResolvedColumn {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ResolvedColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    IsNull,
    IsNotNull,
}

impl FilterOperator {
    /// Accepts SQL symbols and the spelled-out names models tend to use.
    pub fn parse(text: &str) -> Option<Self> {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        let op = match normalized.as_str() {
            "=" | "==" | "eq" | "equals" => FilterOperator::Eq,
            "!=" | "<>" | "ne" | "not equals" => FilterOperator::NotEq,
            ">" | "gt" => FilterOperator::Gt,
            ">=" | "gte" | "ge" => FilterOperator::Ge,
            "<" | "lt" => FilterOperator::Lt,
            "<=" | "lte" | "le" => FilterOperator::Le,
            "like" | "contains" => FilterOperator::Like,
            "is null" => FilterOperator::IsNull,
            "is not null" => FilterOperator::IsNotNull,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::NotEq => "<>",
            FilterOperator::Gt => ">",
            FilterOperator::Ge => ">=",
            FilterOperator::Lt => "<",
            FilterOperator::Le => "<=",
            FilterOperator::Like => "LIKE",
            FilterOperator::IsNull => "IS NULL",
            FilterOperator::IsNotNull => "IS NOT NULL",
        }
    }

    /// Whether the predicate binds a value.
    pub fn takes_value(&self) -> bool {
        !matches!(self, FilterOperator::IsNull | FilterOperator::IsNotNull)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter<C = ColumnRef> {
    pub target: C,
    pub operator: FilterOperator,
    /// Always bound as a parameter; `Null` for IS [NOT] NULL
    pub value: SqlValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Avg,
    Sum,
    Count,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "avg" | "average" | "mean" => Some(AggregateFunction::Avg),
            "sum" | "total" => Some(AggregateFunction::Sum),
            "count" => Some(AggregateFunction::Count),
            "min" | "minimum" => Some(AggregateFunction::Min),
            "max" | "maximum" => Some(AggregateFunction::Max),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }

    /// Lowercase prefix used for result aliases (`avg_price`).
    pub fn alias_prefix(&self) -> &'static str {
        match self {
            AggregateFunction::Avg => "avg",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Count => "count",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }

    /// Wording used in formatted answers.
    pub fn describe(&self) -> &'static str {
        match self {
            AggregateFunction::Avg => "average",
            AggregateFunction::Sum => "total",
            AggregateFunction::Count => "number of",
            AggregateFunction::Min => "minimum",
            AggregateFunction::Max => "maximum",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "C: Deserialize<'de>"))]
pub struct Aggregation<C = ColumnRef> {
    pub function: AggregateFunction,
    #[serde(default)]
    pub group_by: Vec<C>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec<C = ColumnRef> {
    pub target: C,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Parsed question. Names are unchecked strings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Intent {
    /// Candidate tables, in the order the model listed them
    pub tables: Vec<String>,
    pub projections: Vec<ColumnRef>,
    pub filters: Vec<Filter>,
    pub aggregation: Option<Aggregation>,
    pub sort: Option<SortSpec>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Table,
    Column,
}

/// One name the validator replaced with a schema name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Substitution {
    pub kind: ReferenceKind,
    pub original: String,
    pub resolved: String,
    pub confidence: f64,
    pub rationale: MatchRationale,
}

impl fmt::Display for Substitution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} '{}' -> '{}' ({}, confidence {:.2})",
            self.kind, self.original, self.resolved, self.rationale, self.confidence
        )
    }
}

/// Intent whose every reference exists in the schema it was validated against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedIntent {
    pub(crate) tables: Vec<String>,
    pub(crate) projections: Vec<ResolvedColumn>,
    pub(crate) filters: Vec<Filter<ResolvedColumn>>,
    pub(crate) aggregation: Option<Aggregation<ResolvedColumn>>,
    pub(crate) sort: Option<SortSpec<ResolvedColumn>>,
    pub(crate) limit: Option<u32>,
    pub(crate) substitutions: Vec<Substitution>,
}

impl ValidatedIntent {
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn projections(&self) -> &[ResolvedColumn] {
        &self.projections
    }

    pub fn filters(&self) -> &[Filter<ResolvedColumn>] {
        &self.filters
    }

    pub fn aggregation(&self) -> Option<&Aggregation<ResolvedColumn>> {
        self.aggregation.as_ref()
    }

    pub fn sort(&self) -> Option<&SortSpec<ResolvedColumn>> {
        self.sort.as_ref()
    }

    /// Row limit the user asked for, if any.
    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn substitutions(&self) -> &[Substitution] {
        &self.substitutions
    }

    pub fn is_single_table(&self) -> bool {
        self.tables.len() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_ref_parse() {
        assert_eq!(ColumnRef::parse("estates.name"), ColumnRef::qualified("estates", "name"));
        assert_eq!(ColumnRef::parse(" avg_price "), ColumnRef::bare("avg_price"));
        assert_eq!(ColumnRef::parse(".name"), ColumnRef::bare(".name"));
        assert!(ColumnRef::parse("estates.*").is_wildcard());
    }

    #[test]
    fn test_filter_operator_parse() {
        assert_eq!(FilterOperator::parse("=="), Some(FilterOperator::Eq));
        assert_eq!(FilterOperator::parse("IS  NOT null"), Some(FilterOperator::IsNotNull));
        assert_eq!(FilterOperator::parse("<>"), Some(FilterOperator::NotEq));
        assert_eq!(FilterOperator::parse("between"), None);
        assert!(!FilterOperator::IsNull.takes_value());
    }

    #[test]
    fn test_aggregate_function_parse() {
        assert_eq!(AggregateFunction::parse("Average"), Some(AggregateFunction::Avg));
        assert_eq!(AggregateFunction::parse("COUNT"), Some(AggregateFunction::Count));
        assert_eq!(AggregateFunction::parse("median"), None);
    }

    #[test]
    fn test_intent_deserializes_from_serialized_form() {
        let intent = Intent {
            tables: vec!["estates".to_string()],
            projections: vec![ColumnRef::bare("avg_price")],
            filters: vec![Filter {
                target: ColumnRef::bare("name"),
                operator: FilterOperator::Eq,
                value: SqlValue::Text("Taikoo Shing".to_string()),
            }],
            aggregation: None,
            sort: None,
            limit: None,
        };
        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["filters"][0]["operator"], "eq");
        let back: Intent = serde_json::from_value(json).unwrap();
        assert_eq!(back, intent);
    }

    #[test]
    fn test_aggregation_group_by_defaults_to_empty() {
        let json = serde_json::json!({
            "tables": ["estates"],
            "projections": [{"table": null, "column": "avg_price"}],
            "filters": [],
            "aggregation": {"function": "avg"},
            "sort": null,
            "limit": null
        });
        let intent: Intent = serde_json::from_value(json).unwrap();
        let aggregation = intent.aggregation.unwrap();
        assert_eq!(aggregation.function, AggregateFunction::Avg);
        assert!(aggregation.group_by.is_empty());
    }
}

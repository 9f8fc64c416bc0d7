//! Query Generator - template SQL from a validated intent
//!
//! The statement shape is picked from a closed set of templates keyed by the
//! intent's shape. All literal values become `?` bind parameters. Intents no
//! template covers go to a constrained model call; its output is still
//! subject to the query validator.

use crate::db::SqlValue;
use crate::error::{PipelineError, Result};
use crate::intent::{AggregateFunction, ResolvedColumn, ValidatedIntent};
use crate::llm::{strip_code_fences, LanguageModel};
use crate::prompts;
use crate::schema::{JoinEdge, SchemaSnapshot};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateShape {
    SimpleProjection,
    FilteredProjection,
    Aggregation,
    Join,
}

/// How a statement came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "path", content = "template")]
pub enum GenerationPath {
    Template(TemplateShape),
    ModelFallback,
    /// Supplied directly by a caller (e.g. the `check-sql` command)
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedQuery {
    pub sql: String,
    /// Bound in order to the statement's `?` placeholders
    pub params: Vec<SqlValue>,
    pub path: GenerationPath,
    pub intent: Option<ValidatedIntent>,
}

impl GeneratedQuery {
    pub fn manual(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
            path: GenerationPath::Manual,
            intent: None,
        }
    }
}

/// Template registry.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTemplate {
    SimpleProjection,
    FilteredProjection,
    Aggregation,
    /// Multi-table query along a foreign-key path
    Join(Vec<JoinEdge>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationStrategy {
    Template(QueryTemplate),
    ModelFallback,
}

impl GenerationStrategy {
    /// Pick a strategy from the shape of `intent`.
    pub fn select(intent: &ValidatedIntent, schema: &SchemaSnapshot) -> Self {
        if !intent.is_single_table() {
            return match schema.join_plan(intent.tables()) {
                Some(edges) => GenerationStrategy::Template(QueryTemplate::Join(edges)),
                None => GenerationStrategy::ModelFallback,
            };
        }
        let template = if intent.aggregation().is_some() {
            QueryTemplate::Aggregation
        } else if !intent.filters().is_empty() {
            QueryTemplate::FilteredProjection
        } else {
            QueryTemplate::SimpleProjection
        };
        GenerationStrategy::Template(template)
    }
}

impl QueryTemplate {
    pub fn shape(&self) -> TemplateShape {
        match self {
            QueryTemplate::SimpleProjection => TemplateShape::SimpleProjection,
            QueryTemplate::FilteredProjection => TemplateShape::FilteredProjection,
            QueryTemplate::Aggregation => TemplateShape::Aggregation,
            QueryTemplate::Join(_) => TemplateShape::Join,
        }
    }

    /// Render SQL and its bind parameters.
    pub fn render(&self, intent: &ValidatedIntent, limit: u32) -> Result<(String, Vec<SqlValue>)> {
        let (from_clause, names) = match self {
            QueryTemplate::Join(edges) => join_clause(intent, edges),
            _ => {
                let table = intent.tables().first().ok_or_else(|| {
                    PipelineError::TemplateSelection("intent names no table".to_string())
                })?;
                (quote_ident(table), ColumnNames::Bare)
            }
        };

        let mut clauses = vec![format!("SELECT {}", select_list(intent, &names)?)];
        clauses.push(format!("FROM {}", from_clause));

        let mut params = Vec::new();
        if !intent.filters().is_empty() {
            let predicates = intent
                .filters()
                .iter()
                .map(|f| {
                    let column = names.render(&f.target);
                    if f.operator.takes_value() {
                        params.push(f.value.clone());
                        format!("{} {} ?", column, f.operator.as_sql())
                    } else {
                        format!("{} {}", column, f.operator.as_sql())
                    }
                })
                .join(" AND ");
            clauses.push(format!("WHERE {}", predicates));
        }

        if let Some(aggregation) = intent.aggregation() {
            if !aggregation.group_by.is_empty() {
                clauses.push(format!(
                    "GROUP BY {}",
                    aggregation.group_by.iter().map(|c| names.render(c)).join(", ")
                ));
            }
        }

        if let Some(sort) = intent.sort() {
            let target = match measure_alias(intent, &sort.target) {
                Some(alias) => alias,
                None => names.render(&sort.target),
            };
            clauses.push(format!("ORDER BY {} {}", target, sort.direction.as_sql()));
        }

        clauses.push(format!("LIMIT {}", limit));
        Ok((clauses.join(" "), params))
    }
}

/// How column references are written: bare for one table, alias-qualified
/// for joins.
enum ColumnNames {
    Bare,
    Aliased(HashMap<String, String>),
}

impl ColumnNames {
    fn render(&self, column: &ResolvedColumn) -> String {
        match self {
            ColumnNames::Bare => quote_ident(&column.column),
            ColumnNames::Aliased(aliases) => match aliases.get(&column.table) {
                Some(alias) => format!("{}.{}", alias, quote_ident(&column.column)),
                None => format!("{}.{}", quote_ident(&column.table), quote_ident(&column.column)),
            },
        }
    }
}

fn join_clause(intent: &ValidatedIntent, edges: &[JoinEdge]) -> (String, ColumnNames) {
    let first = intent.tables().first().cloned().unwrap_or_default();
    let ordered: Vec<&str> = std::iter::once(first.as_str())
        .chain(edges.iter().map(|e| e.right_table.as_str()))
        .collect();
    let aliases = table_aliases(&ordered);
    let alias_of = |table: &str| aliases.get(table).cloned().unwrap_or_else(|| quote_ident(table));

    let mut from = format!("{} {}", quote_ident(&first), alias_of(&first));
    for edge in edges {
        from.push_str(&format!(
            " JOIN {} {} ON {}.{} = {}.{}",
            quote_ident(&edge.right_table),
            alias_of(&edge.right_table),
            alias_of(&edge.right_table),
            quote_ident(&edge.right_column),
            alias_of(&edge.left_table),
            quote_ident(&edge.left_column),
        ));
    }
    (from, ColumnNames::Aliased(aliases))
}

/// Short aliases from word initials (`estate_facilities` -> `ef`), numbered
/// on collision.
fn table_aliases(tables: &[&str]) -> HashMap<String, String> {
    let mut aliases: HashMap<String, String> = HashMap::new();
    for table in tables {
        let base: String = table
            .split('_')
            .filter_map(|word| word.chars().find(|c| c.is_ascii_alphabetic()))
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let base = if base.is_empty() { "t".to_string() } else { base };
        let mut alias = base.clone();
        let mut n = 2;
        while aliases.values().any(|a| a == &alias) || is_reserved(&alias) {
            alias = format!("{}{}", base, n);
            n += 1;
        }
        aliases.insert(table.to_string(), alias);
    }
    aliases
}

/// Projection columns that are aggregated (not grouped) under an aggregation.
fn measures(intent: &ValidatedIntent) -> Vec<&ResolvedColumn> {
    match intent.aggregation() {
        Some(aggregation) => intent
            .projections()
            .iter()
            .filter(|c| !aggregation.group_by.contains(c))
            .collect(),
        None => Vec::new(),
    }
}

fn measure_names(intent: &ValidatedIntent) -> Vec<(ResolvedColumn, String)> {
    let Some(aggregation) = intent.aggregation() else {
        return Vec::new();
    };
    let prefix = aggregation.function.alias_prefix();
    let mut named: Vec<(ResolvedColumn, String)> = Vec::new();
    for column in measures(intent) {
        let mut alias = format!("{}_{}", prefix, column.column);
        if named.iter().any(|(_, a)| a == &alias) {
            alias = format!("{}_{}_{}", prefix, column.table, column.column);
        }
        named.push((column.clone(), alias));
    }
    named
}

fn measure_alias(intent: &ValidatedIntent, column: &ResolvedColumn) -> Option<String> {
    measure_names(intent)
        .into_iter()
        .find(|(c, _)| c == column)
        .map(|(_, alias)| quote_ident(&alias))
}

fn select_list(intent: &ValidatedIntent, names: &ColumnNames) -> Result<String> {
    let Some(aggregation) = intent.aggregation() else {
        if intent.projections().is_empty() {
            return Err(PipelineError::TemplateSelection(
                "intent has neither columns nor an aggregation".to_string(),
            ));
        }
        return Ok(intent.projections().iter().map(|c| names.render(c)).join(", "));
    };

    let function = aggregation.function;
    let mut items: Vec<String> = aggregation.group_by.iter().map(|c| names.render(c)).collect();
    let measures = measure_names(intent);
    if measures.is_empty() {
        if function != AggregateFunction::Count {
            return Err(PipelineError::TemplateSelection(format!(
                "{} needs a column to aggregate",
                function.as_sql()
            )));
        }
        items.push("COUNT(*) AS record_count".to_string());
    } else {
        items.extend(measures.iter().map(|(column, alias)| {
            format!("{}({}) AS {}", function.as_sql(), names.render(column), quote_ident(alias))
        }));
    }
    Ok(items.join(", "))
}

const RESERVED: &[&str] = &[
    "all", "and", "as", "asc", "between", "by", "case", "check", "default", "desc", "distinct",
    "else", "end", "from", "group", "having", "in", "index", "is", "join", "key", "like",
    "limit", "not", "null", "on", "or", "order", "primary", "select", "table", "then", "to",
    "union", "values", "when", "where",
];

fn is_reserved(ident: &str) -> bool {
    RESERVED.contains(&ident.to_ascii_lowercase().as_str())
}

/// Quote an identifier unless it is a plain, non-reserved name.
pub fn quote_ident(ident: &str) -> String {
    let simple = ident
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple && !is_reserved(ident) {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

pub struct QueryGenerator {
    model: Option<Arc<dyn LanguageModel>>,
    timeout: Duration,
    default_limit: u32,
    row_ceiling: u32,
}

impl QueryGenerator {
    pub fn new(default_limit: u32, row_ceiling: u32) -> Self {
        Self {
            model: None,
            timeout: Duration::from_secs(10),
            default_limit,
            row_ceiling,
        }
    }

    /// Enable the constrained model fallback.
    pub fn with_fallback(mut self, model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        self.model = Some(model);
        self.timeout = timeout;
        self
    }

    /// Requested limit, or the default, never above the row ceiling.
    pub fn effective_limit(&self, intent: &ValidatedIntent) -> u32 {
        intent
            .limit()
            .unwrap_or(self.default_limit)
            .clamp(1, self.row_ceiling.max(1))
    }

    pub async fn generate(
        &self,
        question: &str,
        intent: ValidatedIntent,
        schema: &SchemaSnapshot,
    ) -> Result<GeneratedQuery> {
        let limit = self.effective_limit(&intent);
        match GenerationStrategy::select(&intent, schema) {
            GenerationStrategy::Template(template) => {
                let (sql, params) = template.render(&intent, limit)?;
                info!("Generated SQL from {:?} template", template.shape());
                debug!("SQL: {} params={:?}", sql, params);
                Ok(GeneratedQuery {
                    sql,
                    params,
                    path: GenerationPath::Template(template.shape()),
                    intent: Some(intent),
                })
            }
            GenerationStrategy::ModelFallback => self.fallback(question, intent, schema, limit).await,
        }
    }

    async fn fallback(
        &self,
        question: &str,
        intent: ValidatedIntent,
        schema: &SchemaSnapshot,
        limit: u32,
    ) -> Result<GeneratedQuery> {
        if intent.projections().is_empty() && intent.aggregation().is_none() {
            return Err(PipelineError::TemplateSelection(
                "intent has neither columns nor an aggregation".to_string(),
            ));
        }
        let model = self.model.as_ref().ok_or_else(|| {
            PipelineError::TemplateSelection(format!(
                "no template joins {:?} and no fallback model is configured",
                intent.tables()
            ))
        })?;

        warn!("No template for tables {:?}, using model fallback", intent.tables());
        let prompt = prompts::build_fallback_sql_prompt(question, &intent, limit);
        let schema_context = schema.summary_of(intent.tables());
        let response = timeout(self.timeout, model.complete(&prompt, &schema_context))
            .await
            .map_err(|_| PipelineError::TemplateSelection("fallback generation timed out".to_string()))?
            .map_err(|e| PipelineError::TemplateSelection(format!("fallback generation failed: {}", e)))?;

        let sql = strip_code_fences(&response).trim().trim_end_matches(';').trim().to_string();
        if sql.is_empty() {
            return Err(PipelineError::TemplateSelection(
                "fallback generation returned no statement".to_string(),
            ));
        }
        let params = intent
            .filters()
            .iter()
            .filter(|f| f.operator.takes_value())
            .map(|f| f.value.clone())
            .collect();
        debug!("Fallback SQL: {}", sql);

        Ok(GeneratedQuery {
            sql,
            params,
            path: GenerationPath::ModelFallback,
            intent: Some(intent),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{
        Aggregation, ColumnRef, Filter, FilterOperator, Intent, SortDirection, SortSpec,
    };
    use crate::llm::ScriptedModel;
    use crate::schema::tests::housing_snapshot;
    use crate::schema_validator::SchemaValidator;

    fn validated(intent: Intent) -> ValidatedIntent {
        SchemaValidator::default()
            .validate(&intent, &housing_snapshot())
            .unwrap()
    }

    fn name_filter(column: &str, value: &str) -> Filter {
        Filter {
            target: ColumnRef::bare(column),
            operator: FilterOperator::Eq,
            value: SqlValue::Text(value.to_string()),
        }
    }

    async fn generate(intent: Intent) -> Result<GeneratedQuery> {
        QueryGenerator::new(50, 500)
            .generate("q", validated(intent), &housing_snapshot())
            .await
    }

    #[tokio::test]
    async fn test_filtered_projection_binds_values() {
        let query = generate(Intent {
            tables: vec!["estates".to_string()],
            projections: vec![ColumnRef::qualified("estates", "avg_price")],
            filters: vec![name_filter("name", "Taikoo Shing")],
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(query.sql, "SELECT avg_price FROM estates WHERE name = ? LIMIT 50");
        assert_eq!(query.params, vec![SqlValue::Text("Taikoo Shing".to_string())]);
        assert_eq!(query.path, GenerationPath::Template(TemplateShape::FilteredProjection));
    }

    #[tokio::test]
    async fn test_simple_projection_respects_limit_and_ceiling() {
        let query = generate(Intent {
            tables: vec!["estates".to_string()],
            projections: vec![ColumnRef::bare("name"), ColumnRef::bare("district")],
            limit: Some(5000),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(query.sql, "SELECT name, district FROM estates LIMIT 500");
        assert!(query.params.is_empty());
    }

    #[tokio::test]
    async fn test_aggregation_template() {
        let query = generate(Intent {
            tables: vec!["estates".to_string()],
            projections: vec![ColumnRef::bare("avg_price")],
            aggregation: Some(Aggregation {
                function: AggregateFunction::Avg,
                group_by: vec![ColumnRef::bare("district")],
            }),
            sort: Some(SortSpec {
                target: ColumnRef::bare("avg_price"),
                direction: SortDirection::Desc,
            }),
            limit: Some(3),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(
            query.sql,
            "SELECT district, AVG(avg_price) AS avg_avg_price FROM estates GROUP BY district ORDER BY avg_avg_price DESC LIMIT 3"
        );
    }

    #[tokio::test]
    async fn test_count_without_measure() {
        let query = generate(Intent {
            tables: vec!["units".to_string()],
            filters: vec![Filter {
                target: ColumnRef::bare("floor"),
                operator: FilterOperator::Gt,
                value: SqlValue::Integer(30),
            }],
            aggregation: Some(Aggregation {
                function: AggregateFunction::Count,
                group_by: vec![],
            }),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(
            query.sql,
            "SELECT COUNT(*) AS record_count FROM units WHERE floor > ? LIMIT 50"
        );
        assert_eq!(query.params, vec![SqlValue::Integer(30)]);
    }

    #[tokio::test]
    async fn test_join_follows_foreign_keys() {
        let query = generate(Intent {
            tables: vec!["estates".to_string(), "transactions".to_string()],
            projections: vec![ColumnRef::bare("tx_date"), ColumnRef::bare("price")],
            filters: vec![name_filter("name", "Lohas Park")],
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(
            query.sql,
            "SELECT t.tx_date, t.price FROM estates e \
             JOIN buildings b ON b.estate_id = e.estate_id \
             JOIN units u ON u.building_id = b.building_id \
             JOIN transactions t ON t.unit_id = u.unit_id \
             WHERE e.name = ? LIMIT 50"
        );
        assert_eq!(query.path, GenerationPath::Template(TemplateShape::Join));
    }

    #[tokio::test]
    async fn test_no_template_and_no_fallback_fails() {
        let err = generate(Intent {
            tables: vec!["estates".to_string(), "facilities".to_string()],
            projections: vec![ColumnRef::bare("name"), ColumnRef::bare("facility_name")],
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::TemplateSelection(_)));
    }

    #[tokio::test]
    async fn test_model_fallback_for_unjoinable_tables() {
        let model = Arc::new(ScriptedModel::new([
            "```sql\nSELECT e.name, f.facility_name FROM estates e JOIN facilities f ON f.facility_name LIKE e.name WHERE e.district = ? LIMIT 50;\n```",
        ]));
        let generator = QueryGenerator::new(50, 500).with_fallback(model.clone(), Duration::from_secs(5));
        let intent = validated(Intent {
            tables: vec!["estates".to_string(), "facilities".to_string()],
            projections: vec![ColumnRef::bare("name"), ColumnRef::bare("facility_name")],
            filters: vec![name_filter("district", "Sai Kung")],
            ..Default::default()
        });
        let query = generator
            .generate("Which facilities are in Sai Kung estates?", intent, &housing_snapshot())
            .await
            .unwrap();
        assert_eq!(query.path, GenerationPath::ModelFallback);
        assert!(query.sql.ends_with("LIMIT 50"));
        assert_eq!(query.params, vec![SqlValue::Text("Sai Kung".to_string())]);
        assert!(model.prompts()[0].contains("estates.district = ?"));
    }

    #[test]
    fn test_empty_projection_without_aggregation() {
        let err = QueryTemplate::SimpleProjection
            .render(
                &validated(Intent {
                    tables: vec!["estates".to_string()],
                    ..Default::default()
                }),
                50,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::TemplateSelection(_)));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("avg_price"), "avg_price");
        assert_eq!(quote_ident("order"), "\"order\"");
        assert_eq!(quote_ident("Sale Price"), "\"Sale Price\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_table_aliases_avoid_collisions() {
        let aliases = table_aliases(&["estates", "estate_facilities", "events"]);
        assert_eq!(aliases["estates"], "e");
        assert_eq!(aliases["estate_facilities"], "ef");
        assert_eq!(aliases["events"], "e2");
    }
}

//! Schema Validator - Prevents Hallucination
//!
//! Checks every table and column an `Intent` names against the schema
//! snapshot. Unknown names are resolved with the deterministic fuzzy matcher
//! or rejected with `SchemaMismatch`; nothing unresolved reaches generation.

use crate::error::{PipelineError, Result};
use crate::fuzzy_matcher::{FuzzyMatcher, MatchOutcome, MatchRationale};
use crate::intent::{
    Aggregation, ColumnRef, Filter, Intent, ReferenceKind, ResolvedColumn, SortSpec, Substitution,
    ValidatedIntent,
};
use crate::schema::SchemaSnapshot;
use std::collections::HashMap;
use tracing::{debug, info};

pub struct SchemaValidator {
    fuzzy_matcher: FuzzyMatcher,
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self {
            fuzzy_matcher: FuzzyMatcher::default(),
        }
    }
}

impl SchemaValidator {
    pub fn new(fuzzy_threshold: f64) -> Self {
        Self {
            fuzzy_matcher: FuzzyMatcher::new(fuzzy_threshold),
        }
    }

    /// Resolve every reference in `intent` against `schema`.
    ///
    /// Either all references resolve (exactly or through one recorded
    /// substitution each) or the first unresolved one is reported.
    pub fn validate(&self, intent: &Intent, schema: &SchemaSnapshot) -> Result<ValidatedIntent> {
        let mut resolver = Resolver {
            schema,
            matcher: &self.fuzzy_matcher,
            tables: Vec::new(),
            table_names: HashMap::new(),
            substitutions: Vec::new(),
        };

        for table in &intent.tables {
            resolver.table(table)?;
        }

        let mut projections = Vec::new();
        for reference in &intent.projections {
            for resolved in resolver.columns(reference)? {
                if !projections.contains(&resolved) {
                    projections.push(resolved);
                }
            }
        }

        let filters = intent
            .filters
            .iter()
            .map(|f| {
                Ok(Filter {
                    target: resolver.column(&f.target)?,
                    operator: f.operator,
                    value: f.value.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let aggregation = match &intent.aggregation {
            Some(aggregation) => {
                let mut group_by = Vec::new();
                for reference in &aggregation.group_by {
                    let resolved = resolver.column(reference)?;
                    if !group_by.contains(&resolved) {
                        group_by.push(resolved);
                    }
                }
                Some(Aggregation {
                    function: aggregation.function,
                    group_by,
                })
            }
            None => None,
        };

        let sort = match &intent.sort {
            Some(sort) => Some(SortSpec {
                target: resolver.column(&sort.target)?,
                direction: sort.direction,
            }),
            None => None,
        };

        for substitution in &resolver.substitutions {
            info!("Schema substitution: {}", substitution);
        }
        debug!(
            "Validated intent over tables {:?} ({} substitutions)",
            resolver.tables,
            resolver.substitutions.len()
        );

        Ok(ValidatedIntent {
            tables: resolver.tables,
            projections,
            filters,
            aggregation,
            sort,
            limit: intent.limit,
            substitutions: resolver.substitutions,
        })
    }
}

struct Resolver<'a> {
    schema: &'a SchemaSnapshot,
    matcher: &'a FuzzyMatcher,
    /// Resolved tables in first-mention order
    tables: Vec<String>,
    /// Name as written -> resolved table
    table_names: HashMap<String, String>,
    substitutions: Vec<Substitution>,
}

impl Resolver<'_> {
    fn record(&mut self, substitution: Substitution) {
        let seen = self
            .substitutions
            .iter()
            .any(|s| s.kind == substitution.kind && s.original == substitution.original);
        if !seen {
            self.substitutions.push(substitution);
        }
    }

    fn table(&mut self, name: &str) -> Result<String> {
        if let Some(resolved) = self.table_names.get(name) {
            return Ok(resolved.clone());
        }

        let resolved = match self.matcher.best_match(name, self.schema.table_names()) {
            MatchOutcome::Exact(table) => table,
            MatchOutcome::Substitute {
                candidate,
                score,
                rationale,
            } => {
                self.record(Substitution {
                    kind: ReferenceKind::Table,
                    original: name.to_string(),
                    resolved: candidate.clone(),
                    confidence: score,
                    rationale,
                });
                candidate
            }
            MatchOutcome::Ambiguous(candidates) => {
                return Err(PipelineError::schema_mismatch(name, candidates))
            }
            MatchOutcome::NoMatch => {
                let lowered = name.to_lowercase();
                let suggestions = self
                    .schema
                    .table_names()
                    .filter(|t| !lowered.is_empty() && t.to_lowercase().contains(&lowered))
                    .map(str::to_string)
                    .collect();
                return Err(PipelineError::schema_mismatch(name, suggestions));
            }
        };

        self.table_names.insert(name.to_string(), resolved.clone());
        if !self.tables.contains(&resolved) {
            self.tables.push(resolved.clone());
        }
        Ok(resolved)
    }

    /// Resolve a column reference to exactly one `table.column`.
    fn column(&mut self, reference: &ColumnRef) -> Result<ResolvedColumn> {
        if reference.is_wildcard() {
            return Err(PipelineError::schema_mismatch(reference.to_string(), Vec::new()));
        }
        match &reference.table {
            Some(table) => {
                let table = self.table(table)?;
                self.column_in(&table, reference)
            }
            None => self.bare_column(reference),
        }
    }

    /// Like `column`, but `*` expands to every column of its table(s).
    fn columns(&mut self, reference: &ColumnRef) -> Result<Vec<ResolvedColumn>> {
        if !reference.is_wildcard() {
            return Ok(vec![self.column(reference)?]);
        }
        let tables = match &reference.table {
            Some(table) => vec![self.table(table)?],
            None => self.tables.clone(),
        };
        Ok(tables
            .iter()
            .filter_map(|t| self.schema.table(t))
            .flat_map(|t| t.column_names().map(|c| ResolvedColumn::new(t.name.as_str(), c)))
            .collect())
    }

    fn column_in(&mut self, table: &str, reference: &ColumnRef) -> Result<ResolvedColumn> {
        let schema = self.schema;
        let Some(table_schema) = schema.table(table) else {
            return Err(PipelineError::schema_mismatch(reference.to_string(), Vec::new()));
        };

        match self.matcher.best_match(&reference.column, table_schema.column_names()) {
            MatchOutcome::Exact(column) => Ok(ResolvedColumn::new(table, column)),
            MatchOutcome::Substitute {
                candidate,
                score,
                rationale,
            } => {
                let resolved = ResolvedColumn::new(table, candidate);
                self.record_column(reference, &resolved, score, rationale);
                Ok(resolved)
            }
            MatchOutcome::Ambiguous(candidates) => Err(PipelineError::schema_mismatch(
                reference.to_string(),
                candidates.into_iter().map(|c| format!("{}.{}", table, c)).collect(),
            )),
            MatchOutcome::NoMatch => Err(PipelineError::schema_mismatch(reference.to_string(), Vec::new())),
        }
    }

    /// An unqualified column must belong to exactly one of the intent's
    /// tables, or exactly one table the join graph can add.
    fn bare_column(&mut self, reference: &ColumnRef) -> Result<ResolvedColumn> {
        let schema = self.schema;
        let owners: Vec<&str> = self
            .tables
            .iter()
            .filter(|t| schema.exists(t, Some(&reference.column)))
            .map(String::as_str)
            .collect();
        match owners.as_slice() {
            [table] => return Ok(ResolvedColumn::new(*table, reference.column.as_str())),
            [] => {}
            many => {
                return Err(PipelineError::schema_mismatch(
                    reference.to_string(),
                    many.iter().map(|t| format!("{}.{}", t, reference.column)).collect(),
                ))
            }
        }

        if let Some(resolved) = self.joinable_column(reference)? {
            return Ok(resolved);
        }

        // Tier by tier across all intent tables, as within a single table.
        let mut tier_one: Vec<(ResolvedColumn, f64, MatchRationale)> = Vec::new();
        let mut tier_two: Vec<(ResolvedColumn, f64, MatchRationale)> = Vec::new();
        for table in &self.tables {
            let Some(table_schema) = schema.table(table) else {
                continue;
            };
            match self.matcher.best_match(&reference.column, table_schema.column_names()) {
                MatchOutcome::Exact(column) => tier_one.push((
                    ResolvedColumn::new(table.as_str(), column),
                    1.0,
                    MatchRationale::CaseInsensitive,
                )),
                MatchOutcome::Substitute {
                    candidate,
                    score,
                    rationale,
                } => {
                    let entry = (ResolvedColumn::new(table.as_str(), candidate), score, rationale);
                    match rationale {
                        MatchRationale::Similarity => tier_two.push(entry),
                        _ => tier_one.push(entry),
                    }
                }
                MatchOutcome::Ambiguous(candidates) => {
                    return Err(PipelineError::schema_mismatch(
                        reference.to_string(),
                        candidates.into_iter().map(|c| format!("{}.{}", table, c)).collect(),
                    ))
                }
                MatchOutcome::NoMatch => {}
            }
        }

        let candidates = if tier_one.is_empty() { tier_two } else { tier_one };
        match candidates.as_slice() {
            [] => Err(PipelineError::schema_mismatch(
                reference.to_string(),
                self.column_suggestions(&reference.column),
            )),
            [(resolved, score, rationale)] => {
                let (resolved, score, rationale) = (resolved.clone(), *score, *rationale);
                self.record_column(reference, &resolved, score, rationale);
                Ok(resolved)
            }
            many => Err(PipelineError::schema_mismatch(
                reference.to_string(),
                many.iter().map(|(c, _, _)| c.to_string()).collect(),
            )),
        }
    }

    /// A column none of the intent's tables has, found as written on other
    /// tables. A single owner the join graph reaches is added to the intent.
    fn joinable_column(&mut self, reference: &ColumnRef) -> Result<Option<ResolvedColumn>> {
        let schema = self.schema;
        let owners: Vec<&str> = schema
            .tables()
            .filter(|t| !self.tables.contains(&t.name) && t.has_column(&reference.column))
            .map(|t| t.name.as_str())
            .collect();
        let owner = match owners.as_slice() {
            [] => return Ok(None),
            [owner] => *owner,
            many => {
                return Err(PipelineError::schema_mismatch(
                    reference.to_string(),
                    many.iter().map(|t| format!("{}.{}", t, reference.column)).collect(),
                ))
            }
        };

        let mut extended = self.tables.clone();
        extended.push(owner.to_string());
        if schema.join_plan(&extended).is_none() {
            debug!("{} exists on {} but no join path reaches it", reference, owner);
            return Err(PipelineError::schema_mismatch(
                reference.to_string(),
                vec![format!("{}.{}", owner, reference.column)],
            ));
        }

        let resolved = ResolvedColumn::new(owner, reference.column.as_str());
        self.tables = extended;
        self.record_column(reference, &resolved, 1.0, MatchRationale::JoinableTable);
        Ok(Some(resolved))
    }

    /// Schema columns whose name contains `partial`, as `table.column`.
    fn column_suggestions(&self, partial: &str) -> Vec<String> {
        let lowered = partial.to_lowercase();
        if lowered.is_empty() {
            return Vec::new();
        }
        let mut suggestions = Vec::new();
        for table in self.schema.tables() {
            for column in table.column_names() {
                if column.to_lowercase().contains(&lowered) {
                    suggestions.push(format!("{}.{}", table.name, column));
                }
            }
        }
        suggestions
    }

    fn record_column(&mut self, reference: &ColumnRef, resolved: &ResolvedColumn, score: f64, rationale: MatchRationale) {
        self.record(Substitution {
            kind: ReferenceKind::Column,
            original: reference.to_string(),
            resolved: resolved.to_string(),
            confidence: score,
            rationale,
        });
    }
}

//! Query Validator
//!
//! Gatekeeper between generation and execution. Checks run in a fixed order
//! on the sqlparser AST and the first failure wins:
//!
//! 1. the statement parses as SQLite and its `?` placeholders match the
//!    bound parameters
//! 2. exactly one read-only `SELECT`, with no mutating keyword anywhere
//! 3. every table and column still exists in the schema snapshot
//! 4. no cartesian joins, and aggregation-free multi-table queries carry a
//!    `LIMIT` within the row ceiling

use crate::error::{PipelineError, Result, ValidationCheck};
use crate::query_generator::{GenerationPath, GeneratedQuery};
use crate::db::SqlValue;
use crate::schema::SchemaSnapshot;
use sqlparser::ast::{
    visit_expressions, BinaryOperator, Expr, GroupByExpr, Ident, JoinConstraint, JoinOperator,
    OrderByExpr, Query, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins, Value,
    Visit, Visitor,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::ControlFlow;
use tracing::{debug, warn};

/// Words that never appear in a read-only query.
const MUTATING_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "MERGE", "ATTACH",
    "DETACH", "PRAGMA", "VACUUM", "REINDEX", "GRANT", "REVOKE", "EXEC", "EXECUTE",
];

const AGGREGATE_FUNCTIONS: &[&str] = &["AVG", "SUM", "COUNT", "MIN", "MAX", "TOTAL", "GROUP_CONCAT"];

/// A statement cleared for execution. Only the validator constructs these.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    query: GeneratedQuery,
    tables: Vec<String>,
}

impl ValidatedQuery {
    pub fn sql(&self) -> &str {
        &self.query.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.query.params
    }

    pub fn path(&self) -> GenerationPath {
        self.query.path
    }

    /// Schema tables the statement reads.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn generated(&self) -> &GeneratedQuery {
        &self.query
    }
}

pub struct QueryValidator {
    row_ceiling: u32,
}

impl QueryValidator {
    pub fn new(row_ceiling: u32) -> Self {
        Self { row_ceiling }
    }

    pub fn validate(&self, query: GeneratedQuery, schema: &SchemaSnapshot) -> Result<ValidatedQuery> {
        match self.check(&query, schema) {
            Ok(tables) => {
                debug!("Query passed validation over {:?}", tables);
                Ok(ValidatedQuery { query, tables })
            }
            Err(e) => {
                warn!("Query rejected: {}", e);
                Err(e)
            }
        }
    }

    fn check(&self, query: &GeneratedQuery, schema: &SchemaSnapshot) -> Result<Vec<String>> {
        let dialect = SQLiteDialect {};

        // (a) syntax and parameter binding
        let statements = Parser::parse_sql(&dialect, &query.sql)
            .map_err(|e| PipelineError::validation(ValidationCheck::Syntax, e.to_string()))?;
        if statements.is_empty() {
            return Err(PipelineError::validation(ValidationCheck::Syntax, "empty statement"));
        }
        let placeholders = count_placeholders(&statements);
        if placeholders != query.params.len() {
            return Err(PipelineError::validation(
                ValidationCheck::ParameterMismatch,
                format!("{} placeholders for {} parameters", placeholders, query.params.len()),
            ));
        }

        // (b) read-only retrieval
        if statements.len() > 1 {
            return Err(PipelineError::validation(
                ValidationCheck::MultipleStatements,
                format!("{} statements in one query", statements.len()),
            ));
        }
        if let Some(keyword) = find_mutating_keyword(&dialect, &query.sql)? {
            return Err(PipelineError::validation_at(
                ValidationCheck::MutatingKeyword,
                format!("'{}' is not allowed", keyword),
                keyword,
            ));
        }
        let Statement::Query(root) = &statements[0] else {
            return Err(PipelineError::validation(
                ValidationCheck::ReadOnly,
                "only SELECT statements may run",
            ));
        };

        // (c) schema re-check, resolved scope by scope
        let mut analysis = Analysis::new(schema);
        analysis.walk_query(root, None)?;

        // (d) cost bounds
        if let Some(relation) = analysis.cartesian.first() {
            return Err(PipelineError::validation_at(
                ValidationCheck::CartesianJoin,
                "no join condition links this relation to the rest of the FROM clause",
                relation.clone(),
            ));
        }
        let unbounded = analysis
            .root_selects
            .iter()
            .any(|select| select.relations > 1 && !select.aggregated);
        if unbounded {
            match literal_limit(root) {
                None => {
                    return Err(PipelineError::validation(
                        ValidationCheck::UnboundedJoin,
                        "multi-table query without a literal LIMIT",
                    ))
                }
                Some(limit) if limit > u64::from(self.row_ceiling) => {
                    return Err(PipelineError::validation(
                        ValidationCheck::UnboundedJoin,
                        format!("LIMIT {} exceeds the row ceiling of {}", limit, self.row_ceiling),
                    ))
                }
                Some(_) => {}
            }
        }

        Ok(analysis.tables)
    }
}

fn count_placeholders(statements: &[Statement]) -> usize {
    let mut count = 0;
    for statement in statements {
        let _ = visit_expressions(statement, |expr| {
            if let Expr::Value(Value::Placeholder(_)) = expr {
                count += 1;
            }
            ControlFlow::<()>::Continue(())
        });
    }
    count
}

fn find_mutating_keyword(dialect: &SQLiteDialect, sql: &str) -> Result<Option<String>> {
    let tokens = Tokenizer::new(dialect, sql)
        .tokenize()
        .map_err(|e| PipelineError::validation(ValidationCheck::Syntax, e.to_string()))?;
    Ok(tokens.into_iter().find_map(|token| match token {
        Token::Word(word) if word.quote_style.is_none() => {
            let upper = word.value.to_uppercase();
            MUTATING_KEYWORDS.contains(&upper.as_str()).then_some(upper)
        }
        _ => None,
    }))
}

fn literal_limit(query: &Query) -> Option<u64> {
    match &query.limit {
        Some(Expr::Value(Value::Number(n, _))) => n.parse().ok(),
        _ => None,
    }
}

fn unknown_column(written: impl Into<String>) -> PipelineError {
    PipelineError::validation_at(ValidationCheck::UnknownColumn, "column does not exist", written)
}

/// Columns a FROM source exposes, lowercased.
#[derive(Debug, Clone)]
enum Columns {
    Known(HashSet<String>),
    /// Table-valued functions; any name resolves
    Any,
}

impl Columns {
    fn named<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Columns::Known(names.into_iter().map(str::to_lowercase).collect())
    }

    fn contains(&self, column: &str) -> bool {
        match self {
            Columns::Known(names) => names.contains(&column.to_lowercase()),
            Columns::Any => true,
        }
    }
}

#[derive(Debug)]
struct Source {
    /// Lowercased alias or table name; empty for an unaliased subquery
    qualifier: String,
    label: String,
    columns: Columns,
}

/// Names visible inside one query or SELECT. Lookups fall through to the
/// enclosing scopes, which is how correlated subqueries resolve.
struct Scope<'p> {
    parent: Option<&'p Scope<'p>>,
    ctes: HashMap<String, Columns>,
    sources: Vec<Source>,
    output_aliases: HashSet<String>,
}

impl<'p> Scope<'p> {
    fn child(parent: Option<&'p Scope<'p>>) -> Self {
        Self {
            parent,
            ctes: HashMap::new(),
            sources: Vec::new(),
            output_aliases: HashSet::new(),
        }
    }

    fn cte(&self, name: &str) -> Option<&Columns> {
        self.ctes.get(name).or_else(|| self.parent.and_then(|p| p.cte(name)))
    }

    fn source(&self, qualifier: &str) -> Option<&Source> {
        self.sources
            .iter()
            .find(|s| s.qualifier == qualifier)
            .or_else(|| self.parent.and_then(|p| p.source(qualifier)))
    }

    fn knows_column(&self, column: &str) -> bool {
        self.sources.iter().any(|s| s.columns.contains(column))
            || self.output_aliases.contains(column)
            || self.parent.map_or(false, |p| p.knows_column(column))
    }

    fn output_columns(&self, projection: &[SelectItem]) -> Columns {
        let mut names = HashSet::new();
        for item in projection {
            let exposed: Vec<&Columns> = match item {
                SelectItem::ExprWithAlias { alias, .. } => {
                    names.insert(alias.value.to_lowercase());
                    Vec::new()
                }
                SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                    names.insert(ident.value.to_lowercase());
                    Vec::new()
                }
                SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                    if let Some(last) = parts.last() {
                        names.insert(last.value.to_lowercase());
                    }
                    Vec::new()
                }
                SelectItem::UnnamedExpr(expr) => {
                    names.insert(expr.to_string().to_lowercase());
                    Vec::new()
                }
                SelectItem::Wildcard(_) => self.sources.iter().map(|s| &s.columns).collect(),
                SelectItem::QualifiedWildcard(name, _) => name
                    .0
                    .last()
                    .and_then(|q| self.source(&q.value.to_lowercase()))
                    .map(|s| vec![&s.columns])
                    .unwrap_or_default(),
            };
            for columns in exposed {
                match columns {
                    Columns::Known(known) => names.extend(known.iter().cloned()),
                    Columns::Any => return Columns::Any,
                }
            }
        }
        Columns::Known(names)
    }
}

/// Join conditions gathered while a FROM clause is flattened into sources.
#[derive(Default)]
struct JoinConditions<'q> {
    on: Vec<&'q Expr>,
    /// USING and NATURAL joins, as (left, right) source indexes
    implicit: Vec<(usize, usize)>,
}

/// Union-find over a SELECT's sources; a predicate reading two sources links them.
struct Links {
    parent: Vec<usize>,
}

impl Links {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn link(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        self.parent[a] = b;
    }

    /// First source not reachable from the first one.
    fn first_detached(&mut self) -> Option<usize> {
        if self.parent.len() < 2 {
            return None;
        }
        let root = self.find(0);
        (1..self.parent.len()).find(|&i| self.find(i) != root)
    }
}

#[derive(Debug)]
struct SelectCost {
    relations: usize,
    aggregated: bool,
}

/// Scope-aware walk over one statement. Records the schema tables read, the
/// first SELECT whose sources are not all joined, and the cost facts of the
/// outermost SELECT (each arm, for a compound query).
struct Analysis<'s> {
    schema: &'s SchemaSnapshot,
    tables: Vec<String>,
    cartesian: Vec<String>,
    root_selects: Vec<SelectCost>,
    depth: usize,
}

impl<'s> Analysis<'s> {
    fn new(schema: &'s SchemaSnapshot) -> Self {
        Self {
            schema,
            tables: Vec::new(),
            cartesian: Vec::new(),
            root_selects: Vec::new(),
            depth: 0,
        }
    }

    fn walk_query(&mut self, query: &Query, parent: Option<&Scope>) -> Result<Columns> {
        self.depth += 1;
        let columns = self.walk_query_in_scope(query, parent);
        self.depth -= 1;
        columns
    }

    fn walk_query_in_scope(&mut self, query: &Query, parent: Option<&Scope>) -> Result<Columns> {
        let mut scope = Scope::child(parent);
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = cte.alias.name.value.to_lowercase();
                let declared = (!cte.alias.columns.is_empty())
                    .then(|| Columns::named(cte.alias.columns.iter().map(|c| c.value.as_str())));
                if with.recursive {
                    scope.ctes.insert(name.clone(), declared.clone().unwrap_or(Columns::Any));
                }
                let produced = self.walk_query(&cte.query, Some(&scope))?;
                scope.ctes.insert(name, declared.unwrap_or(produced));
            }
        }
        self.walk_set_expr(&query.body, &scope, &query.order_by)
    }

    fn walk_set_expr(&mut self, body: &SetExpr, scope: &Scope, order_by: &[OrderByExpr]) -> Result<Columns> {
        match body {
            SetExpr::Select(select) => self.walk_select(select, scope, order_by),
            SetExpr::Query(query) => self.walk_query(query, Some(scope)),
            SetExpr::SetOperation { left, right, .. } => {
                let columns = self.walk_set_expr(left, scope, &[])?;
                self.walk_set_expr(right, scope, &[])?;
                for item in order_by {
                    if let Expr::Identifier(ident) = &item.expr {
                        if !columns.contains(&ident.value) {
                            return Err(unknown_column(ident.value.clone()));
                        }
                    }
                }
                Ok(columns)
            }
            _ => Ok(Columns::Any),
        }
    }

    fn walk_select(&mut self, select: &Select, parent: &Scope, order_by: &[OrderByExpr]) -> Result<Columns> {
        if select.into.is_some() {
            return Err(PipelineError::validation(ValidationCheck::ReadOnly, "SELECT INTO writes a table"));
        }
        let mut scope = Scope::child(Some(parent));
        let mut conditions = JoinConditions::default();
        for from in &select.from {
            self.add_sources(from, &mut scope, &mut conditions)?;
        }
        for item in &select.projection {
            if let SelectItem::ExprWithAlias { alias, .. } = item {
                scope.output_aliases.insert(alias.value.to_lowercase());
            }
        }

        let mut subqueries: Vec<Query> = Vec::new();
        let mut aggregated = false;
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    let found = resolve(expr, &scope)?;
                    aggregated |= found.aggregated;
                    subqueries.extend(found.subqueries);
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let qualifier = name.0.last().map(|q| q.value.to_lowercase()).unwrap_or_default();
                    if scope.source(&qualifier).is_none() {
                        return Err(PipelineError::validation_at(
                            ValidationCheck::UnknownTable,
                            "qualifier names no table in scope",
                            name.to_string(),
                        ));
                    }
                }
                SelectItem::Wildcard(_) => {}
            }
        }

        let mut links = Links::new(scope.sources.len());
        for &(left, right) in &conditions.implicit {
            links.link(left, right);
        }
        for condition in conditions.on.iter().copied().chain(select.selection.as_ref()) {
            for conjunct in conjuncts(condition) {
                let found = resolve(conjunct, &scope)?;
                let mut read = found.sources.iter().copied();
                if let Some(first) = read.next() {
                    for other in read {
                        links.link(first, other);
                    }
                }
                subqueries.extend(found.subqueries);
            }
        }
        if let GroupByExpr::Expressions(exprs) = &select.group_by {
            aggregated |= !exprs.is_empty();
            for expr in exprs {
                subqueries.extend(resolve(expr, &scope)?.subqueries);
            }
        }
        let trailing = select.having.iter().chain(order_by.iter().map(|item| &item.expr));
        for expr in trailing {
            subqueries.extend(resolve(expr, &scope)?.subqueries);
        }

        if let Some(detached) = links.first_detached() {
            self.cartesian.push(scope.sources[detached].label.clone());
        }
        if self.depth == 1 {
            self.root_selects.push(SelectCost {
                relations: scope.sources.len(),
                aggregated,
            });
        }
        for subquery in &subqueries {
            self.walk_query(subquery, Some(&scope))?;
        }
        Ok(scope.output_columns(&select.projection))
    }

    fn add_sources<'q>(
        &mut self,
        from: &'q TableWithJoins,
        scope: &mut Scope<'_>,
        conditions: &mut JoinConditions<'q>,
    ) -> Result<()> {
        let left = scope.sources.len();
        self.add_factor(&from.relation, scope, conditions)?;
        for join in &from.joins {
            let right = scope.sources.len();
            self.add_factor(&join.relation, scope, conditions)?;
            match join_constraint(&join.join_operator) {
                Some(JoinConstraint::On(expr)) => conditions.on.push(expr),
                Some(JoinConstraint::Using(_)) | Some(JoinConstraint::Natural) => {
                    conditions.implicit.push((left, right))
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn add_factor<'q>(
        &mut self,
        factor: &'q TableFactor,
        scope: &mut Scope<'_>,
        conditions: &mut JoinConditions<'q>,
    ) -> Result<()> {
        let label = factor.to_string();
        let source = match factor {
            TableFactor::Table { name, alias, args, .. } => {
                let written = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
                let qualifier = alias
                    .as_ref()
                    .map(|a| a.name.value.to_lowercase())
                    .unwrap_or_else(|| written.to_lowercase());
                let columns = if args.is_some() {
                    Columns::Any
                } else if let Some(columns) = scope.cte(&written.to_lowercase()).cloned() {
                    columns
                } else {
                    let table = self.schema.find_table_ignore_case(&written).ok_or_else(|| {
                        PipelineError::validation_at(
                            ValidationCheck::UnknownTable,
                            "table does not exist",
                            written.clone(),
                        )
                    })?;
                    if !self.tables.contains(&table.name) {
                        self.tables.push(table.name.clone());
                    }
                    Columns::named(table.columns.iter().map(|c| c.name.as_str()))
                };
                Source {
                    qualifier,
                    label,
                    columns,
                }
            }
            TableFactor::Derived { subquery, alias, .. } => {
                // A derived table sees the enclosing query, not its FROM siblings.
                let outer = scope.parent;
                let produced = self.walk_query(subquery, outer)?;
                let (qualifier, columns) = match alias {
                    Some(alias) if !alias.columns.is_empty() => (
                        alias.name.value.to_lowercase(),
                        Columns::named(alias.columns.iter().map(|c| c.value.as_str())),
                    ),
                    Some(alias) => (alias.name.value.to_lowercase(), produced),
                    None => (String::new(), produced),
                };
                Source {
                    qualifier,
                    label,
                    columns,
                }
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                return self.add_sources(table_with_joins, scope, conditions);
            }
            _ => Source {
                qualifier: String::new(),
                label,
                columns: Columns::Any,
            },
        };
        scope.sources.push(source);
        Ok(())
    }
}

fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Inner(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint)
        | JoinOperator::LeftSemi(constraint)
        | JoinOperator::RightSemi(constraint)
        | JoinOperator::LeftAnti(constraint)
        | JoinOperator::RightAnti(constraint) => Some(constraint),
        _ => None,
    }
}

/// Split a predicate on its top-level ANDs.
fn conjuncts(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut parts = conjuncts(left);
            parts.extend(conjuncts(right));
            parts
        }
        Expr::Nested(inner) => conjuncts(inner),
        _ => vec![expr],
    }
}

/// What one expression reads at its own level. Subqueries are returned for
/// the caller to walk in a child scope.
#[derive(Default)]
struct Resolved {
    /// Indexes into the current SELECT's sources
    sources: BTreeSet<usize>,
    subqueries: Vec<Query>,
    aggregated: bool,
}

fn resolve(expr: &Expr, scope: &Scope) -> Result<Resolved> {
    let mut resolver = Resolver {
        scope,
        nested: 0,
        found: Resolved::default(),
    };
    match expr.visit(&mut resolver) {
        ControlFlow::Break(e) => Err(e),
        ControlFlow::Continue(()) => Ok(resolver.found),
    }
}

fn holds_subquery(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Subquery(_) | Expr::ArraySubquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. }
    )
}

/// Checks identifiers against a scope, skipping everything below a subquery.
struct Resolver<'a, 'p> {
    scope: &'a Scope<'p>,
    /// Subquery nesting below the expression being resolved
    nested: usize,
    found: Resolved,
}

impl Resolver<'_, '_> {
    fn bare(&mut self, ident: &Ident) -> ControlFlow<PipelineError> {
        let scope = self.scope;
        let column = ident.value.to_lowercase();
        let owners: Vec<usize> = scope
            .sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.columns.contains(&column))
            .map(|(i, _)| i)
            .collect();
        if let [owner] = owners.as_slice() {
            self.found.sources.insert(*owner);
        }
        if owners.is_empty() && !scope.knows_column(&column) {
            return ControlFlow::Break(unknown_column(ident.value.clone()));
        }
        ControlFlow::Continue(())
    }

    fn qualified(&mut self, parts: &[Ident]) -> ControlFlow<PipelineError> {
        let scope = self.scope;
        let column = &parts[parts.len() - 1].value;
        let qualifier = parts[parts.len() - 2].value.to_lowercase();
        let written = parts.iter().map(|p| p.value.as_str()).collect::<Vec<_>>().join(".");
        let source = match scope.sources.iter().position(|s| s.qualifier == qualifier) {
            Some(index) => {
                self.found.sources.insert(index);
                &scope.sources[index]
            }
            None => match scope.source(&qualifier) {
                Some(source) => source,
                None => {
                    return ControlFlow::Break(PipelineError::validation_at(
                        ValidationCheck::UnknownTable,
                        "qualifier names no table in scope",
                        written,
                    ))
                }
            },
        };
        if source.columns.contains(column) {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(unknown_column(written))
        }
    }
}

impl Visitor for Resolver<'_, '_> {
    type Break = PipelineError;

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<PipelineError> {
        if self.nested > 0 {
            if holds_subquery(expr) {
                self.nested += 1;
            }
            return ControlFlow::Continue(());
        }
        match expr {
            Expr::Subquery(query) | Expr::ArraySubquery(query) | Expr::Exists { subquery: query, .. } => {
                self.found.subqueries.push((**query).clone());
                self.nested += 1;
            }
            Expr::InSubquery { expr: operand, subquery, .. } => {
                // The operand belongs to this level but is visited below the subquery marker.
                match resolve(operand, self.scope) {
                    Ok(found) => {
                        self.found.sources.extend(found.sources);
                        self.found.subqueries.extend(found.subqueries);
                        self.found.aggregated |= found.aggregated;
                    }
                    Err(e) => return ControlFlow::Break(e),
                }
                self.found.subqueries.push((**subquery).clone());
                self.nested += 1;
            }
            Expr::Identifier(ident) => return self.bare(ident),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => return self.qualified(parts),
            Expr::Function(function) if function.over.is_none() => {
                let name = function.name.0.last().map(|i| i.value.to_uppercase()).unwrap_or_default();
                if AGGREGATE_FUNCTIONS.contains(&name.as_str()) {
                    self.found.aggregated = true;
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, expr: &Expr) -> ControlFlow<PipelineError> {
        if holds_subquery(expr) {
            self.nested = self.nested.saturating_sub(1);
        }
        ControlFlow::Continue(())
    }
}

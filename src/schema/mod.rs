//! Schema metadata
//!
//! `SchemaSnapshot` is the immutable table/column/foreign-key picture of the
//! housing database. It is built once per load and shared read-only through
//! `cache::SchemaCache`.

pub mod cache;

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Type as declared in the DDL (may be empty for untyped SQLite columns)
    pub declared_type: String,
    #[serde(default)]
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        self.columns.push(ColumnInfo {
            name: name.into(),
            declared_type: declared_type.into(),
            primary_key: false,
        });
        self
    }

    pub fn primary_key(mut self, name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        self.columns.push(ColumnInfo {
            name: name.into(),
            declared_type: declared_type.into(),
            primary_key: true,
        });
        self
    }

    pub fn references(
        mut self,
        column: impl Into<String>,
        table: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            references_table: table.into(),
            references_column: target_column.into(),
        });
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.get_column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// One hop of a join path: `left_table.left_column = right_table.right_column`,
/// where `left_table` is already part of the FROM clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEdge {
    pub left_table: String,
    pub left_column: String,
    pub right_table: String,
    pub right_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    tables: BTreeMap<String, TableSchema>,
    loaded_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    /// Build a snapshot, rejecting metadata that cannot back the pipeline:
    /// no tables, duplicate tables, tables without columns, or foreign keys
    /// pointing at unknown tables/columns.
    pub fn new(tables: Vec<TableSchema>) -> Result<Self> {
        if tables.is_empty() {
            return Err(PipelineError::SchemaLoad(
                "database exposes no tables".to_string(),
            ));
        }

        let mut by_name = BTreeMap::new();
        for table in tables {
            if table.columns.is_empty() {
                return Err(PipelineError::SchemaLoad(format!(
                    "table '{}' reports no columns",
                    table.name
                )));
            }
            let name = table.name.clone();
            if by_name.insert(name.clone(), table).is_some() {
                return Err(PipelineError::SchemaLoad(format!(
                    "table '{}' reported twice",
                    name
                )));
            }
        }

        for table in by_name.values() {
            for fk in &table.foreign_keys {
                let target_ok = by_name
                    .get(&fk.references_table)
                    .map(|t| t.has_column(&fk.references_column))
                    .unwrap_or(false);
                if !table.has_column(&fk.column) || !target_ok {
                    return Err(PipelineError::SchemaLoad(format!(
                        "foreign key {}.{} -> {}.{} is dangling",
                        table.name, fk.column, fk.references_table, fk.references_column
                    )));
                }
            }
        }

        Ok(Self {
            tables: by_name,
            loaded_at: Utc::now(),
        })
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Case-insensitive lookup, as SQLite resolves identifiers.
    pub fn find_table_ignore_case(&self, name: &str) -> Option<&TableSchema> {
        self.tables
            .get(name)
            .or_else(|| self.tables.values().find(|t| t.name.eq_ignore_ascii_case(name)))
    }

    pub fn exists(&self, table: &str, column: Option<&str>) -> bool {
        match (self.tables.get(table), column) {
            (Some(_), None) => true,
            (Some(t), Some(c)) => t.has_column(c),
            (None, _) => false,
        }
    }

    /// Column names of `table`; empty when the table is unknown.
    pub fn columns_of(&self, table: &str) -> BTreeSet<String> {
        self.tables
            .get(table)
            .map(|t| t.column_names().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn column_type(&self, table: &str, column: &str) -> Option<&str> {
        self.tables
            .get(table)
            .and_then(|t| t.get_column(column))
            .map(|c| c.declared_type.as_str())
    }

    /// Compact prompt rendering: one line per table plus foreign-key hints.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for table in self.tables.values() {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| {
                    if c.declared_type.is_empty() {
                        c.name.clone()
                    } else {
                        format!("{} ({})", c.name, c.declared_type)
                    }
                })
                .collect();
            lines.push(format!("{}: {}", table.name, columns.join(", ")));
        }
        let fk_lines: Vec<String> = self
            .tables
            .values()
            .flat_map(|t| {
                t.foreign_keys.iter().map(move |fk| {
                    format!(
                        "{}.{} -> {}.{}",
                        t.name, fk.column, fk.references_table, fk.references_column
                    )
                })
            })
            .collect();
        if !fk_lines.is_empty() {
            lines.push(String::new());
            lines.push("RELATIONSHIPS:".to_string());
            lines.extend(fk_lines);
        }
        lines.join("\n")
    }

    /// Summary restricted to the given tables (used for the fallback prompt).
    pub fn summary_of(&self, tables: &[String]) -> String {
        let wanted: HashSet<&str> = tables.iter().map(String::as_str).collect();
        let subset: Vec<TableSchema> = self
            .tables
            .values()
            .filter(|t| wanted.contains(t.name.as_str()))
            .map(|t| {
                let mut t = t.clone();
                t.foreign_keys.retain(|fk| wanted.contains(fk.references_table.as_str()));
                t
            })
            .collect();
        match SchemaSnapshot::new(subset) {
            Ok(snapshot) => snapshot.summary(),
            Err(_) => String::new(),
        }
    }

    /// Undirected foreign-key adjacency, neighbours in deterministic order.
    fn adjacency(&self) -> HashMap<&str, Vec<JoinEdge>> {
        let mut adjacency: HashMap<&str, Vec<JoinEdge>> = HashMap::new();
        for table in self.tables.values() {
            for fk in &table.foreign_keys {
                adjacency.entry(table.name.as_str()).or_default().push(JoinEdge {
                    left_table: table.name.clone(),
                    left_column: fk.column.clone(),
                    right_table: fk.references_table.clone(),
                    right_column: fk.references_column.clone(),
                });
                adjacency
                    .entry(fk.references_table.as_str())
                    .or_default()
                    .push(JoinEdge {
                        left_table: fk.references_table.clone(),
                        left_column: fk.references_column.clone(),
                        right_table: table.name.clone(),
                        right_column: fk.column.clone(),
                    });
            }
        }
        for edges in adjacency.values_mut() {
            edges.sort_by(|a, b| {
                (&a.right_table, &a.right_column, &a.left_column)
                    .cmp(&(&b.right_table, &b.right_column, &b.left_column))
            });
        }
        adjacency
    }

    /// Join edges connecting all `tables`, starting from the first one.
    ///
    /// Each further table is reached by the shortest foreign-key path from the
    /// tables joined so far; intermediate tables are pulled in as needed.
    /// Returns `None` when some table is unreachable.
    pub fn join_plan(&self, tables: &[String]) -> Option<Vec<JoinEdge>> {
        let first = tables.first()?;
        self.tables.get(first)?;
        let adjacency = self.adjacency();

        let mut joined: Vec<String> = vec![first.clone()];
        let mut plan: Vec<JoinEdge> = Vec::new();

        for target in tables.iter().skip(1) {
            if joined.contains(target) {
                continue;
            }
            self.tables.get(target)?;

            // Multi-source BFS from everything already joined.
            let mut previous: HashMap<String, JoinEdge> = HashMap::new();
            let mut seen: HashSet<String> = joined.iter().cloned().collect();
            let mut queue: VecDeque<String> = joined.iter().cloned().collect();
            let mut found = false;

            while let Some(current) = queue.pop_front() {
                if &current == target {
                    found = true;
                    break;
                }
                for edge in adjacency.get(current.as_str()).into_iter().flatten() {
                    if seen.insert(edge.right_table.clone()) {
                        previous.insert(edge.right_table.clone(), edge.clone());
                        queue.push_back(edge.right_table.clone());
                    }
                }
            }
            if !found {
                return None;
            }

            let mut hops = Vec::new();
            let mut cursor = target.clone();
            while let Some(edge) = previous.get(&cursor) {
                hops.push(edge.clone());
                cursor = edge.left_table.clone();
            }
            hops.reverse();
            for edge in hops {
                joined.push(edge.right_table.clone());
                plan.push(edge);
            }
        }

        Some(plan)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn housing_snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new(vec![
            TableSchema::new("estates")
                .primary_key("estate_id", "INTEGER")
                .column("name", "TEXT")
                .column("district", "TEXT")
                .column("avg_price", "REAL"),
            TableSchema::new("buildings")
                .primary_key("building_id", "INTEGER")
                .column("estate_id", "INTEGER")
                .column("building_name", "TEXT")
                .references("estate_id", "estates", "estate_id"),
            TableSchema::new("units")
                .primary_key("unit_id", "INTEGER")
                .column("building_id", "INTEGER")
                .column("floor", "INTEGER")
                .column("area", "REAL")
                .references("building_id", "buildings", "building_id"),
            TableSchema::new("transactions")
                .primary_key("tx_id", "INTEGER")
                .column("unit_id", "INTEGER")
                .column("price", "REAL")
                .column("tx_date", "TEXT")
                .references("unit_id", "units", "unit_id"),
            TableSchema::new("facilities")
                .primary_key("facility_id", "INTEGER")
                .column("facility_name", "TEXT"),
        ])
        .unwrap()
    }

    #[test]
    fn test_exists_and_columns_of() {
        let schema = housing_snapshot();
        assert!(schema.exists("estates", None));
        assert!(schema.exists("estates", Some("avg_price")));
        assert!(!schema.exists("estates", Some("price")));
        assert!(!schema.exists("flats", None));
        assert!(schema.columns_of("units").contains("floor"));
        assert!(schema.columns_of("flats").is_empty());
        assert_eq!(schema.column_type("transactions", "price"), Some("REAL"));
    }

    #[test]
    fn test_rejects_malformed_metadata() {
        assert!(matches!(
            SchemaSnapshot::new(vec![]),
            Err(PipelineError::SchemaLoad(_))
        ));
        assert!(matches!(
            SchemaSnapshot::new(vec![TableSchema::new("empty")]),
            Err(PipelineError::SchemaLoad(_))
        ));
        let dangling = TableSchema::new("units")
            .column("building_id", "INTEGER")
            .references("building_id", "buildings", "building_id");
        assert!(matches!(
            SchemaSnapshot::new(vec![dangling]),
            Err(PipelineError::SchemaLoad(_))
        ));
    }

    #[test]
    fn test_join_plan_walks_foreign_keys() {
        let schema = housing_snapshot();
        let plan = schema
            .join_plan(&["estates".to_string(), "transactions".to_string()])
            .unwrap();
        let hops: Vec<(&str, &str)> = plan
            .iter()
            .map(|e| (e.left_table.as_str(), e.right_table.as_str()))
            .collect();
        assert_eq!(
            hops,
            vec![
                ("estates", "buildings"),
                ("buildings", "units"),
                ("units", "transactions")
            ]
        );
        assert_eq!(plan[0].left_column, "estate_id");
        assert_eq!(plan[0].right_column, "estate_id");
    }

    #[test]
    fn test_join_plan_unreachable_table() {
        let schema = housing_snapshot();
        assert!(schema
            .join_plan(&["estates".to_string(), "facilities".to_string()])
            .is_none());
    }

    #[test]
    fn test_summary_lists_tables_and_relationships() {
        let summary = housing_snapshot().summary();
        assert!(summary.contains("estates: estate_id (INTEGER), name (TEXT)"));
        assert!(summary.contains("buildings.estate_id -> estates.estate_id"));
    }
}

//! Database connection
//!
//! `Database` is the read-only store the pipeline queries. `SqliteDatabase`
//! backs it with a SQLite file opened in read-only mode; every statement runs
//! on the blocking pool with bound parameters only.

use crate::error::{PipelineError, Result};
use crate::schema::{ColumnInfo, ForeignKey, SchemaSnapshot, TableSchema};
use async_trait::async_trait;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, InterruptHandle, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

/// A bind-parameter value. Literal values never appear in SQL text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Convert a scalar JSON value; arrays and objects have no SQL scalar form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(SqlValue::Null),
            serde_json::Value::Bool(b) => Some(SqlValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(SqlValue::Integer)
                .or_else(|| n.as_f64().map(SqlValue::Real)),
            serde_json::Value::String(s) => Some(SqlValue::Text(s.clone())),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Bool(b) => write!(f, "{}", b),
            SqlValue::Integer(i) => write!(f, "{}", i),
            SqlValue::Real(r) => write!(f, "{}", r),
            SqlValue::Text(s) => write!(f, "'{}'", s),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(SqliteValue::Null),
            SqlValue::Bool(b) => ToSqlOutput::Owned(SqliteValue::Integer(i64::from(*b))),
            SqlValue::Integer(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            SqlValue::Real(r) => ToSqlOutput::Owned(SqliteValue::Real(*r)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// One result row: column name → value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Fully materialized result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    /// Column names in SELECT order
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// More rows existed than the configured cap
    pub truncated: bool,
    pub elapsed_ms: u64,
}

impl RowSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Read table, column and foreign-key metadata.
    async fn load_schema(&self) -> Result<SchemaSnapshot>;

    /// Run one parameterized read-only statement, materializing at most
    /// `max_rows` rows. Dropping the returned future cancels the statement.
    async fn fetch(&self, sql: &str, params: &[SqlValue], max_rows: usize) -> Result<RowSet>;
}

#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    path: PathBuf,
}

impl SqliteDatabase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_read_only(path: &Path) -> rusqlite::Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )
}

/// Interrupts the running statement if dropped before `disarm`.
struct InterruptGuard {
    handle: Option<InterruptHandle>,
}

impl InterruptGuard {
    fn new(handle: InterruptHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Interrupting cancelled SQLite statement");
            handle.interrupt();
        }
    }
}

/// Map driver failures onto the executor's error kinds.
fn classify(err: rusqlite::Error) -> PipelineError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::PermissionDenied
            | ErrorCode::SystemIoFailure
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked => PipelineError::ExecutionConnection(err.to_string()),
            _ => PipelineError::ExecutionRuntime(err.to_string()),
        },
        _ => PipelineError::ExecutionRuntime(err.to_string()),
    }
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(r) => serde_json::Number::from_f64(r)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<{} bytes>", bytes.len())),
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue], max_rows: usize) -> Result<RowSet> {
    let mut stmt = conn.prepare(sql).map_err(classify)?;
    if !stmt.readonly() {
        return Err(PipelineError::ExecutionRuntime(
            "statement is not read-only".to_string(),
        ));
    }
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query(params_from_iter(params.iter())).map_err(classify)?;
    let mut materialized = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next().map_err(classify)? {
        if materialized.len() == max_rows {
            truncated = true;
            break;
        }
        let mut record = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            let value = row.get_ref(idx).map_err(classify)?;
            record.insert(name.clone(), value_to_json(value));
        }
        materialized.push(record);
    }

    Ok(RowSet {
        columns,
        rows: materialized,
        truncated,
        elapsed_ms: 0,
    })
}

fn read_schema(path: &Path) -> Result<SchemaSnapshot> {
    let load_err = |e: rusqlite::Error| PipelineError::SchemaLoad(e.to_string());
    let conn = open_read_only(path).map_err(|e| {
        PipelineError::SchemaLoad(format!("cannot open {}: {}", path.display(), e))
    })?;

    let names: Vec<String> = {
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .map_err(load_err)?;
        let rows = stmt.query_map([], |r| r.get(0)).map_err(load_err)?;
        rows.collect::<rusqlite::Result<_>>().map_err(load_err)?
    };

    let mut tables = Vec::with_capacity(names.len());
    let mut pending_fks: HashMap<String, Vec<(String, String, Option<String>)>> = HashMap::new();

    for name in &names {
        let columns: Vec<ColumnInfo> = {
            let mut stmt = conn
                .prepare("SELECT name, type, pk FROM pragma_table_info(?1) ORDER BY cid")
                .map_err(load_err)?;
            let rows = stmt
                .query_map([name], |r| {
                    Ok(ColumnInfo {
                        name: r.get(0)?,
                        declared_type: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        primary_key: r.get::<_, i64>(2)? > 0,
                    })
                })
                .map_err(load_err)?;
            rows.collect::<rusqlite::Result<_>>().map_err(load_err)?
        };

        let fks: Vec<(String, String, Option<String>)> = {
            let mut stmt = conn
                .prepare(
                    "SELECT \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
                )
                .map_err(load_err)?;
            let rows = stmt
                .query_map([name], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .map_err(load_err)?;
            rows.collect::<rusqlite::Result<_>>().map_err(load_err)?
        };
        pending_fks.insert(name.clone(), fks);

        tables.push(TableSchema {
            name: name.clone(),
            columns,
            foreign_keys: Vec::new(),
        });
    }

    // SQLite accepts foreign keys to missing tables; keep only resolvable ones.
    let column_index: HashMap<String, Vec<ColumnInfo>> = tables
        .iter()
        .map(|t| (t.name.clone(), t.columns.clone()))
        .collect();
    for table in &mut tables {
        for (target, from, to) in pending_fks.remove(&table.name).unwrap_or_default() {
            let Some(target_columns) = column_index.get(&target) else {
                warn!("Skipping foreign key {}.{} -> missing table {}", table.name, from, target);
                continue;
            };
            let target_column = match to {
                Some(column) => Some(column),
                None => {
                    let pks: Vec<&ColumnInfo> = target_columns.iter().filter(|c| c.primary_key).collect();
                    match pks.as_slice() {
                        [single] => Some(single.name.clone()),
                        _ => None,
                    }
                }
            };
            match target_column {
                Some(column) if target_columns.iter().any(|c| c.name == column) => {
                    table.foreign_keys.push(ForeignKey {
                        column: from,
                        references_table: target,
                        references_column: column,
                    });
                }
                _ => warn!("Skipping unresolvable foreign key {}.{} -> {}", table.name, from, target),
            }
        }
    }

    SchemaSnapshot::new(tables)
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn load_schema(&self) -> Result<SchemaSnapshot> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_schema(&path))
            .await
            .map_err(|e| PipelineError::SchemaLoad(format!("schema worker failed: {}", e)))?
    }

    async fn fetch(&self, sql: &str, params: &[SqlValue], max_rows: usize) -> Result<RowSet> {
        let started = Instant::now();
        let conn = open_read_only(&self.path).map_err(classify)?;
        let guard = InterruptGuard::new(conn.get_interrupt_handle());

        let sql = sql.to_string();
        let params = params.to_vec();
        let outcome = tokio::task::spawn_blocking(move || run_query(&conn, &sql, &params, max_rows))
            .await
            .map_err(|e| PipelineError::ExecutionRuntime(format!("query worker failed: {}", e)));
        guard.disarm();

        let mut rowset = outcome??;
        rowset.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(rowset)
    }
}

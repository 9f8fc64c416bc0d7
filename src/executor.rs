//! Query Executor - runs a validated statement under a fixed timeout

use crate::db::{Database, RowSet};
use crate::error::{ErrorDescriptor, PipelineError};
use crate::query_validator::ValidatedQuery;
use serde::Serialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info};

/// Outcome of one execution. Failures are carried, never raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub rows: Option<RowSet>,
    pub error: Option<ErrorDescriptor>,
}

impl ExecutionResult {
    pub fn success(rows: RowSet) -> Self {
        Self {
            success: true,
            rows: Some(rows),
            error: None,
        }
    }

    pub fn failure(error: &PipelineError) -> Self {
        Self {
            success: false,
            rows: None,
            error: Some(error.descriptor()),
        }
    }
}

pub struct Executor {
    timeout: Duration,
    max_rows: usize,
}

impl Executor {
    pub fn new(timeout: Duration, max_rows: usize) -> Self {
        Self { timeout, max_rows }
    }

    /// Run `query` against `connection`. Rows are fully materialized and
    /// capped at `max_rows`; on timeout the in-flight statement is dropped,
    /// which interrupts it on the connection.
    pub async fn execute(&self, query: &ValidatedQuery, connection: &dyn Database) -> ExecutionResult {
        let fetch = connection.fetch(query.sql(), query.params(), self.max_rows);
        match timeout(self.timeout, fetch).await {
            Ok(Ok(rows)) => {
                info!(
                    "Query returned {} rows in {}ms{}",
                    rows.len(),
                    rows.elapsed_ms,
                    if rows.truncated { " (truncated)" } else { "" }
                );
                ExecutionResult::success(rows)
            }
            Ok(Err(e)) => {
                error!("Query execution failed: {}", e);
                ExecutionResult::failure(&e)
            }
            Err(_) => {
                let e = PipelineError::ExecutionTimeout(self.timeout);
                error!("{}", e);
                ExecutionResult::failure(&e)
            }
        }
    }
}

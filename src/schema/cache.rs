//! Process-wide schema cache
//!
//! Readers take an `Arc<SchemaSnapshot>` handle and keep it for the whole
//! pipeline run. `refresh()` builds a complete new snapshot first and only
//! then swaps the pointer, so a reader sees either the old or the new
//! metadata, never a mix.

use super::SchemaSnapshot;
use crate::db::Database;
use crate::error::Result;
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

pub struct SchemaCache {
    source: Arc<dyn Database>,
    current: RwLock<Arc<SchemaSnapshot>>,
}

impl SchemaCache {
    /// Load metadata from `connection`; fails with `SchemaLoad` if the store
    /// is unreachable or returns malformed metadata.
    pub async fn load(connection: Arc<dyn Database>) -> Result<Self> {
        let snapshot = connection.load_schema().await?;
        info!(
            "Loaded schema for {} tables",
            snapshot.table_names().count()
        );
        Ok(Self {
            source: connection,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Wrap an already built snapshot (refresh still reads from `source`).
    pub fn with_snapshot(source: Arc<dyn Database>, snapshot: SchemaSnapshot) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Immutable handle to the current snapshot.
    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Re-read metadata and atomically replace the held snapshot. On failure
    /// the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<SchemaSnapshot>> {
        let fresh = match self.source.load_schema().await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                warn!("Schema refresh failed, keeping previous snapshot: {}", e);
                return Err(e);
            }
        };
        {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            *guard = Arc::clone(&fresh);
        }
        info!("Schema refreshed: {} tables", fresh.table_names().count());
        Ok(fresh)
    }

    pub fn exists(&self, table: &str, column: Option<&str>) -> bool {
        self.snapshot().exists(table, column)
    }

    pub fn columns_of(&self, table: &str) -> BTreeSet<String> {
        self.snapshot().columns_of(table)
    }
}

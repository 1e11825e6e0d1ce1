//! In-memory mirror for tests and standalone runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{stamp_updated_dt, unseen_rows, MirrorError, Result, SummaryMirror};
use crate::snapshot::{Table, Value};

/// Tables held in a map, keyed by name.
#[derive(Default)]
pub struct MemoryMirror {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current content of a table.
    pub async fn table(&self, name: &str) -> Option<Table> {
        self.tables.read().await.get(name).cloned()
    }

    /// Install a table as-is, e.g. legacy data or enriched follower rows.
    pub async fn put_table(&self, name: &str, table: Table) {
        self.tables.write().await.insert(name.to_string(), table);
    }
}

#[async_trait]
impl SummaryMirror for MemoryMirror {
    async fn replace(&self, table: &str, data: &Table) -> Result<usize> {
        let stamped = stamp_updated_dt(data, Utc::now().naive_utc())?;
        self.tables.write().await.insert(table.to_string(), stamped);
        Ok(data.len())
    }

    async fn seed(&self, table: &str, data: &Table, key_columns: &[&str]) -> Result<usize> {
        let stamped = stamp_updated_dt(data, Utc::now().naive_utc())?;
        let mut tables = self.tables.write().await;
        let current = tables
            .entry(table.to_string())
            .or_insert_with(|| Table::new(stamped.columns().to_vec()));

        let mut existing: HashMap<String, HashSet<String>> = HashMap::new();
        for name in key_columns {
            let values = current
                .iter()
                .map(|row| row.get(name))
                .filter(|v| !v.is_null())
                .map(Value::to_string)
                .collect();
            existing.insert(name.to_string(), values);
        }

        let fresh = unseen_rows(table, &stamped, key_columns, &existing)?;
        // Align by column name; the stored table may have a different layout.
        let layout = current.columns().to_vec();
        for row in fresh.iter() {
            let aligned = layout.iter().map(|c| row.get(&c.name).clone()).collect();
            current.push_row(aligned)?;
        }
        Ok(fresh.len())
    }

    async fn legacy_transactions(&self, table: &str) -> Result<Table> {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .ok_or_else(|| MirrorError::TableNotFound(table.to_string()))
    }
}

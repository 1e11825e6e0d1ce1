//! Unified SQL SummaryMirror implementation.
//!
//! Uses a macro to generate implementations for each SQL backend,
//! eliminating code duplication while maintaining type safety.

use std::marker::PhantomData;

use super::SqlDatabase;

/// SQL-based implementation of SummaryMirror.
///
/// This generic implementation works with any SQL database that implements
/// the `SqlDatabase` trait (PostgreSQL, SQLite).
pub struct SqlMirror<DB: SqlDatabase> {
    pool: DB::Pool,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlMirror<DB> {
    /// Create a new SQL mirror with the given pool.
    pub fn new(pool: DB::Pool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &DB::Pool {
        &self.pool
    }
}

/// Macro to implement SummaryMirror for a specific SQL backend.
macro_rules! impl_summary_mirror {
    ($db_type:ty, $feature:literal) => {
        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::mirror::SummaryMirror for SqlMirror<$db_type> {
            async fn replace(
                &self,
                table: &str,
                data: &crate::snapshot::Table,
            ) -> crate::mirror::Result<usize> {
                use super::query::{create_table, delete_all, insert_rows};

                let stamped =
                    crate::mirror::stamp_updated_dt(data, chrono::Utc::now().naive_utc())?;

                let ddl = <$db_type>::build_create_table(create_table(table, &stamped));
                let delete = <$db_type>::build_delete(delete_all(table));
                // Statements are rendered up front: sea-query builders are not Send.
                let inserts: Vec<String> = insert_rows(table, &stamped)?
                    .into_iter()
                    .map(<$db_type>::build_insert)
                    .collect();

                let mut tx = self.pool.begin().await?;
                sqlx::query(&ddl).execute(&mut *tx).await?;
                sqlx::query(&delete).execute(&mut *tx).await?;
                for sql in &inserts {
                    sqlx::query(sql).execute(&mut *tx).await?;
                }
                tx.commit().await?;

                tracing::debug!(table = %table, rows = data.len(), "Replaced mirror table");
                Ok(data.len())
            }

            async fn seed(
                &self,
                table: &str,
                data: &crate::snapshot::Table,
                key_columns: &[&str],
            ) -> crate::mirror::Result<usize> {
                use std::collections::{HashMap, HashSet};

                use sea_query::{Alias, Query};
                use sqlx::Row;

                use super::query::{create_table, insert_rows};

                let stamped =
                    crate::mirror::stamp_updated_dt(data, chrono::Utc::now().naive_utc())?;

                let ddl = <$db_type>::build_create_table(create_table(table, &stamped));
                let select = <$db_type>::build_select(
                    Query::select()
                        .columns(key_columns.iter().map(|c| Alias::new(*c)))
                        .from(Alias::new(table))
                        .to_owned(),
                );

                let mut tx = self.pool.begin().await?;
                sqlx::query(&ddl).execute(&mut *tx).await?;
                let rows = sqlx::query(&select).fetch_all(&mut *tx).await?;

                let mut existing: HashMap<String, HashSet<String>> = HashMap::new();
                for row in &rows {
                    for (i, name) in key_columns.iter().enumerate() {
                        if let Some(value) = row.try_get::<Option<String>, _>(i)? {
                            existing.entry(name.to_string()).or_default().insert(value);
                        }
                    }
                }

                let fresh = crate::mirror::unseen_rows(table, &stamped, key_columns, &existing)?;
                let inserts: Vec<String> = insert_rows(table, &fresh)?
                    .into_iter()
                    .map(<$db_type>::build_insert)
                    .collect();
                for sql in &inserts {
                    sqlx::query(sql).execute(&mut *tx).await?;
                }
                tx.commit().await?;

                tracing::debug!(table = %table, inserted = fresh.len(), "Seeded mirror table");
                Ok(fresh.len())
            }

            async fn legacy_transactions(
                &self,
                table: &str,
            ) -> crate::mirror::Result<crate::snapshot::Table> {
                use sqlx::Row;

                use crate::mirror::LEGACY_COLUMNS;
                use crate::snapshot::{Column, Table, Value};

                let sql = <$db_type>::build_select(super::query::select_as_text(
                    table,
                    &LEGACY_COLUMNS,
                ));
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

                let mut legacy = Table::new(LEGACY_COLUMNS.iter().map(|c| Column::text(c)).collect());
                for row in &rows {
                    let values = (0..LEGACY_COLUMNS.len())
                        .map(|i| {
                            row.try_get::<Option<String>, _>(i)
                                .map(|v| v.map_or(Value::Null, Value::Text))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    legacy.push_row(values)?;
                }
                Ok(legacy)
            }
        }
    };
}

impl_summary_mirror!(super::postgres::Postgres, "postgres");
impl_summary_mirror!(super::sqlite::Sqlite, "sqlite");

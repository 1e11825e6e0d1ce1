//! SQL database abstraction trait and statement builders.

use sea_query::{
    Alias, ColumnDef, Expr, InsertStatement, Query, SelectStatement, SimpleExpr, Table as DdlTable,
    TableCreateStatement,
};

use crate::mirror::{MirrorError, Result};
use crate::snapshot::{ColumnType, Table, Value};

/// Rows per INSERT statement.
const INSERT_CHUNK: usize = 500;

/// Trait for SQL database backends.
///
/// This trait abstracts over different SQL databases (PostgreSQL, SQLite)
/// by providing the pool type and query building methods.
pub trait SqlDatabase: Send + Sync + 'static {
    /// The connection pool type for this database.
    type Pool: Clone + Send + Sync;

    /// Build a SQL query string from a sea-query SELECT statement.
    fn build_select(stmt: SelectStatement) -> String;

    /// Build a SQL query string from a sea-query INSERT statement.
    fn build_insert(stmt: InsertStatement) -> String;

    /// Build a SQL query string from a sea-query DELETE statement.
    fn build_delete(stmt: sea_query::DeleteStatement) -> String;

    /// Build a SQL DDL string from a sea-query CREATE TABLE statement.
    fn build_create_table(stmt: TableCreateStatement) -> String;
}

/// `CREATE TABLE IF NOT EXISTS` with one nullable column per table column.
pub(crate) fn create_table(name: &str, data: &Table) -> TableCreateStatement {
    let mut stmt = DdlTable::create();
    stmt.table(Alias::new(name)).if_not_exists();
    for column in data.columns() {
        let mut def = ColumnDef::new(Alias::new(column.name.as_str()));
        match column.kind {
            ColumnType::Text => def.text(),
            ColumnType::Bool => def.boolean(),
            ColumnType::Int => def.big_integer(),
            ColumnType::Float => def.double(),
            ColumnType::Date => def.date(),
            ColumnType::Timestamp => def.timestamp(),
        };
        def.null();
        stmt.col(&mut def);
    }
    stmt.to_owned()
}

/// `DELETE FROM {name}` without a filter.
pub(crate) fn delete_all(name: &str) -> sea_query::DeleteStatement {
    Query::delete().from_table(Alias::new(name)).to_owned()
}

/// Multi-row INSERTs for every row of `data`, in chunks.
pub(crate) fn insert_rows(name: &str, data: &Table) -> Result<Vec<InsertStatement>> {
    let columns: Vec<Alias> = data
        .columns()
        .iter()
        .map(|c| Alias::new(c.name.as_str()))
        .collect();

    data.rows()
        .chunks(INSERT_CHUNK)
        .map(|chunk| {
            let mut stmt = Query::insert();
            stmt.into_table(Alias::new(name)).columns(columns.clone());
            for row in chunk {
                let exprs = row
                    .iter()
                    .zip(data.columns())
                    .map(|(value, column)| SimpleExpr::Value(sql_value(value, column.kind)));
                stmt.values(exprs)
                    .map_err(|e| MirrorError::Query(e.to_string()))?;
            }
            Ok(stmt.to_owned())
        })
        .collect()
}

/// `SELECT CAST(c AS TEXT) AS c, ...` for the given columns.
pub(crate) fn select_as_text(name: &str, columns: &[&str]) -> SelectStatement {
    let mut stmt = Query::select();
    for column in columns {
        stmt.expr_as(
            Expr::col(Alias::new(*column)).cast_as(Alias::new("TEXT")),
            Alias::new(*column),
        );
    }
    stmt.from(Alias::new(name)).to_owned()
}

/// Typed SQL value; nulls carry the column type so inlined literals stay typed.
fn sql_value(value: &Value, kind: ColumnType) -> sea_query::Value {
    match value {
        Value::Null => match kind {
            ColumnType::Text => sea_query::Value::String(None),
            ColumnType::Bool => sea_query::Value::Bool(None),
            ColumnType::Int => sea_query::Value::BigInt(None),
            ColumnType::Float => sea_query::Value::Double(None),
            ColumnType::Date => sea_query::Value::ChronoDate(None),
            ColumnType::Timestamp => sea_query::Value::ChronoDateTime(None),
        },
        Value::Text(s) => s.clone().into(),
        Value::Bool(b) => (*b).into(),
        Value::Int(i) => (*i).into(),
        Value::Float(x) => (*x).into(),
        Value::Date(d) => (*d).into(),
        Value::Timestamp(t) => (*t).into(),
    }
}

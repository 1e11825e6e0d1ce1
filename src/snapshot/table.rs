//! In-memory table: the unit that is encoded into one snapshot file.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};

use super::SnapshotError;

/// Column storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Bool,
    Int,
    Float,
    Date,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn bool(name: &str) -> Self {
        Self::new(name, ColumnType::Bool)
    }

    pub fn int(name: &str) -> Self {
        Self::new(name, ColumnType::Int)
    }

    pub fn float(name: &str) -> Self {
        Self::new(name, ColumnType::Float)
    }

    pub fn date(name: &str) -> Self {
        Self::new(name, ColumnType::Date)
    }

    pub fn timestamp(name: &str) -> Self {
        Self::new(name, ColumnType::Timestamp)
    }
}

/// A single cell. Every column is nullable.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value may be stored in a column of `kind`.
    pub fn fits(&self, kind: ColumnType) -> bool {
        matches!(
            (self, kind),
            (Value::Null, _)
                | (Value::Text(_), ColumnType::Text)
                | (Value::Bool(_), ColumnType::Bool)
                | (Value::Int(_), ColumnType::Int)
                | (Value::Float(_), ColumnType::Float)
                | (Value::Date(_), ColumnType::Date)
                | (Value::Timestamp(_), ColumnType::Timestamp)
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Date(d) => write!(f, "{}", d),
            Value::Timestamp(t) => write!(f, "{}", t),
        }
    }
}

impl From<Option<String>> for Value {
    fn from(v: Option<String>) -> Self {
        v.map_or(Value::Null, Value::Text)
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Self {
        v.map_or(Value::Null, Value::Int)
    }
}

impl From<Option<f64>> for Value {
    fn from(v: Option<f64>) -> Self {
        v.map_or(Value::Null, Value::Float)
    }
}

impl From<Option<NaiveDate>> for Value {
    fn from(v: Option<NaiveDate>) -> Self {
        v.map_or(Value::Null, Value::Date)
    }
}

impl From<Option<NaiveDateTime>> for Value {
    fn from(v: Option<NaiveDateTime>) -> Self {
        v.map_or(Value::Null, Value::Timestamp)
    }
}

/// Rows plus schema plus free-form key/value metadata.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
    metadata: BTreeMap<String, String>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Append a row, checking arity and cell types.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), SnapshotError> {
        if row.len() != self.columns.len() {
            return Err(SnapshotError::Schema(format!(
                "row has {} values, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        if let Some((column, value)) = self
            .columns
            .iter()
            .zip(&row)
            .find(|(column, value)| !value.fits(column.kind))
        {
            return Err(SnapshotError::Schema(format!(
                "column {} ({:?}) cannot hold {:?}",
                column.name, column.kind, value
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Borrow row `index` with by-name access.
    pub fn row(&self, index: usize) -> Option<RowRef<'_>> {
        self.rows.get(index).map(|values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().map(move |values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    /// Build a table from typed records.
    pub fn from_records<R: Record>(records: &[R]) -> Result<Self, SnapshotError> {
        let mut table = Table::new(R::schema());
        for record in records {
            table.push_row(record.to_row())?;
        }
        Ok(table)
    }

    /// Decode every row as a typed record.
    pub fn to_records<R: Record>(&self) -> Result<Vec<R>, SnapshotError> {
        self.iter().map(|row| R::from_row(&row)).collect()
    }
}

static NULL: Value = Value::Null;

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [Column],
    values: &'a [Value],
}

impl<'a> RowRef<'a> {
    /// Cell by column name. Absent columns read as null so older snapshots
    /// stay readable after a column is added.
    pub fn get(&self, name: &str) -> &'a Value {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .and_then(|i| self.values.get(i))
            .unwrap_or(&NULL)
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    pub fn text(&self, name: &str) -> Result<Option<String>, SnapshotError> {
        match self.get(name) {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s.clone())),
            other => Err(mismatch(name, "text", other)),
        }
    }

    pub fn int(&self, name: &str) -> Result<Option<i64>, SnapshotError> {
        match self.get(name) {
            Value::Null => Ok(None),
            Value::Int(i) => Ok(Some(*i)),
            Value::Text(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| mismatch(name, "integer", &Value::Text(s.clone()))),
            other => Err(mismatch(name, "integer", other)),
        }
    }

    pub fn float(&self, name: &str) -> Result<Option<f64>, SnapshotError> {
        match self.get(name) {
            Value::Null => Ok(None),
            Value::Float(x) => Ok(Some(*x)),
            Value::Int(i) => Ok(Some(*i as f64)),
            other => Err(mismatch(name, "float", other)),
        }
    }

    pub fn date(&self, name: &str) -> Result<Option<NaiveDate>, SnapshotError> {
        match self.get(name) {
            Value::Null => Ok(None),
            Value::Date(d) => Ok(Some(*d)),
            Value::Timestamp(t) => Ok(Some(t.date())),
            other => Err(mismatch(name, "date", other)),
        }
    }

    pub fn timestamp(&self, name: &str) -> Result<Option<NaiveDateTime>, SnapshotError> {
        match self.get(name) {
            Value::Null => Ok(None),
            Value::Timestamp(t) => Ok(Some(*t)),
            Value::Date(d) => Ok(d.and_hms_opt(0, 0, 0)),
            other => Err(mismatch(name, "timestamp", other)),
        }
    }
}

fn mismatch(column: &str, expected: &str, found: &Value) -> SnapshotError {
    SnapshotError::Schema(format!(
        "column {}: expected {}, found {:?}",
        column, expected, found
    ))
}

/// A typed row that round-trips through a [`Table`].
pub trait Record: Sized {
    fn schema() -> Vec<Column>;
    fn to_row(&self) -> Vec<Value>;
    fn from_row(row: &RowRef<'_>) -> Result<Self, SnapshotError>;
}

//! Parquet encoding for [`Table`].
//!
//! Column mapping:
//!
//! | ColumnType | Arrow type |
//! |---|---|
//! | Text | Utf8 |
//! | Bool | Boolean |
//! | Int | Int64 |
//! | Float | Float64 |
//! | Date | Date32 |
//! | Timestamp | Timestamp(Microsecond) |
//!
//! Table metadata is stored as Parquet key/value metadata. Files written by
//! other tools are accepted as long as their columns map onto these types.

use std::sync::Arc;

use arrow_array::builder::{
    BooleanBuilder, Date32Builder, Float64Builder, Int64Builder, StringBuilder,
    TimestampMicrosecondBuilder,
};
use arrow_array::cast::AsArray;
use arrow_array::types::{
    Date32Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType,
};
use arrow_array::{Array, ArrayRef, RecordBatch};
use arrow_schema::{ArrowError, DataType, Field, Schema, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;

use super::table::{Column, ColumnType, Table, Value};

/// Metadata key the Arrow writer reserves for its own schema.
const ARROW_SCHEMA_KEY: &str = "ARROW:schema";

/// Days between 0001-01-01 (CE day 1) and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Unsupported column {column}: {data_type}")]
    UnsupportedType { column: String, data_type: DataType },

    #[error("Value out of range in column {0}")]
    OutOfRange(String),
}

fn arrow_type(kind: ColumnType) -> DataType {
    match kind {
        ColumnType::Text => DataType::Utf8,
        ColumnType::Bool => DataType::Boolean,
        ColumnType::Int => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Date => DataType::Date32,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
    }
}

fn column_type(field: &Field) -> Result<ColumnType, CodecError> {
    match field.data_type() {
        DataType::Utf8 | DataType::LargeUtf8 => Ok(ColumnType::Text),
        DataType::Boolean => Ok(ColumnType::Bool),
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
            Ok(ColumnType::Int)
        }
        DataType::Float32 | DataType::Float64 => Ok(ColumnType::Float),
        DataType::Date32 => Ok(ColumnType::Date),
        DataType::Timestamp(_, _) => Ok(ColumnType::Timestamp),
        other => Err(CodecError::UnsupportedType {
            column: field.name().clone(),
            data_type: other.clone(),
        }),
    }
}

fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

fn build_array(table: &Table, index: usize) -> Result<ArrayRef, CodecError> {
    let column = &table.columns()[index];
    let cells = table.rows().iter().map(|row| &row[index]);

    let array: ArrayRef = match column.kind {
        ColumnType::Text => {
            let mut builder = StringBuilder::new();
            for cell in cells {
                match cell {
                    Value::Text(s) => builder.append_value(s),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Bool => {
            let mut builder = BooleanBuilder::new();
            for cell in cells {
                match cell {
                    Value::Bool(b) => builder.append_value(*b),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Int => {
            let mut builder = Int64Builder::new();
            for cell in cells {
                match cell {
                    Value::Int(i) => builder.append_value(*i),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Float => {
            let mut builder = Float64Builder::new();
            for cell in cells {
                match cell {
                    Value::Float(x) => builder.append_value(*x),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Date => {
            let mut builder = Date32Builder::new();
            for cell in cells {
                match cell {
                    Value::Date(d) => builder.append_value(date_to_days(*d)),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Timestamp => {
            let mut builder = TimestampMicrosecondBuilder::new();
            for cell in cells {
                match cell {
                    Value::Timestamp(t) => {
                        builder.append_value(t.and_utc().timestamp_micros())
                    }
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
    };
    Ok(array)
}

/// Encode a table as a single Parquet file.
pub fn encode(table: &Table) -> Result<Bytes, CodecError> {
    let fields: Vec<Field> = table
        .columns()
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c.kind), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let arrays = (0..table.columns().len())
        .map(|i| build_array(table, i))
        .collect::<Result<Vec<_>, _>>()?;
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let key_values: Vec<KeyValue> = table
        .metadata()
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect();
    let props = WriterProperties::builder()
        .set_key_value_metadata(Some(key_values))
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(Bytes::from(buffer))
}

/// Convert a count of `1 / per_second` units since the epoch.
fn from_unix(value: i64, per_second: i64) -> Option<NaiveDateTime> {
    let secs = value.div_euclid(per_second);
    let nanos = value.rem_euclid(per_second) * (1_000_000_000 / per_second);
    DateTime::<Utc>::from_timestamp(secs, nanos as u32).map(|dt| dt.naive_utc())
}

fn read_cell(array: &dyn Array, row: usize, column: &Column) -> Result<Value, CodecError> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    let out_of_range = || CodecError::OutOfRange(column.name.clone());

    let value = match array.data_type() {
        DataType::Utf8 => Value::Text(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => Value::Text(array.as_string::<i64>().value(row).to_string()),
        DataType::Boolean => Value::Bool(array.as_boolean().value(row)),
        DataType::Int8 => Value::Int(array.as_primitive::<Int8Type>().value(row) as i64),
        DataType::Int16 => Value::Int(array.as_primitive::<Int16Type>().value(row) as i64),
        DataType::Int32 => Value::Int(array.as_primitive::<Int32Type>().value(row) as i64),
        DataType::Int64 => Value::Int(array.as_primitive::<Int64Type>().value(row)),
        DataType::Float32 => Value::Float(array.as_primitive::<Float32Type>().value(row) as f64),
        DataType::Float64 => Value::Float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Date32 => Value::Date(
            days_to_date(array.as_primitive::<Date32Type>().value(row)).ok_or_else(out_of_range)?,
        ),
        DataType::Timestamp(unit, _) => {
            let naive = match unit {
                TimeUnit::Second => from_unix(
                    array.as_primitive::<TimestampSecondType>().value(row),
                    1,
                ),
                TimeUnit::Millisecond => from_unix(
                    array.as_primitive::<TimestampMillisecondType>().value(row),
                    1_000,
                ),
                TimeUnit::Microsecond => from_unix(
                    array.as_primitive::<TimestampMicrosecondType>().value(row),
                    1_000_000,
                ),
                TimeUnit::Nanosecond => from_unix(
                    array.as_primitive::<TimestampNanosecondType>().value(row),
                    1_000_000_000,
                ),
            };
            Value::Timestamp(naive.ok_or_else(out_of_range)?)
        }
        other => {
            return Err(CodecError::UnsupportedType {
                column: column.name.clone(),
                data_type: other.clone(),
            })
        }
    };
    Ok(value)
}

/// Decode a Parquet file into a table.
pub fn decode(data: Bytes) -> Result<Table, CodecError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;

    let columns = builder
        .schema()
        .fields()
        .iter()
        .map(|f| column_type(f).map(|kind| Column::new(f.name().clone(), kind)))
        .collect::<Result<Vec<_>, _>>()?;

    let metadata: Vec<(String, String)> = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .map(|kvs| {
            kvs.iter()
                .filter(|kv| kv.key != ARROW_SCHEMA_KEY)
                .filter_map(|kv| kv.value.clone().map(|v| (kv.key.clone(), v)))
                .collect()
        })
        .unwrap_or_default();

    let mut table = Table::new(columns.clone());
    for (key, value) in metadata {
        table.set_metadata(key, value);
    }

    let reader = builder.build()?;
    for batch in reader {
        let batch = batch?;
        for row in 0..batch.num_rows() {
            let values = batch
                .columns()
                .iter()
                .zip(&columns)
                .map(|(array, column)| read_cell(array.as_ref(), row, column))
                .collect::<Result<Vec<_>, _>>()?;
            table
                .push_row(values)
                .map_err(|_| CodecError::OutOfRange(format!("row {}", row)))?;
        }
    }

    Ok(table)
}

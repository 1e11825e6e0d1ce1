//! The transaction record as replicated into snapshots.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as Json};

use super::id::TransactionId;
use super::message::MessageError;
use crate::snapshot::{Column, Record, RowRef, SnapshotError, Value};

/// Every field of a transaction except its id.
///
/// Serialized names are the wire names. All keys are always serialized,
/// including nulls, which is what lets [`Transaction::apply_changes`] tell
/// known fields from unknown ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionFields {
    pub transaction_channel: String,
    #[serde(deserialize_with = "lenient_date")]
    pub transaction_dt: NaiveDate,
    #[serde(default)]
    pub model_product: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub kuantitas: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub price_product: Option<i64>,
    #[serde(default)]
    pub no_hp_cust: Option<String>,
    #[serde(default)]
    pub name_cust: Option<String>,
    #[serde(default)]
    pub city_cust: Option<String>,
    #[serde(default)]
    pub prov_cust: Option<String>,
    #[serde(default)]
    pub address_cust: Option<String>,
    #[serde(default)]
    pub instagram_cust: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_dt: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_dt: Option<NaiveDateTime>,
}

impl TransactionFields {
    /// Minimal fields for a transaction on `date` through `channel`.
    pub fn new(channel: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            transaction_channel: channel.into(),
            transaction_dt: date,
            model_product: None,
            kuantitas: None,
            price_product: None,
            no_hp_cust: None,
            name_cust: None,
            city_cust: None,
            prov_cust: None,
            address_cust: None,
            instagram_cust: None,
            created_by: None,
            created_dt: None,
            updated_by: None,
            updated_dt: None,
        }
    }
}

/// One row of a tenant's transaction snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    #[serde(flatten)]
    pub fields: TransactionFields,
}

impl Transaction {
    pub fn new(transaction_id: TransactionId, fields: TransactionFields) -> Self {
        Self {
            transaction_id,
            fields,
        }
    }

    /// Overlay a sparse field map onto this record.
    ///
    /// The id is left untouched; callers decide whether the new date or
    /// channel requires a rename.
    pub fn apply_changes(&mut self, changes: &Map<String, Json>) -> Result<(), MessageError> {
        let mut current = match serde_json::to_value(&self.fields)? {
            Json::Object(map) => map,
            _ => return Err(MessageError::InvalidValue("fields are not an object".into())),
        };

        for (name, value) in changes {
            if name == "transaction_id" {
                return Err(MessageError::ImmutableField(name.clone()));
            }
            match current.get_mut(name) {
                Some(slot) => *slot = value.clone(),
                None => return Err(MessageError::UnknownField(name.clone())),
            }
        }

        self.fields = serde_json::from_value(Json::Object(current))
            .map_err(|e| MessageError::InvalidValue(e.to_string()))?;
        Ok(())
    }
}

impl Record for Transaction {
    fn schema() -> Vec<Column> {
        vec![
            Column::text("transaction_id"),
            Column::text("transaction_channel"),
            Column::date("transaction_dt"),
            Column::text("model_product"),
            Column::int("kuantitas"),
            Column::int("price_product"),
            Column::text("no_hp_cust"),
            Column::text("name_cust"),
            Column::text("city_cust"),
            Column::text("prov_cust"),
            Column::text("address_cust"),
            Column::text("instagram_cust"),
            Column::text("created_by"),
            Column::timestamp("created_dt"),
            Column::text("updated_by"),
            Column::timestamp("updated_dt"),
        ]
    }

    fn to_row(&self) -> Vec<Value> {
        let f = &self.fields;
        vec![
            Value::Text(self.transaction_id.as_str().to_string()),
            Value::Text(f.transaction_channel.clone()),
            Value::Date(f.transaction_dt),
            f.model_product.clone().into(),
            f.kuantitas.into(),
            f.price_product.into(),
            f.no_hp_cust.clone().into(),
            f.name_cust.clone().into(),
            f.city_cust.clone().into(),
            f.prov_cust.clone().into(),
            f.address_cust.clone().into(),
            f.instagram_cust.clone().into(),
            f.created_by.clone().into(),
            f.created_dt.into(),
            f.updated_by.clone().into(),
            f.updated_dt.into(),
        ]
    }

    fn from_row(row: &RowRef<'_>) -> Result<Self, SnapshotError> {
        let required = |name: &str| SnapshotError::Schema(format!("{} is null", name));
        Ok(Self {
            transaction_id: TransactionId::new(
                row.text("transaction_id")?
                    .ok_or_else(|| required("transaction_id"))?,
            ),
            fields: TransactionFields {
                transaction_channel: row
                    .text("transaction_channel")?
                    .ok_or_else(|| required("transaction_channel"))?,
                transaction_dt: row
                    .date("transaction_dt")?
                    .ok_or_else(|| required("transaction_dt"))?,
                model_product: row.text("model_product")?,
                kuantitas: row.int("kuantitas")?,
                price_product: row.int("price_product")?,
                no_hp_cust: row.text("no_hp_cust")?,
                name_cust: row.text("name_cust")?,
                city_cust: row.text("city_cust")?,
                prov_cust: row.text("prov_cust")?,
                address_cust: row.text("address_cust")?,
                instagram_cust: row.text("instagram_cust")?,
                created_by: row.text("created_by")?,
                created_dt: row.timestamp("created_dt")?,
                updated_by: row.text("updated_by")?,
                updated_dt: row.timestamp("updated_dt")?,
            },
        })
    }
}

// ============================================================================
// Lenient wire parsing
// ============================================================================

/// Integer from a JSON number or a numeric string. Blank strings are null.
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Json>::deserialize(deserializer)? {
        None | Some(Json::Null) => Ok(None),
        Some(Json::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|x| x.fract() == 0.0).map(|x| x as i64))
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("{} is not an integer", n))),
        Some(Json::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Json::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("'{}' is not an integer", s))),
        Some(other) => Err(D::Error::custom(format!("expected integer, found {}", other))),
    }
}

fn lenient_date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw = String::deserialize(deserializer)?;
    parse_date(&raw).ok_or_else(|| D::Error::custom(format!("'{}' is not a date", raw)))
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("'{}' is not a timestamp", raw))),
    }
}

/// `YYYY-MM-DD`, or the date part of any accepted timestamp.
pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(raw).map(|t| t.date()))
}

/// `YYYY-MM-DD HH:MM:SS`, ISO-8601 (with or without offset), or a bare date
/// at midnight.
pub(crate) fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    const FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|t| t.naive_utc()))
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

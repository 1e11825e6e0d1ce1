//! The eleven summary computations.
//!
//! Every job is a pure function of the staged rows (and, for the engagement
//! summary, the chat log). Grouping follows SQL: a null key component forms
//! its own group, and explicit orderings put nulls last.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, NaiveDate, NaiveDateTime};

use super::staging::SalesRow;
use crate::model::parse_timestamp;
use crate::snapshot::{Column, SnapshotError, Table, Value};

/// Snapshot key stem of the external chat log.
pub const CHAT_TABLE: &str = "tb_chat_wa";

/// One summary dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Summary {
    Transaksi,
    AverageSales,
    Customer,
    CustomerFollower,
    Model,
    Region,
    SalesTrend,
    SalesTrendPertanggal,
    Store,
    TopProduk,
    Wa,
}

impl Summary {
    pub const ALL: [Summary; 11] = [
        Summary::Transaksi,
        Summary::AverageSales,
        Summary::Customer,
        Summary::CustomerFollower,
        Summary::Model,
        Summary::Region,
        Summary::SalesTrend,
        Summary::SalesTrendPertanggal,
        Summary::Store,
        Summary::TopProduk,
        Summary::Wa,
    ];

    /// Relational table name, also the snapshot key stem.
    pub fn table_name(self) -> &'static str {
        match self {
            Summary::Transaksi => "tb_sum_transaksi",
            Summary::AverageSales => "tb_sum_average_sales",
            Summary::Customer => "tb_sum_customer",
            Summary::CustomerFollower => "tb_sum_customer_follower",
            Summary::Model => "tb_sum_model",
            Summary::Region => "tb_sum_region",
            Summary::SalesTrend => "tb_sum_sales_trend",
            Summary::SalesTrendPertanggal => "tb_sum_sales_trend_pertanggal",
            Summary::Store => "tb_sum_store",
            Summary::TopProduk => "tb_sum_top_produk",
            Summary::Wa => "tb_sum_wa",
        }
    }

    /// Rows in the mirror are only ever added, so externally enriched
    /// columns survive later runs.
    pub fn is_seed_only(self) -> bool {
        self == Summary::CustomerFollower
    }

    /// Columns matched when seeding.
    pub fn seed_keys(self) -> &'static [&'static str] {
        match self {
            Summary::CustomerFollower => &["nama", "instagram"],
            _ => &[],
        }
    }

    pub fn schema(self) -> Vec<Column> {
        match self {
            Summary::Transaksi => vec![
                Column::text("tgl"),
                Column::text("tahun"),
                Column::text("provinsi"),
                Column::text("model"),
                Column::text("store"),
                Column::int("total_harga"),
                Column::int("jumlah"),
                Column::int("kuantitas"),
            ],
            Summary::AverageSales => vec![
                Column::text("tanggal"),
                Column::text("tahun"),
                Column::text("provinsi"),
                Column::text("channel"),
                Column::int("total_harga"),
                Column::int("kuantitas"),
                Column::int("jumlah_transaksi"),
                Column::float("avg_bill"),
                Column::float("avg_basket"),
            ],
            Summary::Customer => vec![
                Column::text("customer"),
                Column::text("tahun"),
                Column::text("provinsi"),
                Column::int("total"),
                Column::int("kuantitas"),
            ],
            Summary::CustomerFollower => vec![
                Column::text("nama"),
                Column::text("instagram"),
                Column::int("follower"),
            ],
            Summary::Model => vec![
                Column::text("model"),
                Column::text("tahun"),
                Column::text("provinsi"),
                Column::int("total"),
                Column::int("kuantitas"),
            ],
            Summary::Region => vec![
                Column::text("provinsi"),
                Column::text("tahun"),
                Column::int("total"),
                Column::int("kuantitas"),
            ],
            Summary::SalesTrend => vec![
                Column::text("bulan"),
                Column::text("tahun"),
                Column::text("provinsi"),
                Column::int("total"),
                Column::int("kuantitas"),
            ],
            Summary::SalesTrendPertanggal => vec![
                Column::date("tgl_transaksi"),
                Column::text("model"),
                Column::text("store"),
                Column::text("provinsi"),
                Column::int("total_harga"),
                Column::int("kuantitas"),
            ],
            Summary::Store => vec![
                Column::date("tgl_transaksi"),
                Column::text("channel"),
                Column::text("tahun"),
                Column::text("provinsi"),
                Column::int("total"),
                Column::int("jumlah"),
                Column::int("kuantitas"),
            ],
            Summary::TopProduk => vec![
                Column::text("produk"),
                Column::text("provinsi"),
                Column::text("store"),
                Column::text("tahun"),
                Column::int("total_harga"),
                Column::int("jumlah"),
                Column::int("kuantitas"),
            ],
            Summary::Wa => vec![
                Column::text("no_hp"),
                Column::text("nama"),
                Column::timestamp("tanggal"),
                Column::text("terakhir_dihubungi"),
            ],
        }
    }
}

/// Compute one summary.
///
/// `chat` is only read by [`Summary::Wa`]; `None` yields zero rows. `now`
/// is the reference time for contact ages.
pub fn compute(
    summary: Summary,
    sales: &[SalesRow],
    chat: Option<&Table>,
    now: NaiveDateTime,
) -> Result<Table, SnapshotError> {
    let rows = match summary {
        Summary::Transaksi => sum_transaksi(sales),
        Summary::AverageSales => sum_average_sales(sales),
        Summary::Customer => sum_customer(sales),
        Summary::CustomerFollower => sum_customer_follower(sales),
        Summary::Model => sum_model(sales),
        Summary::Region => sum_region(sales),
        Summary::SalesTrend => sum_sales_trend(sales),
        Summary::SalesTrendPertanggal => sum_sales_trend_pertanggal(sales),
        Summary::Store => sum_store(sales),
        Summary::TopProduk => sum_top_produk(sales),
        Summary::Wa => match chat {
            Some(chat) => sum_wa(chat, now)?,
            None => Vec::new(),
        },
    };

    let mut table = Table::new(summary.schema());
    for row in rows {
        table.push_row(row)?;
    }
    Ok(table)
}

// ============================================================================
// Grouping
// ============================================================================

/// Rows sharing one group key.
struct Group<'a> {
    rows: Vec<&'a SalesRow>,
}

impl Group<'_> {
    fn count(&self) -> i64 {
        self.rows.len() as i64
    }

    fn harga(&self) -> i64 {
        self.rows.iter().filter_map(|r| r.harga).sum()
    }

    fn kuantitas(&self) -> i64 {
        self.rows.iter().filter_map(|r| r.kuantitas).sum()
    }

    fn distinct(&self, field: impl Fn(&SalesRow) -> Option<&str>) -> i64 {
        self.rows
            .iter()
            .filter_map(|r| field(*r))
            .collect::<HashSet<_>>()
            .len() as i64
    }

    fn avg_bill(&self) -> f64 {
        let prices: Vec<i64> = self.rows.iter().filter_map(|r| r.harga).collect();
        if prices.is_empty() {
            return 0.0;
        }
        round2(prices.iter().sum::<i64>() as f64 / prices.len() as f64)
    }

    /// Distinct models per transaction, over transactions with a quantity.
    fn avg_basket(&self) -> f64 {
        let baskets: Vec<&SalesRow> = self
            .rows
            .iter()
            .copied()
            .filter(|r| r.kuantitas.is_some())
            .collect();
        if baskets.is_empty() {
            return 0.0;
        }
        let models = baskets
            .iter()
            .filter_map(|r| r.model.as_deref())
            .collect::<HashSet<_>>()
            .len();
        round2(models as f64 / baskets.len() as f64)
    }
}

fn group_by<'a, K: Ord>(
    sales: &'a [SalesRow],
    keep: impl Fn(&SalesRow) -> bool,
    key: impl Fn(&SalesRow) -> K,
) -> Vec<(K, Group<'a>)> {
    let mut groups: BTreeMap<K, Group<'a>> = BTreeMap::new();
    for row in sales.iter().filter(|r| keep(*r)) {
        groups
            .entry(key(row))
            .or_insert_with(|| Group { rows: Vec::new() })
            .rows
            .push(row);
    }
    groups.into_iter().collect()
}

fn nulls_last<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn format_date(date: Option<NaiveDate>, format: &str) -> Option<String> {
    date.map(|d| d.format(format).to_string())
}

fn text(value: &Option<String>) -> Value {
    value.clone().into()
}

// ============================================================================
// Sales summaries
// ============================================================================

fn sum_transaksi(sales: &[SalesRow]) -> Vec<Vec<Value>> {
    group_by(
        sales,
        |r| r.provinsi.is_some() && r.model.is_some(),
        |r| {
            (
                format_date(r.tgl_transaksi, "%Y %m"),
                r.tahun.clone(),
                r.provinsi.clone(),
                r.model.clone(),
                r.store.clone(),
            )
        },
    )
    .into_iter()
    .map(|((tgl, tahun, provinsi, model, store), g)| {
        vec![
            text(&tgl),
            text(&tahun),
            text(&provinsi),
            text(&model),
            text(&store),
            Value::Int(g.harga()),
            Value::Int(g.count()),
            Value::Int(g.kuantitas()),
        ]
    })
    .collect()
}

fn sum_average_sales(sales: &[SalesRow]) -> Vec<Vec<Value>> {
    let mut groups = group_by(
        sales,
        |r| r.provinsi.is_some(),
        |r| {
            (
                format_date(r.tgl_transaksi, "%Y %m"),
                r.tahun.clone(),
                r.provinsi.clone(),
                r.store.clone(),
            )
        },
    );
    groups.sort_by(|a, b| nulls_last(&a.0 .1, &b.0 .1));

    groups
        .into_iter()
        .map(|((tanggal, tahun, provinsi, channel), g)| {
            vec![
                text(&tanggal),
                text(&tahun),
                text(&provinsi),
                text(&channel),
                Value::Int(g.harga()),
                Value::Int(g.kuantitas()),
                Value::Int(g.count()),
                Value::Float(g.avg_bill()),
                Value::Float(g.avg_basket()),
            ]
        })
        .collect()
}

fn sum_customer(sales: &[SalesRow]) -> Vec<Vec<Value>> {
    group_by(
        sales,
        |r| r.nama.is_some() && r.provinsi.is_some(),
        |r| (r.nama.clone(), r.tahun.clone(), r.provinsi.clone()),
    )
    .into_iter()
    .map(|((customer, tahun, provinsi), g)| {
        vec![
            text(&customer),
            text(&tahun),
            text(&provinsi),
            Value::Int(g.harga()),
            Value::Int(g.kuantitas()),
        ]
    })
    .collect()
}

/// Handles that are only digits or carry an `ig:` prefix are not usable.
fn is_followable(instagram: &str) -> bool {
    let all_digits = !instagram.is_empty() && instagram.chars().all(|c| c.is_ascii_digit());
    !all_digits && !instagram.to_lowercase().starts_with("ig:")
}

fn strip_crlf(s: &str) -> String {
    s.replace("\r\n", "")
}

fn sum_customer_follower(sales: &[SalesRow]) -> Vec<Vec<Value>> {
    let mut groups = group_by(
        sales,
        |r| r.nama.is_some() && r.instagram.as_deref().is_some_and(is_followable),
        |r| r.instagram.as_deref().map(|ig| strip_crlf(ig).to_lowercase()),
    )
    .into_iter()
    .map(|(instagram, g)| {
        let nama = g
            .rows
            .iter()
            .filter_map(|r| r.nama.as_deref())
            .map(strip_crlf)
            .min();
        (nama, instagram)
    })
    .collect::<Vec<_>>();
    groups.sort_by(|a, b| nulls_last(&a.0, &b.0));

    groups
        .into_iter()
        .map(|(nama, instagram)| vec![text(&nama), text(&instagram), Value::Null])
        .collect()
}

fn sum_model(sales: &[SalesRow]) -> Vec<Vec<Value>> {
    let mut groups = group_by(
        sales,
        |r| r.nama.is_some() && r.provinsi.is_some(),
        |r| (r.model.clone(), r.tahun.clone(), r.provinsi.clone()),
    );
    groups.sort_by_key(|(_, g)| std::cmp::Reverse(g.distinct(|r| r.nama.as_deref())));

    groups
        .into_iter()
        .map(|((model, tahun, provinsi), g)| {
            vec![
                text(&model),
                text(&tahun),
                text(&provinsi),
                Value::Int(g.distinct(|r| r.nama.as_deref())),
                Value::Int(g.kuantitas()),
            ]
        })
        .collect()
}

fn sum_region(sales: &[SalesRow]) -> Vec<Vec<Value>> {
    let mut groups = group_by(
        sales,
        |r| r.nama.is_some() && r.provinsi.is_some(),
        |r| (r.provinsi.clone(), r.tahun.clone()),
    );
    groups.sort_by_key(|(_, g)| std::cmp::Reverse(g.distinct(|r| r.nama.as_deref())));

    groups
        .into_iter()
        .map(|((provinsi, tahun), g)| {
            vec![
                text(&provinsi),
                text(&tahun),
                Value::Int(g.distinct(|r| r.nama.as_deref())),
                Value::Int(g.kuantitas()),
            ]
        })
        .collect()
}

fn sum_sales_trend(sales: &[SalesRow]) -> Vec<Vec<Value>> {
    let mut groups = group_by(
        sales,
        |r| r.provinsi.is_some(),
        |r| {
            (
                format_date(r.tgl_transaksi, "%Y %B"),
                r.tahun.clone(),
                r.provinsi.clone(),
            )
        },
    );
    groups.sort_by(|a, b| nulls_last(&a.0 .0, &b.0 .0));

    groups
        .into_iter()
        .map(|((bulan, tahun, provinsi), g)| {
            vec![
                text(&bulan),
                text(&tahun),
                text(&provinsi),
                Value::Int(g.harga()),
                Value::Int(g.kuantitas()),
            ]
        })
        .collect()
}

fn sum_sales_trend_pertanggal(sales: &[SalesRow]) -> Vec<Vec<Value>> {
    let mut groups = group_by(
        sales,
        |r| r.provinsi.is_some(),
        |r| {
            (
                r.tgl_transaksi,
                r.model.clone(),
                r.store.clone(),
                r.provinsi.clone(),
            )
        },
    );
    groups.sort_by(|a, b| nulls_last(&a.0 .0, &b.0 .0));

    groups
        .into_iter()
        .map(|((tgl_transaksi, model, store, provinsi), g)| {
            vec![
                tgl_transaksi.into(),
                text(&model),
                text(&store),
                text(&provinsi),
                Value::Int(g.harga()),
                Value::Int(g.kuantitas()),
            ]
        })
        .collect()
}

fn sum_store(sales: &[SalesRow]) -> Vec<Vec<Value>> {
    let mut groups = group_by(
        sales,
        |r| r.provinsi.is_some(),
        |r| {
            (
                r.tgl_transaksi,
                r.store.clone(),
                r.tahun.clone(),
                r.provinsi.clone(),
            )
        },
    );
    groups.sort_by(|a, b| nulls_last(&a.0 .1, &b.0 .1));

    groups
        .into_iter()
        .map(|((tgl_transaksi, channel, tahun, provinsi), g)| {
            vec![
                tgl_transaksi.into(),
                text(&channel),
                text(&tahun),
                text(&provinsi),
                Value::Int(g.harga()),
                Value::Int(g.count()),
                Value::Int(g.kuantitas()),
            ]
        })
        .collect()
}

fn sum_top_produk(sales: &[SalesRow]) -> Vec<Vec<Value>> {
    group_by(
        sales,
        |r| r.model.is_some() && r.provinsi.is_some(),
        |r| {
            (
                r.model.clone(),
                r.provinsi.clone(),
                r.store.clone(),
                r.tahun.clone(),
            )
        },
    )
    .into_iter()
    .map(|((produk, provinsi, store, tahun), g)| {
        vec![
            text(&produk),
            text(&provinsi),
            text(&store),
            text(&tahun),
            Value::Int(g.harga()),
            Value::Int(g.count()),
            Value::Int(g.kuantitas()),
        ]
    })
    .collect()
}

// ============================================================================
// Chat engagement
// ============================================================================

fn sum_wa(chat: &Table, now: NaiveDateTime) -> Result<Vec<Vec<Value>>, SnapshotError> {
    let mut latest: BTreeMap<(Option<String>, Option<String>), NaiveDateTime> = BTreeMap::new();
    for row in chat.iter() {
        let tanggal = match row.get("tanggal") {
            Value::Text(raw) => parse_timestamp(raw),
            _ => row.timestamp("tanggal")?,
        };
        let Some(tanggal) = tanggal else { continue };

        let key = (row.text("no_hp")?, row.text("nama")?);
        latest
            .entry(key)
            .and_modify(|t| *t = (*t).max(tanggal))
            .or_insert(tanggal);
    }

    let mut contacts: Vec<_> = latest.into_iter().collect();
    contacts.sort_by_key(|(_, tanggal)| *tanggal);

    Ok(contacts
        .into_iter()
        .map(|((no_hp, nama), tanggal)| {
            vec![
                text(&no_hp),
                text(&nama),
                Value::Timestamp(tanggal),
                Value::Text(contact_age(tanggal, now)),
            ]
        })
        .collect())
}

/// Calendar distance from `since` to `now` as `"N tahun N bulan N hari"`.
///
/// Zero years and months are omitted; days are always present.
pub fn contact_age(since: NaiveDateTime, now: NaiveDateTime) -> String {
    let (years, months, days) = calendar_age(since, now);
    let mut age = String::new();
    if years > 0 {
        age.push_str(&format!("{} tahun ", years));
    }
    if months > 0 {
        age.push_str(&format!("{} bulan ", months));
    }
    age.push_str(&format!("{} hari", days.max(0)));
    age
}

/// Years, months and days between two instants, borrowing days from the
/// month `since` falls in. A future `since` is zero.
fn calendar_age(since: NaiveDateTime, now: NaiveDateTime) -> (i32, i32, i32) {
    if now <= since {
        return (0, 0, 0);
    }
    let mut years = now.year() - since.year();
    let mut months = now.month() as i32 - since.month() as i32;
    let mut days = now.day() as i32 - since.day() as i32;

    if now.time() < since.time() {
        days -= 1;
    }
    if days < 0 {
        months -= 1;
        days += days_in_month(since.year(), since.month());
    }
    if months < 0 {
        years -= 1;
        months += 12;
    }
    (years, months, days)
}

fn days_in_month(year: i32, month: u32) -> i32 {
    let (year, month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(31, |last| last.day() as i32)
}

#[cfg(test)]
mod tests;

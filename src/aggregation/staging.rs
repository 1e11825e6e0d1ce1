//! Normalization of transactions into the row shape every job consumes.

use std::collections::HashSet;

use chrono::NaiveDate;

use crate::model::{parse_date, Transaction};
use crate::snapshot::{Column, Record, RowRef, SnapshotError, Value};

/// Staged table name, also its snapshot key stem.
pub const STAGED_TABLE: &str = "tb_transaksi";

/// One staged sales row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SalesRow {
    pub id: Option<String>,
    pub tgl_transaksi: Option<NaiveDate>,
    /// Day of month, `%d`.
    pub tanggal: Option<String>,
    /// Abbreviated month name, `%b`.
    pub bulan: Option<String>,
    /// Year, `%Y`.
    pub tahun: Option<String>,
    pub nama: Option<String>,
    pub model: Option<String>,
    pub alamat: Option<String>,
    pub no_telp: Option<String>,
    pub provinsi: Option<String>,
    pub kota_kab: Option<String>,
    pub instagram: Option<String>,
    pub store: Option<String>,
    pub harga: Option<i64>,
    pub kuantitas: Option<i64>,
}

impl SalesRow {
    pub fn from_transaction(tx: &Transaction) -> Self {
        let fields = &tx.fields;
        let mut row = Self {
            id: Some(tx.transaction_id.to_string()),
            nama: fields.name_cust.clone(),
            model: fields.model_product.clone(),
            alamat: fields.address_cust.clone(),
            no_telp: fields.no_hp_cust.clone(),
            provinsi: fields.prov_cust.clone(),
            kota_kab: fields.city_cust.clone(),
            instagram: fields.instagram_cust.as_deref().and_then(normalize_instagram),
            store: Some(fields.transaction_channel.clone()),
            harga: fields.price_product,
            kuantitas: fields.kuantitas,
            ..Self::default()
        };
        row.set_date(Some(fields.transaction_dt));
        row
    }

    /// Row from the legacy relational table, where every column is text.
    pub fn from_legacy(row: &RowRef<'_>) -> Result<Self, SnapshotError> {
        let date = row.text("tgl_transaksi")?.as_deref().and_then(parse_date);
        let mut staged = Self {
            id: row.text("id")?,
            nama: row.text("nama")?,
            model: row.text("model")?,
            alamat: row.text("alamat")?,
            no_telp: row.text("no_telp")?,
            provinsi: row.text("provinsi")?,
            kota_kab: row.text("kota_kab")?,
            instagram: row.text("instagram")?.as_deref().and_then(normalize_instagram),
            store: row.text("store")?,
            harga: row.int("harga")?,
            kuantitas: row.int("kuantitas")?,
            ..Self::default()
        };
        if date.is_some() {
            staged.set_date(date);
        } else {
            // Keep whatever the legacy row stored.
            staged.tanggal = row.text("tanggal")?;
            staged.bulan = row.text("bulan")?;
            staged.tahun = row.text("tahun")?;
        }
        Ok(staged)
    }

    fn set_date(&mut self, date: Option<NaiveDate>) {
        self.tgl_transaksi = date;
        self.tanggal = date.map(|d| d.format("%d").to_string());
        self.bulan = date.map(|d| d.format("%b").to_string());
        self.tahun = date.map(|d| d.format("%Y").to_string());
    }
}

impl Record for SalesRow {
    fn schema() -> Vec<Column> {
        vec![
            Column::text("id"),
            Column::date("tgl_transaksi"),
            Column::text("tanggal"),
            Column::text("bulan"),
            Column::text("tahun"),
            Column::text("nama"),
            Column::text("model"),
            Column::text("alamat"),
            Column::text("no_telp"),
            Column::text("provinsi"),
            Column::text("kota_kab"),
            Column::text("instagram"),
            Column::text("store"),
            Column::int("harga"),
            Column::int("kuantitas"),
        ]
    }

    fn to_row(&self) -> Vec<Value> {
        vec![
            self.id.clone().into(),
            self.tgl_transaksi.into(),
            self.tanggal.clone().into(),
            self.bulan.clone().into(),
            self.tahun.clone().into(),
            self.nama.clone().into(),
            self.model.clone().into(),
            self.alamat.clone().into(),
            self.no_telp.clone().into(),
            self.provinsi.clone().into(),
            self.kota_kab.clone().into(),
            self.instagram.clone().into(),
            self.store.clone().into(),
            self.harga.into(),
            self.kuantitas.into(),
        ]
    }

    fn from_row(row: &RowRef<'_>) -> Result<Self, SnapshotError> {
        Ok(Self {
            id: row.text("id")?,
            tgl_transaksi: row.date("tgl_transaksi")?,
            tanggal: row.text("tanggal")?,
            bulan: row.text("bulan")?,
            tahun: row.text("tahun")?,
            nama: row.text("nama")?,
            model: row.text("model")?,
            alamat: row.text("alamat")?,
            no_telp: row.text("no_telp")?,
            provinsi: row.text("provinsi")?,
            kota_kab: row.text("kota_kab")?,
            instagram: row.text("instagram")?,
            store: row.text("store")?,
            harga: row.int("harga")?,
            kuantitas: row.int("kuantitas")?,
        })
    }
}

/// Lowercase, strip leading `:`, space and `@`, and cut at the first space.
///
/// An empty result is treated as no handle.
pub fn normalize_instagram(raw: &str) -> Option<String> {
    let handle = raw
        .trim_start_matches([':', ' ', '@'])
        .split(' ')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    (!handle.is_empty()).then_some(handle)
}

/// Snapshot rows first, then legacy rows whose id is not already staged.
pub fn stage(transactions: &[Transaction], legacy: &[SalesRow]) -> Vec<SalesRow> {
    let mut staged: Vec<SalesRow> = transactions.iter().map(SalesRow::from_transaction).collect();
    let mut seen: HashSet<String> = staged.iter().filter_map(|r| r.id.clone()).collect();

    for row in legacy {
        match &row.id {
            Some(id) if !seen.insert(id.clone()) => continue,
            _ => staged.push(row.clone()),
        }
    }
    staged
}

use super::*;
use std::collections::HashMap;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
    date(y, m, d).and_hms_opt(h, 0, 0).unwrap()
}

fn sale(
    nama: Option<&str>,
    provinsi: Option<&str>,
    model: Option<&str>,
    harga: Option<i64>,
    kuantitas: Option<i64>,
) -> SalesRow {
    let d = date(2025, 1, 7);
    SalesRow {
        id: None,
        tgl_transaksi: Some(d),
        tanggal: Some("07".to_string()),
        bulan: Some("Jan".to_string()),
        tahun: Some("2025".to_string()),
        nama: nama.map(String::from),
        model: model.map(String::from),
        provinsi: provinsi.map(String::from),
        store: Some("online".to_string()),
        harga,
        kuantitas,
        ..SalesRow::default()
    }
}

fn sample() -> Vec<SalesRow> {
    vec![
        sale(Some("Ani"), Some("Jawa Barat"), Some("Kemeja"), Some(100), Some(2)),
        sale(Some("Ani"), Some("Jawa Barat"), Some("Celana"), Some(50), None),
        sale(Some("Budi"), Some("Jawa Barat"), Some("Kemeja"), None, Some(1)),
        sale(Some("Citra"), Some("Bali"), Some("Kemeja"), Some(70), Some(4)),
        sale(None, Some("Bali"), None, Some(30), Some(1)),
        sale(Some("Dodi"), None, Some("Kemeja"), Some(999), Some(9)),
    ]
}

fn run(summary: Summary, sales: &[SalesRow]) -> Table {
    compute(summary, sales, None, at(2025, 2, 1, 0)).unwrap()
}

/// Column values of every row, by name.
fn column(table: &Table, name: &str) -> Vec<Value> {
    table.iter().map(|r| r.get(name).clone()).collect()
}

// ============================================================================
// Catalogue
// ============================================================================

#[test]
fn test_every_summary_has_distinct_table() {
    let names: HashSet<_> = Summary::ALL.iter().map(|s| s.table_name()).collect();
    assert_eq!(names.len(), 11);
}

#[test]
fn test_only_follower_is_seed_only() {
    let seeded: Vec<_> = Summary::ALL.iter().filter(|s| s.is_seed_only()).collect();
    assert_eq!(seeded, vec![&Summary::CustomerFollower]);
    assert_eq!(Summary::CustomerFollower.seed_keys(), &["nama", "instagram"]);
}

#[test]
fn test_zero_transactions_give_zero_rows() {
    for summary in Summary::ALL {
        let table = run(summary, &[]);
        assert!(table.is_empty(), "{} not empty", summary.table_name());
        assert_eq!(table.columns(), summary.schema().as_slice());
    }
}

// ============================================================================
// Sales summaries
// ============================================================================

#[test]
fn test_sums_match_naive_group_by() {
    let sales = sample();
    let table = run(Summary::Customer, &sales);

    let mut expected: HashMap<(String, String), (i64, i64)> = HashMap::new();
    for row in sales.iter().filter(|r| r.nama.is_some() && r.provinsi.is_some()) {
        let entry = expected
            .entry((row.nama.clone().unwrap(), row.provinsi.clone().unwrap()))
            .or_default();
        entry.0 += row.harga.unwrap_or(0);
        entry.1 += row.kuantitas.unwrap_or(0);
    }

    assert_eq!(table.len(), expected.len());
    for row in table.iter() {
        let key = (
            row.text("customer").unwrap().unwrap(),
            row.text("provinsi").unwrap().unwrap(),
        );
        let total = row.int("total").unwrap().unwrap();
        let kuantitas = row.int("kuantitas").unwrap().unwrap();
        assert_eq!(expected[&key], (total, kuantitas));
    }
}

#[test]
fn test_transaksi_groups_by_month_and_model() {
    let table = run(Summary::Transaksi, &sample());

    // Rows without provinsi or model are filtered out.
    assert_eq!(table.len(), 3);
    let kemeja_jabar = table
        .iter()
        .find(|r| {
            r.text("model").unwrap().as_deref() == Some("Kemeja")
                && r.text("provinsi").unwrap().as_deref() == Some("Jawa Barat")
        })
        .unwrap();
    assert_eq!(kemeja_jabar.text("tgl").unwrap().as_deref(), Some("2025 01"));
    assert_eq!(kemeja_jabar.int("total_harga").unwrap(), Some(100));
    assert_eq!(kemeja_jabar.int("jumlah").unwrap(), Some(2));
    assert_eq!(kemeja_jabar.int("kuantitas").unwrap(), Some(3));
}

#[test]
fn test_null_sums_are_zero() {
    let sales = vec![sale(Some("Ani"), Some("Bali"), Some("Kemeja"), None, None)];
    let table = run(Summary::TopProduk, &sales);
    assert_eq!(table.row(0).unwrap().int("total_harga").unwrap(), Some(0));
    assert_eq!(table.row(0).unwrap().int("kuantitas").unwrap(), Some(0));
}

#[test]
fn test_average_sales_single_null_quantity() {
    let sales = vec![sale(Some("Ani"), Some("Bali"), Some("Kemeja"), Some(10), None)];
    let table = run(Summary::AverageSales, &sales);

    let row = table.row(0).unwrap();
    assert_eq!(row.int("kuantitas").unwrap(), Some(0));
    assert_eq!(row.int("jumlah_transaksi").unwrap(), Some(1));
    assert_eq!(row.float("avg_bill").unwrap(), Some(10.0));
    assert_eq!(row.float("avg_basket").unwrap(), Some(0.0));
}

#[test]
fn test_average_basket_skips_rows_without_quantity() {
    let sales = vec![
        sale(Some("Ani"), Some("Bali"), Some("Kemeja"), Some(10), Some(1)),
        sale(Some("Budi"), Some("Bali"), Some("Celana"), Some(10), None),
    ];
    let table = run(Summary::AverageSales, &sales);

    let row = table.row(0).unwrap();
    assert_eq!(row.int("jumlah_transaksi").unwrap(), Some(2));
    assert_eq!(row.float("avg_basket").unwrap(), Some(1.0));
}

#[test]
fn test_average_sales_rounds_to_two_decimals() {
    let sales = vec![
        sale(Some("Ani"), Some("Bali"), Some("Kemeja"), Some(10), Some(1)),
        sale(Some("Budi"), Some("Bali"), Some("Kemeja"), Some(10), Some(1)),
        sale(Some("Citra"), Some("Bali"), Some("Celana"), Some(11), Some(1)),
    ];
    let table = run(Summary::AverageSales, &sales);

    let row = table.row(0).unwrap();
    assert_eq!(row.text("tanggal").unwrap().as_deref(), Some("2025 01"));
    assert_eq!(row.text("channel").unwrap().as_deref(), Some("online"));
    assert_eq!(row.float("avg_bill").unwrap(), Some(10.33));
    assert_eq!(row.float("avg_basket").unwrap(), Some(0.67));
    assert!(!row.float("avg_bill").unwrap().unwrap().is_nan());
}

#[test]
fn test_model_and_region_order_by_distinct_customers() {
    let sales = sample();

    let model = run(Summary::Model, &sales);
    let totals: Vec<_> = column(&model, "total");
    assert_eq!(totals.first(), Some(&Value::Int(2)));
    assert!(totals.windows(2).all(|w| match (&w[0], &w[1]) {
        (Value::Int(a), Value::Int(b)) => a >= b,
        _ => false,
    }));

    let region = run(Summary::Region, &sales);
    assert_eq!(
        column(&region, "provinsi"),
        vec![Value::Text("Jawa Barat".into()), Value::Text("Bali".into())]
    );
    assert_eq!(column(&region, "total"), vec![Value::Int(2), Value::Int(1)]);
}

#[test]
fn test_sales_trend_uses_full_month_name() {
    let table = run(Summary::SalesTrend, &sample());
    assert!(column(&table, "bulan")
        .iter()
        .all(|v| *v == Value::Text("2025 January".into())));
}

#[test]
fn test_store_and_pertanggal_keep_dates() {
    let mut sales = sample();
    sales[0].tgl_transaksi = Some(date(2025, 1, 9));
    sales[0].store = Some("offline".to_string());

    let store = run(Summary::Store, &sales);
    assert_eq!(
        column(&store, "channel").first(),
        Some(&Value::Text("offline".into()))
    );

    let trend = run(Summary::SalesTrendPertanggal, &sales);
    assert_eq!(
        column(&trend, "tgl_transaksi").last(),
        Some(&Value::Date(date(2025, 1, 9)))
    );
}

// ============================================================================
// Customer followers
// ============================================================================

#[test]
fn test_follower_filters_unusable_handles() {
    let mut sales = vec![
        sale(Some("Ani"), None, None, None, None),
        sale(Some("Budi"), None, None, None, None),
        sale(Some("Citra"), None, None, None, None),
        sale(Some("Dodi"), None, None, None, None),
        sale(Some("Eka"), None, None, None, None),
    ];
    sales[0].instagram = Some("ani.shop".to_string());
    sales[1].instagram = Some("08123".to_string());
    sales[2].instagram = Some("ig:citra".to_string());
    sales[3].instagram = None;
    sales[4].instagram = Some("eka\r\n".to_string());

    let table = run(Summary::CustomerFollower, &sales);

    assert_eq!(
        column(&table, "instagram"),
        vec![Value::Text("ani.shop".into()), Value::Text("eka".into())]
    );
    assert_eq!(column(&table, "follower"), vec![Value::Null, Value::Null]);
}

#[test]
fn test_follower_takes_min_name_and_orders_by_it() {
    let mut sales = vec![
        sale(Some("Zaki"), None, None, None, None),
        sale(Some("Bima\r\n"), None, None, None, None),
        sale(Some("Andi"), None, None, None, None),
    ];
    sales[0].instagram = Some("zaki".to_string());
    sales[1].instagram = Some("zaki".to_string());
    sales[2].instagram = Some("andi".to_string());

    let table = run(Summary::CustomerFollower, &sales);

    assert_eq!(
        column(&table, "nama"),
        vec![Value::Text("Andi".into()), Value::Text("Bima".into())]
    );
}

// ============================================================================
// Chat engagement
// ============================================================================

fn chat(rows: &[(&str, &str, Option<NaiveDateTime>)]) -> Table {
    let mut table = Table::new(vec![
        Column::text("id"),
        Column::text("nama"),
        Column::text("no_hp"),
        Column::timestamp("tanggal"),
        Column::bool("is_end_chat"),
        Column::text("status"),
    ]);
    for (i, (nama, no_hp, tanggal)) in rows.iter().enumerate() {
        table
            .push_row(vec![
                Value::Text(i.to_string()),
                Value::Text(nama.to_string()),
                Value::Text(no_hp.to_string()),
                (*tanggal).into(),
                Value::Bool(false),
                Value::Null,
            ])
            .unwrap();
    }
    table
}

#[test]
fn test_wa_keeps_latest_message_per_contact() {
    let log = chat(&[
        ("Ani", "0811", Some(at(2025, 1, 1, 9))),
        ("Ani", "0811", Some(at(2025, 1, 20, 9))),
        ("Budi", "0812", Some(at(2024, 12, 1, 9))),
        ("Citra", "0813", None),
    ]);
    let table = compute(Summary::Wa, &[], Some(&log), at(2025, 2, 1, 12)).unwrap();

    assert_eq!(table.len(), 2);
    assert_eq!(
        column(&table, "nama"),
        vec![Value::Text("Budi".into()), Value::Text("Ani".into())]
    );
    assert_eq!(
        column(&table, "tanggal")[1],
        Value::Timestamp(at(2025, 1, 20, 9))
    );
    assert_eq!(
        column(&table, "terakhir_dihubungi"),
        vec![
            Value::Text("2 bulan 0 hari".into()),
            Value::Text("12 hari".into()),
        ]
    );
}

#[test]
fn test_wa_without_chat_log_is_empty() {
    let table = compute(Summary::Wa, &sample(), None, at(2025, 2, 1, 0)).unwrap();
    assert!(table.is_empty());
}

#[test]
fn test_contact_age_formats() {
    assert_eq!(
        contact_age(at(2024, 1, 15, 10), at(2025, 3, 20, 12)),
        "1 tahun 2 bulan 5 hari"
    );
    assert_eq!(contact_age(at(2025, 3, 20, 10), at(2025, 3, 20, 12)), "0 hari");
    assert_eq!(contact_age(at(2025, 4, 1, 0), at(2025, 3, 20, 12)), "0 hari");
}

#[test]
fn test_contact_age_borrows_from_start_month() {
    assert_eq!(contact_age(at(2025, 1, 31, 0), at(2025, 3, 1, 0)), "1 bulan 1 hari");
    // Time of day not yet reached counts as one day less.
    assert_eq!(contact_age(at(2025, 1, 10, 18), at(2025, 1, 12, 6)), "1 hari");
}

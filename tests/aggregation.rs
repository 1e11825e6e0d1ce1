//! Replicated snapshots feeding the aggregation engine.
//!
//! Run with: cargo test --test aggregation

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tally::aggregation::{AggregationEngine, AggregationScheduler, Summary, STAGED_TABLE};
use tally::bus::{ChannelBus, DeliveryHandler};
use tally::dlq::NoopDeadLetterPublisher;
use tally::mirror::{MemoryMirror, UPDATED_DT_COLUMN};
use tally::model::{NewTransaction, QueueNames, TransactionFields, TransactionId};
use tally::object_store::FilesystemObjectStore;
use tally::replication::{ReplicationConsumer, TransactionPublisher};
use tally::snapshot::{etl_key, SnapshotStore, Table, Value};
use tempfile::TempDir;

struct World {
    _dir: TempDir,
    snapshots: Arc<SnapshotStore>,
    bus: Arc<ChannelBus>,
    consumer: ReplicationConsumer,
    publisher: TransactionPublisher,
    mirror: Arc<MemoryMirror>,
}

async fn world() -> World {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FilesystemObjectStore::new(dir.path()).await.unwrap());
    let snapshots = Arc::new(SnapshotStore::new(store));
    let bus = Arc::new(ChannelBus::new());
    World {
        consumer: ReplicationConsumer::new(snapshots.clone(), Arc::new(NoopDeadLetterPublisher)),
        publisher: TransactionPublisher::new(bus.clone(), QueueNames::default()),
        mirror: Arc::new(MemoryMirror::new()),
        _dir: dir,
        snapshots,
        bus,
    }
}

impl World {
    async fn replicate(&self) {
        let handler: Arc<dyn DeliveryHandler> = Arc::new(self.consumer.clone());
        self.bus
            .drain(&self.consumer.queues().consumed(), handler)
            .await;
    }

    fn engine(&self) -> AggregationEngine {
        let now = NaiveDate::from_ymd_opt(2025, 4, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        AggregationEngine::new(self.snapshots.clone())
            .with_mirror(self.mirror.clone())
            .with_reference_time(now)
    }

    async fn etl(&self, tenant: &str, table: &str) -> Table {
        self.snapshots
            .read(&format!("customer-{}", tenant), &etl_key(table))
            .await
            .unwrap()
    }
}

fn sale(name: &str, province: &str, price: i64, quantity: i64) -> NewTransaction {
    let mut fields = TransactionFields::new("online", NaiveDate::from_ymd_opt(2025, 3, 14).unwrap());
    fields.name_cust = Some(name.to_string());
    fields.prov_cust = Some(province.to_string());
    fields.model_product = Some("Kemeja".to_string());
    fields.price_product = Some(price);
    fields.kuantitas = Some(quantity);
    NewTransaction {
        transaction_id: None,
        fields,
    }
}

/// `(provinsi, total_harga, jumlah, kuantitas)` per tb_sum_transaksi row.
fn transaksi_rows(table: &Table) -> Vec<(String, i64, i64, i64)> {
    table
        .iter()
        .map(|row| {
            (
                row.text("provinsi").unwrap().unwrap(),
                row.int("total_harga").unwrap().unwrap(),
                row.int("jumlah").unwrap().unwrap(),
                row.int("kuantitas").unwrap().unwrap(),
            )
        })
        .collect()
}

// ============================================================================
// Pipeline
// ============================================================================

#[tokio::test]
async fn test_replicated_sales_are_summarized() {
    let w = world().await;
    w.publisher
        .create_batch(
            "acme",
            vec![
                sale("Ani", "Jawa Barat", 100_000, 1),
                sale("Budi", "Jawa Barat", 50_000, 2),
                sale("Citra", "Bali", 70_000, 1),
            ],
        )
        .await
        .unwrap();
    w.replicate().await;

    let report = w.engine().run_all("acme").await;
    assert_eq!(report.staged.as_ref().ok(), Some(&3));
    assert_eq!(report.succeeded(), Summary::ALL.len());
    assert_eq!(report.failed(), 0);

    assert_eq!(w.etl("acme", STAGED_TABLE).await.len(), 3);
    assert_eq!(
        transaksi_rows(&w.etl("acme", "tb_sum_transaksi").await),
        vec![
            ("Bali".to_string(), 70_000, 1, 1),
            ("Jawa Barat".to_string(), 150_000, 2, 3),
        ]
    );

    let mirrored = w.mirror.table("tb_sum_transaksi").await.unwrap();
    assert_eq!(mirrored.len(), 2);
    assert!(mirrored.column_index(UPDATED_DT_COLUMN).is_some());
    assert!(mirrored
        .iter()
        .all(|row| !matches!(row.get(UPDATED_DT_COLUMN), Value::Null)));

    // No chat log was ever written.
    assert!(w.etl("acme", "tb_sum_wa").await.is_empty());
}

#[tokio::test]
async fn test_rerun_reflects_later_changes() {
    let w = world().await;
    w.publisher
        .create_batch(
            "acme",
            vec![
                sale("Ani", "Jawa Barat", 100_000, 1),
                sale("Citra", "Bali", 70_000, 1),
            ],
        )
        .await
        .unwrap();
    w.replicate().await;
    w.engine().run_all("acme").await;

    w.publisher
        .delete("acme", "ops", TransactionId::from("TT0002140325ON"))
        .await
        .unwrap();
    w.replicate().await;
    let report = w.engine().run_all("acme").await;
    assert_eq!(report.failed(), 0);

    assert_eq!(
        transaksi_rows(&w.etl("acme", "tb_sum_transaksi").await),
        vec![("Jawa Barat".to_string(), 100_000, 1, 1)]
    );
    assert_eq!(w.mirror.table("tb_sum_transaksi").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_scheduler_covers_every_tenant() {
    let w = world().await;
    w.publisher
        .create("acme", sale("Ani", "Bali", 10_000, 1))
        .await
        .unwrap();
    w.replicate().await;

    let scheduler = AggregationScheduler::new(
        Arc::new(w.engine()),
        vec!["acme".to_string(), "globex".to_string()],
        Duration::from_secs(3600),
    );
    let reports = scheduler.run_once().await;

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].tenant, "acme");
    assert_eq!(reports[0].failed(), 0);
    // globex never replicated anything.
    assert_eq!(reports[1].tenant, "globex");
    assert_eq!(reports[1].succeeded(), 0);
    assert_eq!(reports[1].failed(), Summary::ALL.len());
}

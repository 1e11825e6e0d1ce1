use super::*;
use crate::dlq::ChannelDeadLetterPublisher;
use crate::model::{CREATE_QUEUE, DELETE_QUEUE, UPDATE_QUEUE};
use crate::object_store::{MemoryObjectStore, ObjectStore};
use bytes::Bytes;
use serde_json::{json, Value as Json};
use tokio::sync::mpsc::UnboundedReceiver;

struct Harness {
    store: Arc<MemoryObjectStore>,
    snapshots: Arc<SnapshotStore>,
    consumer: ReplicationConsumer,
    dead_letters: UnboundedReceiver<DeadLetter>,
}

fn harness(max_deliveries: u32) -> Harness {
    harness_with(ReplicationConfig {
        max_deliveries,
        ..ReplicationConfig::default()
    })
}

fn harness_with(config: ReplicationConfig) -> Harness {
    let store = Arc::new(MemoryObjectStore::new());
    let snapshots = Arc::new(SnapshotStore::new(store.clone()));
    let (dlq, dead_letters) = ChannelDeadLetterPublisher::new();
    let consumer = ReplicationConsumer::with_config(snapshots.clone(), Arc::new(dlq), config);
    Harness {
        store,
        snapshots,
        consumer,
        dead_letters,
    }
}

/// A delivery carrying a fresh producer id.
fn delivery(queue: &str, payload: Json) -> Delivery {
    Delivery {
        message_id: Some(uuid::Uuid::new_v4().to_string()),
        ..anonymous(queue, payload)
    }
}

/// A delivery whose producer set no message id.
fn anonymous(queue: &str, payload: Json) -> Delivery {
    Delivery {
        queue: queue.to_string(),
        message_id: None,
        body: Bytes::from(serde_json::to_vec(&payload).unwrap()),
        redelivered: false,
    }
}

fn update_payload(changes: Json) -> Json {
    json!({
        "transaction_id": "TT0001010125ON",
        "transaction_data": changes,
        "user_group": "acme",
        "username": "ops"
    })
}

fn create_payload(id: Option<&str>) -> Json {
    let mut payload = json!({
        "user_group": "acme",
        "transaction_channel": "online",
        "transaction_dt": "2025-01-01",
        "model_product": "Kemeja",
        "kuantitas": 1,
        "price_product": "100000",
        "name_cust": "Ani",
        "prov_cust": "Jawa Barat"
    });
    if let Some(id) = id {
        payload["transaction_id"] = json!(id);
    }
    payload
}

async fn latest(snapshots: &SnapshotStore) -> TransactionSet {
    let versioned = snapshots
        .read_latest("customer-acme", TRANSACTION_PREFIX)
        .await
        .unwrap();
    TransactionSet::from_table(&versioned.table).unwrap()
}

async fn version_count(store: &MemoryObjectStore) -> usize {
    store
        .list("customer-acme", TRANSACTION_PREFIX)
        .await
        .unwrap()
        .len()
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_create_is_written_intact() {
    let h = harness(5);

    let disposition = h
        .consumer
        .process(delivery(CREATE_QUEUE, create_payload(Some("TT0001010125ON"))))
        .await;

    assert_eq!(disposition, Disposition::Ack);
    let set = latest(&h.snapshots).await;
    let tx = set.get(&"TT0001010125ON".into()).unwrap();
    assert_eq!(tx.fields.price_product, Some(100_000));
    assert_eq!(tx.fields.name_cust.as_deref(), Some("Ani"));
}

#[tokio::test]
async fn test_update_then_delete() {
    let h = harness(5);
    h.consumer
        .process(delivery(CREATE_QUEUE, create_payload(Some("TT0001010125ON"))))
        .await;

    let disposition = h
        .consumer
        .process(delivery(
            UPDATE_QUEUE,
            json!({
                "transaction_id": "TT0001010125ON",
                "transaction_data": {"transaction_dt": "2025-01-02"},
                "user_group": "acme",
                "username": "ops"
            }),
        ))
        .await;
    assert_eq!(disposition, Disposition::Ack);
    let set = latest(&h.snapshots).await;
    assert!(set.get(&"TT0001020125ON".into()).is_some());
    assert!(set.get(&"TT0001010125ON".into()).is_none());

    let disposition = h
        .consumer
        .process(delivery(
            DELETE_QUEUE,
            json!({"transaction_id": "TT0001020125ON", "user_group": "acme", "username": "ops"}),
        ))
        .await;
    assert_eq!(disposition, Disposition::Ack);
    assert!(latest(&h.snapshots).await.transactions().is_empty());
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn test_redelivery_is_skipped() {
    let h = harness(5);
    let first = delivery(CREATE_QUEUE, create_payload(None));
    let mut again = first.clone();
    again.redelivered = true;

    assert_eq!(h.consumer.process(first).await, Disposition::Ack);
    assert_eq!(h.consumer.process(again).await, Disposition::Ack);

    assert_eq!(version_count(&h.store).await, 1);
    assert_eq!(latest(&h.snapshots).await.transactions().len(), 1);
}

#[tokio::test]
async fn test_apply_reports_already_applied() {
    let h = harness(5);
    let op = Operation::decode(
        CREATE_QUEUE,
        &serde_json::to_vec(&create_payload(None)).unwrap(),
        h.consumer.queues(),
    )
    .unwrap();

    let first = h.consumer.apply(Some("m-1"), false, &op).await.unwrap();
    assert!(matches!(first, Outcome::Written { .. }));
    assert_eq!(
        h.consumer.apply(Some("m-1"), true, &op).await.unwrap(),
        Outcome::AlreadyApplied
    );
}

#[tokio::test]
async fn test_identical_create_under_new_message_id_is_unchanged() {
    let h = harness(5);
    let op = Operation::decode(
        CREATE_QUEUE,
        &serde_json::to_vec(&create_payload(Some("TT0001010125ON"))).unwrap(),
        h.consumer.queues(),
    )
    .unwrap();

    h.consumer.apply(Some("m-1"), false, &op).await.unwrap();
    assert_eq!(
        h.consumer.apply(Some("m-2"), false, &op).await.unwrap(),
        Outcome::Unchanged
    );
    assert_eq!(version_count(&h.store).await, 1);
}

#[tokio::test]
async fn test_identical_idless_creates_are_distinct_sales() {
    let h = harness(5);
    let sale = anonymous(CREATE_QUEUE, create_payload(None));

    assert_eq!(h.consumer.process(sale.clone()).await, Disposition::Ack);
    assert_eq!(h.consumer.process(sale).await, Disposition::Ack);

    let set = latest(&h.snapshots).await;
    let ids: Vec<_> = set
        .transactions()
        .iter()
        .map(|t| t.transaction_id.as_str())
        .collect();
    assert_eq!(ids, vec!["TT0001010125ON", "TT0002010125ON"]);
}

#[tokio::test]
async fn test_repeated_idless_update_bodies_apply_in_order() {
    let h = harness(5);
    h.consumer
        .process(delivery(CREATE_QUEUE, create_payload(Some("TT0001010125ON"))))
        .await;

    for kuantitas in [3, 5, 3] {
        let update = anonymous(UPDATE_QUEUE, update_payload(json!({"kuantitas": kuantitas})));
        assert_eq!(h.consumer.process(update).await, Disposition::Ack);
    }

    let set = latest(&h.snapshots).await;
    assert_eq!(set.get(&"TT0001010125ON".into()).unwrap().fields.kuantitas, Some(3));
    assert_eq!(version_count(&h.store).await, 4);
}

#[tokio::test]
async fn test_redelivered_idless_update_writes_nothing() {
    let h = harness(5);
    h.consumer
        .process(delivery(CREATE_QUEUE, create_payload(Some("TT0001010125ON"))))
        .await;
    let update = anonymous(UPDATE_QUEUE, update_payload(json!({"kuantitas": 4})));
    let mut again = update.clone();
    again.redelivered = true;

    assert_eq!(h.consumer.process(update).await, Disposition::Ack);
    assert_eq!(h.consumer.process(again).await, Disposition::Ack);
    assert_eq!(version_count(&h.store).await, 2);
}

#[tokio::test]
async fn test_redelivered_idless_delete_is_acked() {
    let mut h = harness(5);
    h.consumer
        .process(delivery(CREATE_QUEUE, create_payload(Some("TT0001010125ON"))))
        .await;
    let delete = anonymous(
        DELETE_QUEUE,
        json!({"transaction_id": "TT0001010125ON", "user_group": "acme", "username": "ops"}),
    );
    let mut again = delete.clone();
    again.redelivered = true;

    assert_eq!(h.consumer.process(delete).await, Disposition::Ack);
    assert_eq!(h.consumer.process(again).await, Disposition::Ack);
    assert!(h.dead_letters.try_recv().is_err());
    assert!(latest(&h.snapshots).await.transactions().is_empty());
}

// ============================================================================
// Terminal failures
// ============================================================================

#[tokio::test]
async fn test_delete_missing_is_dead_lettered() {
    let mut h = harness(5);
    h.consumer
        .process(delivery(CREATE_QUEUE, create_payload(Some("TT0001010125ON"))))
        .await;

    let disposition = h
        .consumer
        .process(delivery(
            DELETE_QUEUE,
            json!({"transaction_id": "TT0009010125ON", "user_group": "acme", "username": "ops"}),
        ))
        .await;

    assert_eq!(disposition, Disposition::Reject);
    let dead = h.dead_letters.recv().await.unwrap();
    assert_eq!(dead.kind, RejectionKind::NotFound);
    assert_eq!(dead.metadata.get("tenant").map(String::as_str), Some("acme"));
    assert_eq!(version_count(&h.store).await, 1);
    assert_eq!(latest(&h.snapshots).await.transactions().len(), 1);
}

#[tokio::test]
async fn test_update_without_snapshot_is_not_found() {
    let mut h = harness(5);
    let disposition = h
        .consumer
        .process(delivery(
            UPDATE_QUEUE,
            json!({
                "transaction_id": "TT0001010125ON",
                "transaction_data": {"kuantitas": 2},
                "user_group": "acme",
                "username": "ops"
            }),
        ))
        .await;

    assert_eq!(disposition, Disposition::Reject);
    assert_eq!(h.dead_letters.recv().await.unwrap().kind, RejectionKind::NotFound);
}

#[tokio::test]
async fn test_malformed_message_is_dead_lettered() {
    let mut h = harness(5);
    let body = Bytes::from_static(b"{\"user_group\": ");
    let disposition = h
        .consumer
        .process(Delivery {
            queue: CREATE_QUEUE.to_string(),
            message_id: Some("m-bad".to_string()),
            body,
            redelivered: false,
        })
        .await;

    assert_eq!(disposition, Disposition::Reject);
    let dead = h.dead_letters.recv().await.unwrap();
    assert_eq!(dead.kind, RejectionKind::Invalid);
    assert_eq!(dead.payload, "{\"user_group\": ");
}

#[tokio::test]
async fn test_conflicting_create_is_dead_lettered() {
    let mut h = harness(5);
    h.consumer
        .process(delivery(CREATE_QUEUE, create_payload(Some("TT0001010125ON"))))
        .await;

    let mut conflicting = create_payload(Some("TT0001010125ON"));
    conflicting["kuantitas"] = json!(7);
    let disposition = h.consumer.process(delivery(CREATE_QUEUE, conflicting)).await;

    assert_eq!(disposition, Disposition::Reject);
    assert_eq!(h.dead_letters.recv().await.unwrap().kind, RejectionKind::Conflict);
}

// ============================================================================
// Transient failures
// ============================================================================

#[tokio::test]
async fn test_storage_failure_requeues_until_bound() {
    let mut h = harness(3);
    h.store.set_unavailable(true);
    let message = delivery(CREATE_QUEUE, create_payload(None));

    assert_eq!(h.consumer.process(message.clone()).await, Disposition::Requeue);
    assert_eq!(h.consumer.process(message.clone()).await, Disposition::Requeue);
    assert_eq!(h.consumer.process(message).await, Disposition::Reject);

    let dead = h.dead_letters.recv().await.unwrap();
    assert_eq!(dead.kind, RejectionKind::RetriesExhausted);
    assert_eq!(dead.attempts, 3);
}

#[tokio::test]
async fn test_idle_attempt_counters_expire() {
    let h = harness_with(ReplicationConfig {
        max_deliveries: 2,
        attempt_ttl_secs: 0,
        ..ReplicationConfig::default()
    });
    h.store.set_unavailable(true);
    let message = delivery(CREATE_QUEUE, create_payload(None));

    // Every counter is already stale by the next delivery.
    assert_eq!(h.consumer.process(message.clone()).await, Disposition::Requeue);
    assert_eq!(h.consumer.process(message.clone()).await, Disposition::Requeue);
    assert_eq!(h.consumer.attempts.lock().await.len(), 1);

    let other = delivery(CREATE_QUEUE, create_payload(Some("TT0001010125ON")));
    h.consumer.process(other).await;
    assert_eq!(h.consumer.attempts.lock().await.len(), 1);
}

#[tokio::test]
async fn test_recovered_storage_applies_requeued_message() {
    let h = harness(5);
    h.store.set_unavailable(true);
    let message = delivery(CREATE_QUEUE, create_payload(None));

    assert_eq!(h.consumer.process(message.clone()).await, Disposition::Requeue);
    h.store.set_unavailable(false);
    assert_eq!(h.consumer.process(message).await, Disposition::Ack);
    assert_eq!(latest(&h.snapshots).await.transactions().len(), 1);
}

#[tokio::test]
async fn test_failed_dead_letter_publish_requeues() {
    let h = harness(5);
    drop(h.dead_letters);

    let disposition = h
        .consumer
        .process(delivery(
            DELETE_QUEUE,
            json!({"transaction_id": "TT0001010125ON", "user_group": "acme", "username": "ops"}),
        ))
        .await;

    assert_eq!(disposition, Disposition::Requeue);
}

#[tokio::test]
async fn test_unreadable_snapshot_starts_create_from_empty() {
    let h = harness(5);
    h.store.create_bucket("customer-acme").await.unwrap();
    h.store
        .put(
            "customer-acme",
            "TRANSACTION/transaction_00000000000000000000000.parquet",
            Bytes::from_static(b"not parquet"),
        )
        .await
        .unwrap();

    let disposition = h
        .consumer
        .process(delivery(CREATE_QUEUE, create_payload(None)))
        .await;

    assert_eq!(disposition, Disposition::Ack);
    let set = latest(&h.snapshots).await;
    assert_eq!(set.transactions()[0].transaction_id.as_str(), "TT0001010125ON");
}

#[tokio::test]
async fn test_corrupt_snapshot_rejects_update_at_once() {
    let mut h = harness(5);
    h.store.create_bucket("customer-acme").await.unwrap();
    h.store
        .put(
            "customer-acme",
            "TRANSACTION/transaction_00000000000000000000000.parquet",
            Bytes::from_static(b"garbage"),
        )
        .await
        .unwrap();

    let disposition = h
        .consumer
        .process(delivery(UPDATE_QUEUE, update_payload(json!({"kuantitas": 2}))))
        .await;

    assert_eq!(disposition, Disposition::Reject);
    let dead = h.dead_letters.recv().await.unwrap();
    assert_eq!(dead.kind, RejectionKind::Corrupt);
    assert_eq!(dead.attempts, 1);
}

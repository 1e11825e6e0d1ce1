//! tally-replicator: Transaction replication consumer
//!
//! Consumes transaction operations from the message bus and applies them to
//! per-tenant snapshots in object storage, one message at a time.
//!
//! ## Architecture
//! ```text
//! producer --> [transaction queues] --> tally-replicator --> object store
//!                                              |
//!                                              v
//!                                  {queue}.dead-letter
//! ```
//!
//! ## Configuration
//! - TALLY_CONFIG: Path to a YAML config file (optional)
//! - TALLY__MESSAGING__TYPE, TALLY__OBJECT_STORE__TYPE, ...: section overrides
//! - TALLY_LOG: Log filter (default: info)
//!
//! When `compaction.enabled` is set, superseded snapshots of the tenants
//! listed under `compaction.tenants` (or `aggregation.tenants` when that is
//! unset) are retired in the background.

use std::sync::Arc;

use tracing::{error, info};

use tally::bus::init_message_bus;
use tally::config::Config;
use tally::dlq::create_publisher;
use tally::object_store::init_object_store;
use tally::replication::ReplicationConsumer;
use tally::snapshot::{SnapshotCompactor, SnapshotStore};
use tally::utils::bootstrap::{connect_with_retry, init_tracing};
use tally::utils::retry::connection_backoff;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;

    let store = connect_with_retry("object store", connection_backoff(), || {
        init_object_store(&config.object_store)
    })
    .await
    .map_err(|e| e as Box<dyn std::error::Error>)?;
    let bus = connect_with_retry("message bus", connection_backoff(), || {
        init_message_bus(&config.messaging)
    })
    .await
    .map_err(|e| e as Box<dyn std::error::Error>)?;

    let dlq = create_publisher(&config.dlq, bus.clone());
    let snapshots = Arc::new(SnapshotStore::new(store.clone()));
    let consumer = ReplicationConsumer::with_config(snapshots, dlq, config.replication.clone());

    let compactor = config.compaction.enabled.then(|| {
        SnapshotCompactor::from_config(
            store.clone(),
            config.compaction_tenants(),
            &config.compaction,
        )
        .spawn()
    });

    info!(
        queues = ?consumer.queues().consumed(),
        compaction = compactor.is_some(),
        "tally-replicator started"
    );

    let result = tokio::select! {
        result = consumer.run(bus.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    if let Some(handle) = compactor {
        handle.abort();
    }

    if let Err(e) = result {
        error!(error = %e, "Replication consumer stopped");
        return Err(e.into());
    }
    Ok(())
}

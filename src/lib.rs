//! tally - transaction replication and summary aggregation.
//!
//! Producers enqueue transaction operations (create, batch-create, update,
//! delete). The replication consumer applies them, one message at a time, to
//! a per-tenant columnar snapshot kept in object storage. The aggregation
//! engine rebuilds summary tables from the latest snapshot and mirrors them
//! into a relational database.
//!
//! ## Architecture
//!
//! ```text
//! producer ──► MessageBus ──► ReplicationConsumer ──► SnapshotStore
//!                                                         │
//!                        SummaryMirror ◄── AggregationEngine
//! ```
//!
//! ## Modules
//!
//! - [`bus`]: durable queue abstraction (AMQP, in-process channel)
//! - [`dlq`]: dead-letter publishing for messages that cannot be applied
//! - [`object_store`]: raw object I/O (filesystem, S3, memory)
//! - [`snapshot`]: typed columnar snapshots and latest-version resolution
//! - [`model`]: transaction records, identifiers and queue payloads
//! - [`replication`]: the replication consumer and its producer helper
//! - [`aggregation`]: staging, the summary jobs and the scheduler
//! - [`mirror`]: relational summary tables (SQLite, PostgreSQL)

pub mod aggregation;
pub mod bus;
pub mod config;
pub mod dlq;
pub mod mirror;
pub mod model;
pub mod object_store;
pub mod replication;
pub mod snapshot;
pub mod utils;

pub use aggregation::{AggregationEngine, AggregationScheduler, JobOutcome, RunReport};
pub use bus::{Delivery, DeliveryHandler, Disposition, Message, MessageBus};
pub use config::Config;
pub use model::{Operation, Transaction, TransactionFields, TransactionId};
pub use object_store::ObjectStore;
pub use replication::{ReplicationConsumer, ReplicationError, TransactionPublisher};
pub use snapshot::{SnapshotStore, Table};

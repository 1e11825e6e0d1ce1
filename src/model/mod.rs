//! Transaction records and the queue messages that mutate them.

mod id;
mod message;
mod transaction;

pub use id::{IdError, TransactionId};
pub use message::{
    BatchCreate, CreateTransaction, DeleteTransaction, MessageError, NewTransaction, Operation,
    OperationKind, QueueLayout, QueueNames, UpdateTransaction, BATCH_QUEUE, CREATE_QUEUE,
    DELETE_QUEUE, UNIFIED_QUEUE, UPDATE_QUEUE,
};
pub use transaction::{Transaction, TransactionFields};
pub(crate) use transaction::{parse_date, parse_timestamp};

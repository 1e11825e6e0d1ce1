//! Queue payloads.
//!
//! Each verb has its own queue by default. With the unified layout every
//! verb travels through one queue and carries an `"op"` tag, so a create
//! and a later delete of the same record cannot be reordered.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use super::id::{IdError, TransactionId};
use super::transaction::TransactionFields;

pub const CREATE_QUEUE: &str = "transaction_queue";
pub const BATCH_QUEUE: &str = "transaction_batch_queue";
pub const UPDATE_QUEUE: &str = "transaction_update_queue";
pub const DELETE_QUEUE: &str = "transaction_delete_queue";
pub const UNIFIED_QUEUE: &str = "transaction_events";

/// Errors decoding or validating a message.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No operation is routed through queue {0}")]
    UnknownQueue(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Field cannot be changed: {0}")]
    ImmutableField(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Missing {0}")]
    Missing(&'static str),

    #[error(transparent)]
    Id(#[from] IdError),
}

/// Which queues carry which verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueLayout {
    #[default]
    PerVerb,
    Unified,
}

/// Queue names, configurable under `replication.queues`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueNames {
    pub layout: QueueLayout,
    pub create: String,
    pub batch_create: String,
    pub update: String,
    pub delete: String,
    pub unified: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            layout: QueueLayout::default(),
            create: CREATE_QUEUE.to_string(),
            batch_create: BATCH_QUEUE.to_string(),
            update: UPDATE_QUEUE.to_string(),
            delete: DELETE_QUEUE.to_string(),
            unified: UNIFIED_QUEUE.to_string(),
        }
    }
}

impl QueueNames {
    /// Queues the consumer subscribes to.
    pub fn consumed(&self) -> Vec<String> {
        match self.layout {
            QueueLayout::PerVerb => vec![
                self.create.clone(),
                self.batch_create.clone(),
                self.update.clone(),
                self.delete.clone(),
            ],
            QueueLayout::Unified => vec![self.unified.clone()],
        }
    }

    /// Queue a producer should publish `kind` to.
    pub fn queue_for(&self, kind: OperationKind) -> &str {
        match (self.layout, kind) {
            (QueueLayout::Unified, _) => &self.unified,
            (QueueLayout::PerVerb, OperationKind::Create) => &self.create,
            (QueueLayout::PerVerb, OperationKind::BatchCreate) => &self.batch_create,
            (QueueLayout::PerVerb, OperationKind::Update) => &self.update,
            (QueueLayout::PerVerb, OperationKind::Delete) => &self.delete,
        }
    }
}

/// A transaction as submitted by a producer. The id may be left for the
/// consumer to assign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    #[serde(flatten)]
    pub fields: TransactionFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTransaction {
    pub user_group: String,
    #[serde(flatten)]
    pub transaction: NewTransaction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCreate {
    pub user_group: String,
    pub transactions: Vec<NewTransaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateTransaction {
    pub transaction_id: TransactionId,
    pub transaction_data: Map<String, Json>,
    pub user_group: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteTransaction {
    pub transaction_id: TransactionId,
    pub user_group: String,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    BatchCreate,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::BatchCreate => "batch-create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// One decoded queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Operation {
    Create(CreateTransaction),
    BatchCreate(BatchCreate),
    Update(UpdateTransaction),
    Delete(DeleteTransaction),
}

impl Operation {
    /// Decode a body received on `queue`.
    pub fn decode(queue: &str, body: &[u8], queues: &QueueNames) -> Result<Self, MessageError> {
        let op = if queues.layout == QueueLayout::Unified && queue == queues.unified {
            serde_json::from_slice(body)?
        } else if queue == queues.create {
            Operation::Create(serde_json::from_slice(body)?)
        } else if queue == queues.batch_create {
            Operation::BatchCreate(serde_json::from_slice(body)?)
        } else if queue == queues.update {
            Operation::Update(serde_json::from_slice(body)?)
        } else if queue == queues.delete {
            Operation::Delete(serde_json::from_slice(body)?)
        } else {
            return Err(MessageError::UnknownQueue(queue.to_string()));
        };
        op.validate()?;
        Ok(op)
    }

    /// Body to publish for this operation on `layout`.
    pub fn encode(&self, layout: QueueLayout) -> Result<Vec<u8>, MessageError> {
        let body = match (layout, self) {
            (QueueLayout::Unified, op) => serde_json::to_vec(op)?,
            (QueueLayout::PerVerb, Operation::Create(m)) => serde_json::to_vec(m)?,
            (QueueLayout::PerVerb, Operation::BatchCreate(m)) => serde_json::to_vec(m)?,
            (QueueLayout::PerVerb, Operation::Update(m)) => serde_json::to_vec(m)?,
            (QueueLayout::PerVerb, Operation::Delete(m)) => serde_json::to_vec(m)?,
        };
        Ok(body)
    }

    pub fn tenant(&self) -> &str {
        match self {
            Operation::Create(m) => &m.user_group,
            Operation::BatchCreate(m) => &m.user_group,
            Operation::Update(m) => &m.user_group,
            Operation::Delete(m) => &m.user_group,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Create(_) => OperationKind::Create,
            Operation::BatchCreate(_) => OperationKind::BatchCreate,
            Operation::Update(_) => OperationKind::Update,
            Operation::Delete(_) => OperationKind::Delete,
        }
    }

    fn validate(&self) -> Result<(), MessageError> {
        if self.tenant().trim().is_empty() {
            return Err(MessageError::Missing("user_group"));
        }
        match self {
            Operation::BatchCreate(batch) if batch.transactions.is_empty() => {
                Err(MessageError::Missing("transactions"))
            }
            Operation::Update(update) if update.transaction_data.is_empty() => {
                Err(MessageError::Missing("transaction_data"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Json) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_decode_create_without_id() {
        let payload = body(json!({
            "user_group": "acme",
            "transaction_channel": "online",
            "transaction_dt": "2025-01-01",
            "price_product": "10000"
        }));
        let op = Operation::decode(CREATE_QUEUE, &payload, &QueueNames::default()).unwrap();

        match op {
            Operation::Create(create) => {
                assert_eq!(create.user_group, "acme");
                assert!(create.transaction.transaction_id.is_none());
                assert_eq!(create.transaction.fields.price_product, Some(10_000));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_routes_by_queue() {
        let payload = body(json!({
            "transaction_id": "TT0001010125ON",
            "user_group": "acme",
            "username": "ops"
        }));
        let op = Operation::decode(DELETE_QUEUE, &payload, &QueueNames::default()).unwrap();
        assert_eq!(op.kind(), OperationKind::Delete);
        assert_eq!(op.tenant(), "acme");
    }

    #[test]
    fn test_decode_unknown_queue() {
        let result = Operation::decode("other", b"{}", &QueueNames::default());
        assert!(matches!(result, Err(MessageError::UnknownQueue(_))));
    }

    #[test]
    fn test_decode_malformed_json() {
        let result = Operation::decode(CREATE_QUEUE, b"{not json", &QueueNames::default());
        assert!(matches!(result, Err(MessageError::Json(_))));
    }

    #[test]
    fn test_decode_requires_user_group() {
        let payload = body(json!({
            "transaction_id": "TT0001010125ON",
            "user_group": " ",
            "username": "ops"
        }));
        let result = Operation::decode(DELETE_QUEUE, &payload, &QueueNames::default());
        assert!(matches!(result, Err(MessageError::Missing("user_group"))));
    }

    #[test]
    fn test_decode_empty_batch() {
        let payload = body(json!({"user_group": "acme", "transactions": []}));
        let result = Operation::decode(BATCH_QUEUE, &payload, &QueueNames::default());
        assert!(matches!(result, Err(MessageError::Missing("transactions"))));
    }

    #[test]
    fn test_unified_layout_uses_op_tag() {
        let queues = QueueNames {
            layout: QueueLayout::Unified,
            ..QueueNames::default()
        };
        let payload = body(json!({
            "op": "update",
            "transaction_id": "TT0001010125ON",
            "transaction_data": {"kuantitas": 3},
            "user_group": "acme",
            "username": "ops"
        }));
        let op = Operation::decode(UNIFIED_QUEUE, &payload, &queues).unwrap();
        assert_eq!(op.kind(), OperationKind::Update);
        assert_eq!(queues.consumed(), vec![UNIFIED_QUEUE.to_string()]);
    }

    #[test]
    fn test_encode_matches_layout() {
        let op = Operation::Delete(DeleteTransaction {
            transaction_id: "TT0001010125ON".into(),
            user_group: "acme".into(),
            username: "ops".into(),
        });

        let per_verb: Json = serde_json::from_slice(&op.encode(QueueLayout::PerVerb).unwrap()).unwrap();
        assert!(per_verb.get("op").is_none());

        let unified: Json = serde_json::from_slice(&op.encode(QueueLayout::Unified).unwrap()).unwrap();
        assert_eq!(unified["op"], "delete");
    }

    #[test]
    fn test_queue_for() {
        let queues = QueueNames::default();
        assert_eq!(queues.queue_for(OperationKind::BatchCreate), BATCH_QUEUE);
        assert_eq!(queues.consumed().len(), 4);
    }
}

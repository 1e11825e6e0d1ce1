//! Mutations of one tenant's transaction set, independent of storage.

use std::collections::{HashSet, VecDeque};

use chrono::{NaiveDateTime, SubsecRound};
use serde_json::{Map, Value as Json};

use super::ReplicationError;
use crate::model::{IdError, NewTransaction, Transaction, TransactionId};
use crate::snapshot::{SnapshotError, Table};

/// Snapshot metadata key holding the applied-message ledger.
pub const LEDGER_KEY: &str = "tally.applied_messages";

/// Message ids remembered per snapshot.
pub const LEDGER_CAPACITY: usize = 512;

/// Whether an operation changed the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// Every record was already present with identical content.
    Unchanged,
}

/// The decoded content of a transaction snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionSet {
    rows: Vec<Transaction>,
    ledger: VecDeque<String>,
}

impl TransactionSet {
    pub fn new(rows: Vec<Transaction>) -> Self {
        Self {
            rows,
            ledger: VecDeque::new(),
        }
    }

    pub fn from_table(table: &Table) -> Result<Self, SnapshotError> {
        let rows = table.to_records()?;
        let ledger = match table.metadata().get(LEDGER_KEY) {
            Some(raw) => serde_json::from_str::<Vec<String>>(raw)
                .map_err(|e| SnapshotError::Schema(format!("{}: {}", LEDGER_KEY, e)))?
                .into(),
            None => VecDeque::new(),
        };
        Ok(Self { rows, ledger })
    }

    pub fn to_table(&self) -> Result<Table, SnapshotError> {
        let mut table = Table::from_records(&self.rows)?;
        let ledger: Vec<&String> = self.ledger.iter().collect();
        let raw = serde_json::to_string(&ledger)
            .map_err(|e| SnapshotError::Schema(format!("{}: {}", LEDGER_KEY, e)))?;
        table.set_metadata(LEDGER_KEY, raw);
        Ok(table)
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.rows
    }

    pub fn get(&self, id: &TransactionId) -> Option<&Transaction> {
        self.rows.iter().find(|t| &t.transaction_id == id)
    }

    pub fn has_applied(&self, message_id: &str) -> bool {
        self.ledger.iter().any(|id| id == message_id)
    }

    /// Remember a message id, evicting the oldest past capacity.
    pub fn record_applied(&mut self, message_id: &str) {
        if self.has_applied(message_id) {
            return;
        }
        self.ledger.push_back(message_id.to_string());
        while self.ledger.len() > LEDGER_CAPACITY {
            self.ledger.pop_front();
        }
    }

    /// Append one record, assigning the next id when it has none.
    pub fn create(&mut self, new: NewTransaction) -> Result<Applied, ReplicationError> {
        let transaction = match new.transaction_id {
            Some(id) => Transaction::new(id, new.fields),
            None => {
                let sequence = TransactionId::next_sequence(self.rows.iter().map(|t| &t.transaction_id));
                let id = TransactionId::generate(
                    sequence,
                    new.fields.transaction_dt,
                    &new.fields.transaction_channel,
                )?;
                Transaction::new(id, new.fields)
            }
        };

        match self.get(&transaction.transaction_id) {
            Some(existing) if existing == &transaction => Ok(Applied::Unchanged),
            Some(_) => Err(ReplicationError::Conflict(format!(
                "{} exists with different content",
                transaction.transaction_id
            ))),
            None => {
                self.rows.push(transaction);
                Ok(Applied::Changed)
            }
        }
    }

    /// Append every record or none.
    pub fn create_batch(&mut self, batch: Vec<NewTransaction>) -> Result<Applied, ReplicationError> {
        let mut seen = HashSet::new();
        for id in batch.iter().filter_map(|t| t.transaction_id.as_ref()) {
            if !seen.insert(id) {
                return Err(ReplicationError::Validation(format!(
                    "{} appears twice in one batch",
                    id
                )));
            }
        }

        let staged = self.rows.clone();
        let mut changed = false;
        for new in batch {
            match self.create(new) {
                Ok(applied) => changed |= applied == Applied::Changed,
                Err(e) => {
                    self.rows = staged;
                    return Err(e);
                }
            }
        }

        Ok(if changed {
            Applied::Changed
        } else {
            Applied::Unchanged
        })
    }

    /// Overwrite fields of an existing record and stamp who changed it.
    ///
    /// A new date or channel regenerates the id with the same sequence.
    /// Repeating the last update of the same user changes nothing.
    pub fn update(
        &mut self,
        id: &TransactionId,
        changes: &Map<String, Json>,
        username: &str,
        now: NaiveDateTime,
    ) -> Result<Applied, ReplicationError> {
        let index = self
            .rows
            .iter()
            .position(|t| &t.transaction_id == id)
            .ok_or_else(|| ReplicationError::NotFound(id.to_string()))?;

        let mut updated = self.rows[index].clone();
        updated.apply_changes(changes)?;
        if updated == self.rows[index]
            && self.rows[index].fields.updated_by.as_deref() == Some(username)
        {
            return Ok(Applied::Unchanged);
        }
        updated.fields.updated_by = Some(username.to_string());
        updated.fields.updated_dt = Some(now.trunc_subsecs(0));

        let before = &self.rows[index].fields;
        if updated.fields.transaction_dt != before.transaction_dt
            || updated.fields.transaction_channel != before.transaction_channel
        {
            match id.regenerate(
                updated.fields.transaction_dt,
                &updated.fields.transaction_channel,
            ) {
                Ok(renamed) => {
                    if renamed != *id && self.get(&renamed).is_some() {
                        return Err(ReplicationError::Conflict(format!(
                            "renaming {} onto existing {}",
                            id, renamed
                        )));
                    }
                    updated.transaction_id = renamed;
                }
                // Ids minted outside this system have no sequence to keep.
                Err(IdError::Malformed(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.rows[index] = updated;
        Ok(Applied::Changed)
    }

    pub fn delete(&mut self, id: &TransactionId) -> Result<Applied, ReplicationError> {
        let index = self
            .rows
            .iter()
            .position(|t| &t.transaction_id == id)
            .ok_or_else(|| ReplicationError::NotFound(id.to_string()))?;
        self.rows.remove(index);
        Ok(Applied::Changed)
    }
}

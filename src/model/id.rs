//! Transaction identifiers: `TT` + sequence + `ddmmyy` + channel code.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

const PREFIX: &str = "TT";
const MAX_SEQUENCE: u32 = 9999;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("Sequence {0} exceeds {MAX_SEQUENCE}")]
    SequenceExhausted(u32),

    #[error("Channel '{0}' is too short for a channel code")]
    InvalidChannel(String),

    #[error("Malformed transaction id: {0}")]
    Malformed(String),
}

/// A tenant-unique transaction id such as `TT0007210824ON`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Wrap an id as received, without validating its shape.
    ///
    /// Ids produced elsewhere are stored verbatim; only ids this crate
    /// generates are guaranteed to follow the `TT` layout.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build an id from its parts.
    pub fn generate(sequence: u32, date: NaiveDate, channel: &str) -> Result<Self, IdError> {
        if sequence > MAX_SEQUENCE {
            return Err(IdError::SequenceExhausted(sequence));
        }
        let code: String = channel.trim().chars().take(2).collect::<String>().to_uppercase();
        if code.chars().count() < 2 {
            return Err(IdError::InvalidChannel(channel.to_string()));
        }
        Ok(Self(format!(
            "{}{:04}{}{}",
            PREFIX,
            sequence,
            date.format("%d%m%y"),
            code
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 4-digit sequence, or `None` for ids that do not follow the layout.
    pub fn sequence(&self) -> Option<u32> {
        let digits = self.0.strip_prefix(PREFIX)?.get(..4)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Rebuild the id for a new date/channel, keeping the sequence.
    pub fn regenerate(&self, date: NaiveDate, channel: &str) -> Result<Self, IdError> {
        let sequence = self
            .sequence()
            .ok_or_else(|| IdError::Malformed(self.0.clone()))?;
        Self::generate(sequence, date, channel)
    }

    /// Next sequence for a tenant: one past the highest existing, from 1.
    pub fn next_sequence<'a>(ids: impl IntoIterator<Item = &'a TransactionId>) -> u32 {
        ids.into_iter()
            .filter_map(TransactionId::sequence)
            .max()
            .map_or(1, |max| max + 1)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_generate_layout() {
        let id = TransactionId::generate(7, date(2024, 8, 21), "online").unwrap();
        assert_eq!(id.as_str(), "TT0007210824ON");
    }

    #[test]
    fn test_generate_rejects_overflow() {
        let result = TransactionId::generate(10_000, date(2024, 8, 21), "online");
        assert_eq!(result, Err(IdError::SequenceExhausted(10_000)));
    }

    #[test]
    fn test_generate_rejects_short_channel() {
        let result = TransactionId::generate(1, date(2024, 8, 21), "x");
        assert!(matches!(result, Err(IdError::InvalidChannel(_))));
    }

    #[test]
    fn test_sequence_parsing() {
        assert_eq!(TransactionId::from("TT0042010125OF").sequence(), Some(42));
        assert_eq!(TransactionId::from("legacy-17").sequence(), None);
        assert_eq!(TransactionId::from("TT12").sequence(), None);
    }

    #[test]
    fn test_next_sequence() {
        let ids = vec![
            TransactionId::from("TT0003010125ON"),
            TransactionId::from("TT0011020125OF"),
            TransactionId::from("external"),
        ];
        assert_eq!(TransactionId::next_sequence(&ids), 12);
        assert_eq!(TransactionId::next_sequence(&Vec::new()), 1);
    }

    #[test]
    fn test_regenerate_keeps_sequence() {
        let id = TransactionId::from("TT0001010125ON");
        let renamed = id.regenerate(date(2025, 1, 2), "online").unwrap();
        assert_eq!(renamed.as_str(), "TT0001020125ON");
    }

    #[test]
    fn test_regenerate_requires_layout() {
        let id = TransactionId::from("legacy");
        assert!(matches!(
            id.regenerate(date(2025, 1, 2), "online"),
            Err(IdError::Malformed(_))
        ));
    }
}

//! Hash-chained record of registry writes.
//!
//! Each entry commits to the one before it, so rewriting or dropping a past
//! controller change is detectable by replaying the chain.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::registry::RegistryChange;

const GENESIS: [u8; 32] = [0u8; 32];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    pub seq: u64,
    pub change: RegistryChange,
    #[serde(with = "hex_digest")]
    pub prev_digest: [u8; 32],
    #[serde(with = "hex_digest")]
    pub digest: [u8; 32],
}

impl JournalEntry {
    fn compute_digest(seq: u64, change: &RegistryChange, prev_digest: &[u8; 32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"upt-journal-v1");
        hasher.update(seq.to_le_bytes());
        hasher.update(change.caller.as_bytes());
        hasher.update(change.role.as_str().as_bytes());
        hasher.update(change.previous.as_bytes());
        hasher.update(change.holder.as_bytes());
        hasher.update(prev_digest);
        hasher.finalize().into()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JournalError {
    #[error("journal entry {seq} is out of sequence")]
    Sequence { seq: u64 },
    #[error("journal entry {seq} does not link to its predecessor")]
    BrokenLink { seq: u64 },
    #[error("journal entry {seq} digest mismatch")]
    Digest { seq: u64 },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminJournal {
    entries: Vec<JournalEntry>,
}

impl AdminJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> [u8; 32] {
        self.entries.last().map(|e| e.digest).unwrap_or(GENESIS)
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&mut self, change: RegistryChange) -> &JournalEntry {
        let seq = self.entries.len() as u64;
        let prev_digest = self.head();
        let digest = JournalEntry::compute_digest(seq, &change, &prev_digest);
        self.entries.push(JournalEntry {
            seq,
            change,
            prev_digest,
            digest,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn verify(&self) -> Result<(), JournalError> {
        let mut prev = GENESIS;
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.seq != idx as u64 {
                return Err(JournalError::Sequence { seq: entry.seq });
            }
            if entry.prev_digest != prev {
                return Err(JournalError::BrokenLink { seq: entry.seq });
            }
            let expected = JournalEntry::compute_digest(entry.seq, &entry.change, &prev);
            if expected != entry.digest {
                return Err(JournalError::Digest { seq: entry.seq });
            }
            prev = entry.digest;
        }
        Ok(())
    }
}

mod hex_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("digest must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::address::{Address, Role, ADDRESS_LEN};

    fn change(holder: u8) -> RegistryChange {
        RegistryChange {
            caller: Address::from_bytes([1; ADDRESS_LEN]),
            role: Role::Controller,
            previous: Address::ZERO,
            holder: Address::from_bytes([holder; ADDRESS_LEN]),
        }
    }

    #[test]
    fn chain_links_and_verifies() {
        let mut journal = AdminJournal::new();
        assert_eq!(journal.head(), GENESIS);
        let first = journal.record(change(2)).digest;
        let second = journal.record(change(3)).clone();
        assert_eq!(second.prev_digest, first);
        assert_eq!(journal.head(), second.digest);
        journal.verify().unwrap();
    }

    #[test]
    fn rewritten_history_is_detected() {
        let mut journal = AdminJournal::new();
        journal.record(change(2));
        journal.record(change(3));
        journal.entries[0].change.holder = Address::from_bytes([7; ADDRESS_LEN]);
        assert_eq!(journal.verify().unwrap_err(), JournalError::Digest { seq: 0 });
    }

    #[test]
    fn dropped_entry_is_detected() {
        let mut journal = AdminJournal::new();
        journal.record(change(2));
        journal.record(change(3));
        journal.record(change(4));
        journal.entries.remove(1);
        assert_eq!(
            journal.verify().unwrap_err(),
            JournalError::Sequence { seq: 2 }
        );
    }

    #[test]
    fn survives_json_round_trip() {
        let mut journal = AdminJournal::new();
        journal.record(change(2));
        let json = serde_json::to_string(&journal).unwrap();
        let back: AdminJournal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, journal);
        back.verify().unwrap();
    }
}

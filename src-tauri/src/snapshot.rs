//! Persisted snapshot layout.
//!
//! The full record set lives under one key as a JSON array; the ledger and the
//! counters are scalar keys stored as decimal strings. Every mutation loads the
//! whole snapshot and commits the whole snapshot back in one batch.

use std::str::FromStr;

use tracing::warn;

use crate::kv::{KeyValueStore, StorageError};
use crate::ledger::BudgetLedger;
use crate::record::{ApplicationId, ApplicationRecord};

pub const RECORDS_KEY: &str = "bursary_applications";
pub const BUDGET_TOTAL_KEY: &str = "budget_total";
pub const BUDGET_ALLOCATED_KEY: &str = "budget_allocated";
pub const APPLICATION_COUNTER_KEY: &str = "application_counter";
pub const LAST_SERIAL_KEY: &str = "last_serial";

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub records: Vec<ApplicationRecord>,
    pub ledger: Option<BudgetLedger>,
    pub application_counter: u64,
    pub last_serial: u64,
}

pub fn encode_records(records: &[ApplicationRecord]) -> Result<String, serde_json::Error> {
    serde_json::to_string(records)
}

/// A corrupted collection reads as empty; the caller keeps running.
pub fn decode_records(raw: &str) -> Vec<ApplicationRecord> {
    match serde_json::from_str::<Vec<ApplicationRecord>>(raw) {
        Ok(records) => records,
        Err(err) => {
            warn!(key = RECORDS_KEY, %err, "persisted applications unreadable; treating as empty");
            Vec::new()
        }
    }
}

fn read_scalar<T: FromStr>(kv: &dyn KeyValueStore, key: &str) -> Result<Option<T>, StorageError> {
    let Some(raw) = kv.get(key)? else {
        return Ok(None);
    };
    match raw.trim().parse::<T>() {
        Ok(value) => Ok(Some(value)),
        Err(_) => {
            warn!(key, raw = raw.as_str(), "persisted scalar unreadable; ignoring");
            Ok(None)
        }
    }
}

pub fn ledger_entries(ledger: &BudgetLedger) -> [(&'static str, String); 2] {
    [
        (BUDGET_TOTAL_KEY, ledger.total().to_string()),
        (BUDGET_ALLOCATED_KEY, ledger.allocated().to_string()),
    ]
}

impl Snapshot {
    pub fn load(kv: &dyn KeyValueStore) -> Result<Snapshot, StorageError> {
        let records = match kv.get(RECORDS_KEY)? {
            Some(raw) => decode_records(raw.as_str()),
            None => Vec::new(),
        };
        let total = read_scalar::<u64>(kv, BUDGET_TOTAL_KEY)?;
        let allocated = read_scalar::<u64>(kv, BUDGET_ALLOCATED_KEY)?;
        let ledger = match (total, allocated) {
            (Some(total), Some(allocated)) => Some(BudgetLedger::from_parts(total, allocated)),
            (Some(total), None) => Some(BudgetLedger::new(total)),
            _ => None,
        };
        Ok(Snapshot {
            records,
            ledger,
            application_counter: read_scalar(kv, APPLICATION_COUNTER_KEY)?.unwrap_or(0),
            last_serial: read_scalar(kv, LAST_SERIAL_KEY)?.unwrap_or(0),
        })
    }

    pub fn entries(&self) -> Result<Vec<(&'static str, String)>, StorageError> {
        let mut entries = vec![
            (RECORDS_KEY, encode_records(&self.records)?),
            (APPLICATION_COUNTER_KEY, self.application_counter.to_string()),
            (LAST_SERIAL_KEY, self.last_serial.to_string()),
        ];
        if let Some(ledger) = &self.ledger {
            entries.extend(ledger_entries(ledger));
        }
        Ok(entries)
    }

    pub fn commit(&self, kv: &dyn KeyValueStore) -> Result<(), StorageError> {
        kv.set_many(&self.entries()?)
    }

    pub fn position(&self, id: &ApplicationId) -> Option<usize> {
        self.records.iter().position(|record| &record.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    #[test]
    fn empty_store_loads_defaults() {
        let kv = MemoryStore::new();
        let snapshot = Snapshot::load(&kv).expect("load");
        assert!(snapshot.records.is_empty());
        assert_eq!(snapshot.ledger, None);
        assert_eq!(snapshot.application_counter, 0);
        assert_eq!(snapshot.last_serial, 0);
    }

    #[test]
    fn corrupted_keys_fall_back_without_failing() {
        let kv = MemoryStore::new();
        kv.set_many(&[
            (RECORDS_KEY, "[{\"broken\"".to_string()),
            (BUDGET_TOTAL_KEY, "1000".to_string()),
            (BUDGET_ALLOCATED_KEY, "lots".to_string()),
            (APPLICATION_COUNTER_KEY, "17".to_string()),
        ])
        .expect("seed");
        let snapshot = Snapshot::load(&kv).expect("load");
        assert!(snapshot.records.is_empty());
        assert_eq!(snapshot.ledger, Some(BudgetLedger::new(1000)));
        assert_eq!(snapshot.application_counter, 17);
    }

    #[test]
    fn commit_writes_every_key() {
        let kv = MemoryStore::new();
        let snapshot = Snapshot {
            records: Vec::new(),
            ledger: Some(BudgetLedger::from_parts(900, 300)),
            application_counter: 4,
            last_serial: 2,
        };
        snapshot.commit(&kv).expect("commit");
        assert_eq!(kv.get(RECORDS_KEY).expect("get").as_deref(), Some("[]"));
        assert_eq!(kv.get(BUDGET_ALLOCATED_KEY).expect("get").as_deref(), Some("300"));
        assert_eq!(Snapshot::load(&kv).expect("load"), snapshot);
    }
}

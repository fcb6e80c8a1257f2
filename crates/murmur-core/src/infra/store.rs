//! In-memory record store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::{debug, trace};

use super::{InfraError, PutOutcome, RecordStore};
use crate::channel::TableRef;
use crate::message::{Record, RecordKey};

/// Table ARN prefix.
const TABLE_ARN_PREFIX: &str = "arn:murmur:table:";

/// Record store keeping every table in memory.
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: DashMap<TableRef, BTreeMap<RecordKey, Record>>,
}

impl MemoryRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a table, if it exists.
    #[must_use]
    pub fn len(&self, table: &TableRef) -> Option<usize> {
        self.tables.get(table).map(|t| t.len())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_table(&self, name: &str) -> Result<TableRef, InfraError> {
        let table = TableRef::new(format!("{TABLE_ARN_PREFIX}{name}"));
        self.tables.entry(table.clone()).or_insert_with(|| {
            debug!(table = %table, "Created table");
            BTreeMap::new()
        });
        Ok(table)
    }

    async fn delete_table(&self, table: &TableRef) -> Result<(), InfraError> {
        if self.tables.remove(table).is_some() {
            debug!(table = %table, "Deleted table");
        }
        Ok(())
    }

    async fn table_exists(&self, table: &TableRef) -> bool {
        self.tables.contains_key(table)
    }

    async fn put(&self, table: &TableRef, record: Record) -> Result<PutOutcome, InfraError> {
        let mut rows = self
            .tables
            .get_mut(table)
            .ok_or_else(|| InfraError::TableNotFound(table.to_string()))?;

        let outcome = match rows.insert(record.key(), record.clone()) {
            None => PutOutcome::Inserted,
            Some(previous) if previous == record => PutOutcome::Unchanged,
            Some(_) => PutOutcome::Replaced,
        };
        trace!(table = %table, ?outcome, "Put record");
        Ok(outcome)
    }

    async fn get(
        &self,
        table: &TableRef,
        account: u64,
        timestamp: u64,
    ) -> Result<Option<Record>, InfraError> {
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| InfraError::TableNotFound(table.to_string()))?;
        Ok(rows.get(&(account, timestamp)).cloned())
    }

    async fn scan(&self, table: &TableRef) -> Result<Vec<Record>, InfraError> {
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| InfraError::TableNotFound(table.to_string()))?;
        let mut records: Vec<Record> = rows.values().cloned().collect();
        drop(rows);
        records.sort_by_key(|r| (r.timestamp, r.account));
        Ok(records)
    }
}

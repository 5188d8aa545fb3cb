// src/core/store/mod.rs

//! The metadata store abstraction. All core components mutate persistent
//! metadata exclusively through short-lived transactions obtained from
//! [`MetadataStore::begin`]; long remote operations never hold one open.

pub mod entities;
pub mod memory;

use crate::core::errors::FabricError;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OwnedMutexGuard;

/// Rows are schemaless JSON objects; typed entities are serialized through
/// the helpers at the bottom of this module.
pub type Row = serde_json::Value;

/// An RAII guard for a per-group or per-shard advisory lock. The lock is
/// released when the guard is dropped, which covers commit, rollback, and
/// procedure failure alike.
pub struct AdvisoryLockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl AdvisoryLockGuard {
    pub(crate) fn new(guard: OwnedMutexGuard<()>) -> Self {
        Self { _guard: guard }
    }
}

/// Transactional access to the metadata tables. Reads are read-committed;
/// writes are buffered and applied atomically on `commit`, with row-level
/// conflict detection against the versions this transaction observed.
#[async_trait]
pub trait Txn: Send {
    async fn read(&mut self, table: &str, key: &str) -> Result<Option<Row>, FabricError>;

    /// Returns all `(key, row)` pairs of a table in key order.
    async fn scan(&mut self, table: &str) -> Result<Vec<(String, Row)>, FabricError>;

    async fn write(&mut self, table: &str, key: &str, row: Row) -> Result<(), FabricError>;

    async fn delete(&mut self, table: &str, key: &str) -> Result<(), FabricError>;

    async fn commit(self: Box<Self>) -> Result<(), FabricError>;

    async fn rollback(self: Box<Self>) -> Result<(), FabricError>;
}

/// The capability the rest of the core depends on for persistent metadata.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn begin(&self) -> Box<dyn Txn>;

    /// Acquires a named advisory lock. With `wait` the call blocks until the
    /// lock frees up; without it a held lock is reported through `busy`.
    async fn advisory_lock(
        &self,
        key: &str,
        wait: bool,
        busy: FabricError,
    ) -> Result<AdvisoryLockGuard, FabricError>;

    /// Allocates the next value of a named monotonically increasing sequence,
    /// starting at 1.
    fn next_id(&self, sequence: &str) -> u64;
}

/// Reads a typed entity out of a transaction.
pub async fn read_entity<T: DeserializeOwned>(
    txn: &mut dyn Txn,
    table: &str,
    key: &str,
) -> Result<Option<T>, FabricError> {
    match txn.read(table, key).await? {
        Some(row) => Ok(Some(serde_json::from_value(row)?)),
        None => Ok(None),
    }
}

/// Writes a typed entity into a transaction.
pub async fn write_entity<T: Serialize>(
    txn: &mut dyn Txn,
    table: &str,
    key: &str,
    entity: &T,
) -> Result<(), FabricError> {
    txn.write(table, key, serde_json::to_value(entity)?).await
}

/// Reads every row of a table as a typed entity list.
pub async fn scan_entities<T: DeserializeOwned>(
    txn: &mut dyn Txn,
    table: &str,
) -> Result<Vec<T>, FabricError> {
    let mut out = Vec::new();
    for (_, row) in txn.scan(table).await? {
        out.push(serde_json::from_value(row)?);
    }
    Ok(out)
}

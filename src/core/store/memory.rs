// src/core/store/memory.rs

//! The in-memory implementation of [`MetadataStore`]. It provides atomic
//! commits, first-writer-wins conflict detection, named advisory locks, and
//! id sequences. A durable backend would implement the same traits against
//! an embedded or remote database.

use super::{AdvisoryLockGuard, MetadataStore, Row, Txn};
use crate::core::errors::FabricError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone)]
struct VersionedRow {
    version: u64,
    row: Row,
}

type Table = BTreeMap<String, VersionedRow>;

#[derive(Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<String, Table>>>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    sequences: DashMap<String, AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_cell(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn begin(&self) -> Box<dyn Txn> {
        Box::new(MemoryTxn {
            tables: self.tables.clone(),
            observed: HashMap::new(),
            writes: Vec::new(),
        })
    }

    async fn advisory_lock(
        &self,
        key: &str,
        wait: bool,
        busy: FabricError,
    ) -> Result<AdvisoryLockGuard, FabricError> {
        let cell = self.lock_cell(key);
        let guard = if wait {
            cell.lock_owned().await
        } else {
            cell.try_lock_owned().map_err(|_| busy)?
        };
        Ok(AdvisoryLockGuard::new(guard))
    }

    fn next_id(&self, sequence: &str) -> u64 {
        self.sequences
            .entry(sequence.to_string())
            .or_insert_with(|| AtomicU64::new(1))
            .fetch_add(1, Ordering::SeqCst)
    }
}

enum WriteOp {
    Put(String, String, Row),
    Delete(String, String),
}

/// A transaction over the in-memory store. Reads see committed state (plus
/// this transaction's own buffered writes); writes record the row version
/// they observed and commit refuses to clobber a row that moved underneath.
struct MemoryTxn {
    tables: Arc<RwLock<HashMap<String, Table>>>,
    /// `(table, key)` -> version observed when this txn first touched the row
    /// (0 for a row that did not exist).
    observed: HashMap<(String, String), u64>,
    writes: Vec<WriteOp>,
}

impl MemoryTxn {
    fn committed_version(&self, table: &str, key: &str) -> u64 {
        self.tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .map(|v| v.version)
            .unwrap_or(0)
    }

    fn observe(&mut self, table: &str, key: &str) {
        let slot = (table.to_string(), key.to_string());
        if !self.observed.contains_key(&slot) {
            let version = self.committed_version(table, key);
            self.observed.insert(slot, version);
        }
    }

    /// The value this transaction would see for `(table, key)`: the latest
    /// buffered write if any, otherwise the committed row.
    fn pending_value(&self, table: &str, key: &str) -> Option<Option<Row>> {
        self.writes.iter().rev().find_map(|op| match op {
            WriteOp::Put(t, k, row) if t == table && k == key => Some(Some(row.clone())),
            WriteOp::Delete(t, k) if t == table && k == key => Some(None),
            _ => None,
        })
    }
}

#[async_trait]
impl Txn for MemoryTxn {
    async fn read(&mut self, table: &str, key: &str) -> Result<Option<Row>, FabricError> {
        if let Some(pending) = self.pending_value(table, key) {
            return Ok(pending);
        }
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .map(|v| v.row.clone()))
    }

    async fn scan(&mut self, table: &str) -> Result<Vec<(String, Row)>, FabricError> {
        let mut rows: BTreeMap<String, Row> = self
            .tables
            .read()
            .get(table)
            .map(|t| {
                t.iter()
                    .map(|(k, v)| (k.clone(), v.row.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for op in &self.writes {
            match op {
                WriteOp::Put(t, k, row) if t == table => {
                    rows.insert(k.clone(), row.clone());
                }
                WriteOp::Delete(t, k) if t == table => {
                    rows.remove(k);
                }
                _ => {}
            }
        }
        Ok(rows.into_iter().collect())
    }

    async fn write(&mut self, table: &str, key: &str, row: Row) -> Result<(), FabricError> {
        self.observe(table, key);
        self.writes
            .push(WriteOp::Put(table.to_string(), key.to_string(), row));
        Ok(())
    }

    async fn delete(&mut self, table: &str, key: &str) -> Result<(), FabricError> {
        self.observe(table, key);
        self.writes
            .push(WriteOp::Delete(table.to_string(), key.to_string()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), FabricError> {
        let mut tables = self.tables.write();

        // Validate every written row against the version observed at first
        // touch; a concurrent commit in between makes this one lose.
        for ((table, key), observed) in &self.observed {
            let current = tables
                .get(table)
                .and_then(|t| t.get(key))
                .map(|v| v.version)
                .unwrap_or(0);
            if current != *observed {
                return Err(FabricError::TxnConflict(format!("{table}/{key}")));
            }
        }

        for op in self.writes {
            match op {
                WriteOp::Put(table, key, row) => {
                    let t = tables.entry(table).or_default();
                    let version = t.get(&key).map(|v| v.version).unwrap_or(0) + 1;
                    t.insert(key, VersionedRow { version, row });
                }
                WriteOp::Delete(table, key) => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), FabricError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await;
        txn.write("servers", "a", json!({"x": 1})).await.unwrap();

        let mut other = store.begin().await;
        assert_eq!(other.read("servers", "a").await.unwrap(), None);

        txn.commit().await.unwrap();
        let mut after = store.begin().await;
        assert_eq!(
            after.read("servers", "a").await.unwrap(),
            Some(json!({"x": 1}))
        );
    }

    #[tokio::test]
    async fn conflicting_commit_is_rejected() {
        let store = MemoryStore::new();
        let mut seed = store.begin().await;
        seed.write("groups", "g1", json!({"n": 0})).await.unwrap();
        seed.commit().await.unwrap();

        let mut first = store.begin().await;
        first.write("groups", "g1", json!({"n": 1})).await.unwrap();
        let mut second = store.begin().await;
        second.write("groups", "g1", json!({"n": 2})).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, FabricError::TxnConflict(_)));
    }

    #[tokio::test]
    async fn advisory_lock_is_exclusive() {
        let store = MemoryStore::new();
        let held = store
            .advisory_lock("shard/1", false, FabricError::ShardBusy(1))
            .await
            .unwrap();
        let busy = store
            .advisory_lock("shard/1", false, FabricError::ShardBusy(1))
            .await;
        assert!(matches!(busy, Err(FabricError::ShardBusy(1))));
        drop(held);
        assert!(
            store
                .advisory_lock("shard/1", false, FabricError::ShardBusy(1))
                .await
                .is_ok()
        );
    }

    #[test]
    fn sequences_start_at_one() {
        let store = MemoryStore::new();
        assert_eq!(store.next_id("shard_mappings"), 1);
        assert_eq!(store.next_id("shard_mappings"), 2);
        assert_eq!(store.next_id("shards"), 1);
    }
}

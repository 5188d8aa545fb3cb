// src/core/conn/mod.rs

//! The capability seam between the coordination core and concrete database
//! drivers. The core only ever talks to a [`ServerConn`]: typed statements
//! plus the replication controls the group and shard protocols need.
//! Concrete drivers live outside the core; the in-process [`mock`] farm
//! implements the same traits for the test suite and local development.

pub mod mock;

use crate::core::errors::FabricError;
use crate::core::sharding::lookup::{KeyPredicate, ShardingKey};
use crate::core::store::entities::{ServerMode, TableName};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// One row of a sharded or global table: the shard key plus an opaque payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataRow {
    pub key: ShardingKey,
    pub payload: serde_json::Value,
}

/// A typed statement executed on a managed server. This is the shape the
/// external driver contract delivers; SQL rendering is a driver concern.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable {
        table: TableName,
        key_column: String,
    },
    DropTable {
        table: TableName,
    },
    Insert {
        table: TableName,
        row: DataRow,
    },
    /// Bulk restore of a previously dumped row set. Creates the table when
    /// it does not exist, mirroring a logical dump's schema section.
    Load {
        table: TableName,
        rows: Vec<DataRow>,
    },
    Dump {
        table: TableName,
        predicate: KeyPredicate,
    },
    Select {
        table: TableName,
        predicate: KeyPredicate,
    },
    Count {
        table: TableName,
    },
    DeleteWhere {
        table: TableName,
        predicate: KeyPredicate,
    },
}

impl Statement {
    /// Whether the statement mutates server state and therefore replicates.
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Statement::Dump { .. } | Statement::Select { .. } | Statement::Count { .. }
        )
    }
}

/// The rows (or count) produced by a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub rows: Vec<DataRow>,
    pub count: Option<u64>,
}

/// Replication state of a server as reported by the server itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationStatus {
    /// Address of the replication source, if one is configured.
    pub master_address: Option<String>,
    pub replica_running: bool,
    /// Monotonic count of transactions this server has applied.
    pub applied_position: u64,
}

/// Connection coordinates of a replication source.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterInfo {
    pub address: String,
    pub user: String,
    pub passwd: String,
}

/// A live connection to one managed database server.
#[async_trait]
pub trait ServerConn: Send + Sync {
    async fn ping(&self) -> Result<(), FabricError>;

    /// The server-generated 128-bit identity, discovered on first contact.
    async fn server_uuid(&self) -> Result<Uuid, FabricError>;

    async fn set_mode(&self, mode: ServerMode) -> Result<(), FabricError>;

    /// The mode the server itself reports, which may disagree with
    /// metadata after an out-of-band change.
    async fn mode(&self) -> Result<ServerMode, FabricError>;

    async fn exec_stmt(&self, stmt: Statement) -> Result<ResultSet, FabricError>;

    // --- replication controls ---

    async fn replication_status(&self) -> Result<ReplicationStatus, FabricError>;

    /// `CHANGE MASTER TO`-equivalent: points this server at a new source and
    /// provisions it with the source's current data set.
    async fn change_master_to(&self, master: &MasterInfo) -> Result<(), FabricError>;

    async fn start_replication(&self) -> Result<(), FabricError>;

    async fn stop_replication(&self) -> Result<(), FabricError>;

    /// Clears replication configuration entirely (`RESET SLAVE ALL`).
    async fn reset_replication(&self) -> Result<(), FabricError>;

    /// Blocks until this server has applied at least `position` transactions,
    /// or fails with a `Timeout` error.
    async fn wait_for_position(
        &self,
        position: u64,
        timeout: Duration,
    ) -> Result<(), FabricError>;
}

/// Opens connections to managed servers. The registry owns one connector;
/// swapping it is how a real driver (or the mock farm) is plugged in.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        user: &str,
        passwd: &str,
    ) -> Result<Arc<dyn ServerConn>, FabricError>;
}

/// A checked-out pooled connection. The per-server permit is returned to the
/// pool on drop.
pub struct PooledConn {
    conn: Arc<dyn ServerConn>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish_non_exhaustive()
    }
}

impl std::ops::Deref for PooledConn {
    type Target = dyn ServerConn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

/// Caps concurrent use of each managed server at `per_server` connections.
/// Callers block waiting for a free slot, matching the bounded resource
/// model of the executor's worker pool.
pub struct ConnectionPool {
    per_server: usize,
    permits: DashMap<Uuid, Arc<Semaphore>>,
}

impl ConnectionPool {
    pub fn new(per_server: usize) -> Self {
        Self {
            per_server: per_server.max(1),
            permits: DashMap::new(),
        }
    }

    pub async fn check_out(
        &self,
        uuid: Uuid,
        conn: Arc<dyn ServerConn>,
    ) -> Result<PooledConn, FabricError> {
        let semaphore = self
            .permits
            .entry(uuid)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_server)))
            .clone();
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| FabricError::ShuttingDown)?;
        Ok(PooledConn {
            conn,
            _permit: permit,
        })
    }

    /// Drops the permit bookkeeping of a removed server.
    pub fn forget(&self, uuid: &Uuid) {
        self.permits.remove(uuid);
    }
}

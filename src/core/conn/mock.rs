// src/core/conn/mock.rs

//! An in-process emulation of a farm of managed database servers. Each
//! server holds key-ordered tables, a replication link, and an applied
//! transaction counter; writes applied to a source propagate synchronously
//! to every running downstream replica. The test suite builds whole
//! topologies out of this farm, and the daemon binary drives it until a
//! real driver is linked in.

use super::{
    Connector, DataRow, MasterInfo, ReplicationStatus, ResultSet, ServerConn, Statement,
};
use crate::core::errors::FabricError;
use crate::core::sharding::lookup::ShardingKey;
use crate::core::store::entities::{ServerMode, TableName};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;
use uuid::Uuid;

/// Credentials every farm server accepts unless overridden.
pub const FARM_USER: &str = "fabric";
pub const FARM_PASSWD: &str = "secret";

const POSITION_POLL_INTERVAL: Duration = Duration::from_millis(10);

type TableData = BTreeMap<ShardingKey, serde_json::Value>;

#[derive(Default)]
struct MockState {
    mode: ServerMode,
    reachable: bool,
    tables: HashMap<TableName, TableData>,
    /// Address of the replication source, when configured.
    master: Option<String>,
    replica_running: bool,
    applied_position: u64,
    /// Fault injection: the next directly executed statement fails once.
    fail_next_stmt: Option<FabricError>,
}

/// One emulated database server.
pub struct MockServer {
    pub uuid: Uuid,
    pub address: String,
    user: String,
    passwd: String,
    state: Mutex<MockState>,
}

impl MockServer {
    fn new(address: &str) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            address: address.to_string(),
            user: FARM_USER.to_string(),
            passwd: FARM_PASSWD.to_string(),
            state: Mutex::new(MockState {
                reachable: true,
                ..MockState::default()
            }),
        }
    }

    pub fn applied_position(&self) -> u64 {
        self.state.lock().applied_position
    }

    pub fn mode(&self) -> ServerMode {
        self.state.lock().mode
    }

    fn is_reachable(&self) -> bool {
        self.state.lock().reachable
    }

    /// Applies one statement to this server's local state. `replicated`
    /// applies bypass the read-only fence and fault injection, like a
    /// replica's apply thread running with elevated privileges.
    fn apply(&self, stmt: &Statement, replicated: bool) -> Result<ResultSet, FabricError> {
        let mut state = self.state.lock();

        if !replicated
            && let Some(err) = state.fail_next_stmt.take()
        {
            return Err(err);
        }
        if !replicated && stmt.is_write() && state.mode == ServerMode::ReadOnly {
            return Err(FabricError::Database(format!(
                "server {} is running in read-only mode",
                self.address
            )));
        }

        let result = match stmt {
            Statement::CreateTable { table, .. } => {
                if state.tables.contains_key(table) {
                    return Err(FabricError::Database(format!("table {table} already exists")));
                }
                state.tables.insert(table.clone(), TableData::new());
                ResultSet::default()
            }
            Statement::DropTable { table } => {
                // Lifecycle teardown drops tables that may already be gone.
                state.tables.remove(table);
                ResultSet::default()
            }
            Statement::Insert { table, row } => {
                let data = state.tables.get_mut(table).ok_or_else(|| {
                    FabricError::Database(format!("table {table} doesn't exist"))
                })?;
                data.insert(row.key.clone(), row.payload.clone());
                ResultSet::default()
            }
            Statement::Load { table, rows } => {
                let data = state.tables.entry(table.clone()).or_default();
                for row in rows {
                    data.insert(row.key.clone(), row.payload.clone());
                }
                ResultSet::default()
            }
            Statement::Dump { table, predicate } | Statement::Select { table, predicate } => {
                let data = state.tables.get(table).ok_or_else(|| {
                    FabricError::Database(format!("table {table} doesn't exist"))
                })?;
                let rows = data
                    .iter()
                    .filter(|(key, _)| predicate.matches(key))
                    .map(|(key, payload)| DataRow {
                        key: key.clone(),
                        payload: payload.clone(),
                    })
                    .collect();
                ResultSet { rows, count: None }
            }
            Statement::Count { table } => {
                let data = state.tables.get(table).ok_or_else(|| {
                    FabricError::Database(format!("table {table} doesn't exist"))
                })?;
                ResultSet {
                    rows: Vec::new(),
                    count: Some(data.len() as u64),
                }
            }
            Statement::DeleteWhere { table, predicate } => {
                let data = state.tables.get(table).ok_or_else(|| {
                    FabricError::Database(format!("table {table} doesn't exist"))
                })?;
                let doomed: Vec<ShardingKey> = data
                    .keys()
                    .filter(|key| predicate.matches(key))
                    .cloned()
                    .collect();
                let data = state.tables.get_mut(table).expect("checked above");
                for key in &doomed {
                    data.remove(key);
                }
                ResultSet {
                    rows: Vec::new(),
                    count: Some(doomed.len() as u64),
                }
            }
        };

        if stmt.is_write() {
            state.applied_position += 1;
        }
        Ok(result)
    }

    /// Copies the source's tables and position onto this server, the mock's
    /// stand-in for initial replica provisioning.
    fn sync_from(&self, source: &MockServer) {
        if std::ptr::eq(self, source) {
            return;
        }
        let (tables, position) = {
            let src = source.state.lock();
            (src.tables.clone(), src.applied_position)
        };
        let mut state = self.state.lock();
        for (name, data) in tables {
            state.tables.insert(name, data);
        }
        state.applied_position = position;
    }
}

/// The whole emulated farm, addressable by host:port. Implements
/// [`Connector`] so the registry can open connections into it.
pub struct MockFarm {
    servers: DashMap<String, Arc<MockServer>>,
    /// Back-reference handed to connections so write fan-out can walk the
    /// replication graph. Always set: the farm is only built through `new`.
    self_ref: Weak<MockFarm>,
}

impl MockFarm {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            servers: DashMap::new(),
            self_ref: weak.clone(),
        })
    }

    /// Registers a new emulated server and returns its generated uuid.
    pub fn add_server(&self, address: &str) -> Uuid {
        let server = Arc::new(MockServer::new(address));
        let uuid = server.uuid;
        self.servers.insert(address.to_string(), server);
        uuid
    }

    pub fn server(&self, address: &str) -> Option<Arc<MockServer>> {
        self.servers.get(address).map(|s| s.clone())
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if let Some(server) = self.servers.get(address) {
            server.state.lock().reachable = reachable;
        }
    }

    /// Makes the next directly executed statement on `address` fail once.
    pub fn inject_failure(&self, address: &str, err: FabricError) {
        if let Some(server) = self.servers.get(address) {
            server.state.lock().fail_next_stmt = Some(err);
        }
    }

    /// Applies a statement at `origin` and fans the write out to every
    /// running, reachable replica downstream of it.
    fn execute(&self, origin: &Arc<MockServer>, stmt: &Statement) -> Result<ResultSet, FabricError> {
        let result = origin.apply(stmt, false)?;
        if stmt.is_write() {
            let mut visited = HashSet::new();
            visited.insert(origin.address.clone());
            self.propagate(&origin.address, stmt, &mut visited);
        }
        Ok(result)
    }

    fn propagate(&self, source: &str, stmt: &Statement, visited: &mut HashSet<String>) {
        let downstream: Vec<Arc<MockServer>> = self
            .servers
            .iter()
            .filter(|entry| {
                let state = entry.value().state.lock();
                state.master.as_deref() == Some(source) && state.replica_running && state.reachable
            })
            .map(|entry| entry.value().clone())
            .collect();

        for replica in downstream {
            if !visited.insert(replica.address.clone()) {
                continue;
            }
            if let Err(e) = replica.apply(stmt, true) {
                debug!("replica {} failed to apply statement: {e}", replica.address);
                continue;
            }
            self.propagate(&replica.address.clone(), stmt, visited);
        }
    }
}

#[async_trait]
impl Connector for MockFarm {
    async fn connect(
        &self,
        address: &str,
        user: &str,
        passwd: &str,
    ) -> Result<Arc<dyn ServerConn>, FabricError> {
        let server = self
            .servers
            .get(address)
            .map(|s| s.clone())
            .ok_or_else(|| FabricError::Connect(address.to_string()))?;
        if !server.is_reachable() {
            return Err(FabricError::Connect(address.to_string()));
        }
        if server.user != user || server.passwd != passwd {
            return Err(FabricError::Auth(address.to_string()));
        }
        let farm = self
            .self_ref
            .upgrade()
            .ok_or_else(|| FabricError::Connect(address.to_string()))?;
        Ok(Arc::new(MockConn { farm, server }))
    }
}

/// A connection into the mock farm.
pub struct MockConn {
    farm: Arc<MockFarm>,
    server: Arc<MockServer>,
}

impl MockConn {
    fn check_reachable(&self) -> Result<(), FabricError> {
        if self.server.is_reachable() {
            Ok(())
        } else {
            Err(FabricError::Connect(self.server.address.clone()))
        }
    }
}

#[async_trait]
impl ServerConn for MockConn {
    async fn ping(&self) -> Result<(), FabricError> {
        self.check_reachable()
    }

    async fn server_uuid(&self) -> Result<Uuid, FabricError> {
        self.check_reachable()?;
        Ok(self.server.uuid)
    }

    async fn set_mode(&self, mode: ServerMode) -> Result<(), FabricError> {
        self.check_reachable()?;
        self.server.state.lock().mode = mode;
        Ok(())
    }

    async fn mode(&self) -> Result<ServerMode, FabricError> {
        self.check_reachable()?;
        Ok(self.server.state.lock().mode)
    }

    async fn exec_stmt(&self, stmt: Statement) -> Result<ResultSet, FabricError> {
        self.check_reachable()?;
        self.farm.execute(&self.server, &stmt)
    }

    async fn replication_status(&self) -> Result<ReplicationStatus, FabricError> {
        self.check_reachable()?;
        let state = self.server.state.lock();
        Ok(ReplicationStatus {
            master_address: state.master.clone(),
            replica_running: state.replica_running,
            applied_position: state.applied_position,
        })
    }

    async fn change_master_to(&self, master: &MasterInfo) -> Result<(), FabricError> {
        self.check_reachable()?;
        let source = self
            .farm
            .server(&master.address)
            .ok_or_else(|| FabricError::Connect(master.address.clone()))?;
        if source.is_reachable() {
            self.server.sync_from(&source);
        }
        let mut state = self.server.state.lock();
        state.master = Some(master.address.clone());
        state.replica_running = false;
        Ok(())
    }

    async fn start_replication(&self) -> Result<(), FabricError> {
        self.check_reachable()?;
        let source_addr = self.server.state.lock().master.clone();
        let source = source_addr
            .as_deref()
            .and_then(|addr| self.farm.server(addr));
        // Catch up on writes that landed between CHANGE MASTER and start.
        if let Some(source) = source
            && source.is_reachable()
        {
            self.server.sync_from(&source);
        }
        self.server.state.lock().replica_running = true;
        Ok(())
    }

    async fn stop_replication(&self) -> Result<(), FabricError> {
        self.check_reachable()?;
        self.server.state.lock().replica_running = false;
        Ok(())
    }

    async fn reset_replication(&self) -> Result<(), FabricError> {
        self.check_reachable()?;
        let mut state = self.server.state.lock();
        state.master = None;
        state.replica_running = false;
        Ok(())
    }

    async fn wait_for_position(
        &self,
        position: u64,
        timeout: Duration,
    ) -> Result<(), FabricError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_reachable()?;
            if self.server.applied_position() >= position {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FabricError::Timeout(format!(
                    "server {} did not reach position {position}",
                    self.server.address
                )));
            }
            sleep(POSITION_POLL_INTERVAL).await;
        }
    }
}

// tests/support/mod.rs

//! Shared scaffolding for the integration tests: a fabric wired to the
//! in-process farm, plus helpers for building topologies and seeding data.

#![allow(dead_code)]

use fabricd::config::Config;
use fabricd::core::conn::mock::{FARM_PASSWD, FARM_USER, MockFarm};
use fabricd::core::conn::{DataRow, ServerConn, Statement};
use fabricd::core::executor::procedure::ProcedureStatus;
use fabricd::core::sharding::lookup::{KeyPredicate, ShardingKey};
use fabricd::core::state::FabricState;
use fabricd::core::store::entities::TableName;
use fabricd::core::store::memory::MemoryStore;
use fabricd::server::{CommandArgs, CommandRegistry};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

pub struct TestFabric {
    pub state: Arc<FabricState>,
    pub farm: Arc<MockFarm>,
    pub registry: CommandRegistry,
}

impl TestFabric {
    /// A fabric with test-friendly timings: short catch-up, no jitter.
    pub async fn new() -> Self {
        let mut config = Config::default();
        config.executor.nworkers = 4;
        config.executor.shutdown_timeout = Duration::from_secs(2);
        config.groups.catchup_timeout = Duration::from_millis(500);
        config.groups.failover_jitter = Duration::from_millis(1);
        let farm = MockFarm::new();
        let store = Arc::new(MemoryStore::new());
        let state = FabricState::initialize(config, store, farm.clone());
        state.load_caches().await.expect("cache load");
        Self {
            state,
            farm,
            registry: CommandRegistry::builtin(),
        }
    }

    /// Dispatches one command through the registry, like a client would.
    pub async fn call(&self, namespace: &str, method: &str, args: Vec<Value>) -> ProcedureStatus {
        self.registry
            .dispatch(self.state.clone(), namespace, method, CommandArgs(args))
            .await
            .unwrap_or_else(|e| panic!("{namespace}.{method} failed before scheduling: {e}"))
    }

    /// Like `call`, but asserts the procedure completed successfully.
    pub async fn call_ok(&self, namespace: &str, method: &str, args: Vec<Value>) -> ProcedureStatus {
        let status = self.call(namespace, method, args).await;
        assert!(
            status.success,
            "{namespace}.{method} failed: {:?}",
            status.steps
        );
        status
    }

    /// Creates a group, provisions farm servers for it, and promotes one.
    pub async fn make_group(&self, group_id: &str, addresses: &[&str]) {
        for address in addresses {
            self.farm.add_server(address);
        }
        self.call_ok("group", "create", vec![json!(group_id), json!("test group")])
            .await;
        for address in addresses {
            self.call_ok("group", "add", vec![json!(group_id), json!(address)])
                .await;
        }
        self.call_ok("group", "promote", vec![json!(group_id)])
            .await;
    }

    /// A direct connection to one farm server, bypassing the registry.
    pub async fn conn(&self, address: &str) -> Arc<dyn ServerConn> {
        use fabricd::core::conn::Connector;
        self.farm
            .connect(address, FARM_USER, FARM_PASSWD)
            .await
            .expect("farm connect")
    }

    /// The address of a group's current master, from metadata.
    pub fn master_address(&self, group_id: &str) -> String {
        self.state
            .groups
            .master_of(group_id)
            .expect("group master")
            .address
    }

    /// Creates `table` on the server at `address` and inserts one row per
    /// integer key, payload shaped like the original data sets.
    pub async fn seed_int_rows(&self, address: &str, table: &str, keys: &[i64]) {
        let table: TableName = table.parse().unwrap();
        let conn = self.conn(address).await;
        conn.exec_stmt(Statement::CreateTable {
            table: table.clone(),
            key_column: "userID".into(),
        })
        .await
        .expect("create table");
        for key in keys {
            conn.exec_stmt(Statement::Insert {
                table: table.clone(),
                row: DataRow {
                    key: ShardingKey::Int(*key),
                    payload: json!({ "name": format!("TEST {key}") }),
                },
            })
            .await
            .expect("insert row");
        }
    }

    /// String-key variant of `seed_int_rows`.
    pub async fn seed_str_rows(&self, address: &str, table: &str, keys: &[String]) {
        let table: TableName = table.parse().unwrap();
        let conn = self.conn(address).await;
        conn.exec_stmt(Statement::CreateTable {
            table: table.clone(),
            key_column: "userID".into(),
        })
        .await
        .expect("create table");
        for key in keys {
            conn.exec_stmt(Statement::Insert {
                table: table.clone(),
                row: DataRow {
                    key: ShardingKey::Str(key.clone()),
                    payload: json!({ "name": format!("TEST {key}") }),
                },
            })
            .await
            .expect("insert row");
        }
    }

    /// Row count of a table on one server, or an error if the table is gone.
    pub async fn count_rows(&self, address: &str, table: &str) -> Result<u64, fabricd::FabricError> {
        let table: TableName = table.parse().unwrap();
        let conn = self.conn(address).await;
        let result = conn.exec_stmt(Statement::Count { table }).await?;
        Ok(result.count.unwrap_or(0))
    }

    /// All rows of a table on one server, in key order.
    pub async fn select_rows(
        &self,
        address: &str,
        table: &str,
    ) -> Result<Vec<DataRow>, fabricd::FabricError> {
        let table: TableName = table.parse().unwrap();
        let conn = self.conn(address).await;
        let result = conn
            .exec_stmt(Statement::Select {
                table,
                predicate: KeyPredicate::All,
            })
            .await?;
        Ok(result.rows)
    }

    /// Waits for the given procedure ids (as returned by event.trigger).
    pub async fn wait_for(&self, ids: &[Value]) {
        self.call_ok("event", "wait_for", vec![Value::Array(ids.to_vec())])
            .await;
    }
}

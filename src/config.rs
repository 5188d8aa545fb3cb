// src/config.rs

//! Manages daemon configuration: loading, per-section defaults, and
//! validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Connection coordinates of the metadata storage backend.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_address")]
    pub address: String,
    #[serde(default = "default_storage_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            address: default_storage_address(),
            user: default_storage_user(),
            password: String::new(),
        }
    }
}

fn default_storage_address() -> String {
    "127.0.0.1:3306".to_string()
}
fn default_storage_user() -> String {
    "fabric_store".to_string()
}

/// Where the client-facing request/response transport listens.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProtocolConfig {
    #[serde(default = "default_protocol_address")]
    pub address: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            address: default_protocol_address(),
        }
    }
}

fn default_protocol_address() -> String {
    "127.0.0.1:32274".to_string()
}

/// Sizing of the procedure executor.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of pool workers running procedures concurrently.
    #[serde(default = "default_nworkers")]
    pub nworkers: usize,
    /// How long shutdown waits for in-flight procedures before aborting.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            nworkers: default_nworkers(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_nworkers() -> usize {
    5
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Knobs of the shard lifecycle protocols.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ShardingConfig {
    /// External dump program used by drivers that shell out for snapshots.
    #[serde(default = "default_mysqldump_program")]
    pub mysqldump_program: String,
    /// External client program used by drivers that shell out for restores.
    #[serde(default = "default_mysqlclient_program")]
    pub mysqlclient_program: String,
    /// Whether a lifecycle procedure waits for a busy shard or fails fast.
    #[serde(default = "default_shard_busy_wait")]
    pub shard_busy_wait: bool,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            mysqldump_program: default_mysqldump_program(),
            mysqlclient_program: default_mysqlclient_program(),
            shard_busy_wait: default_shard_busy_wait(),
        }
    }
}

fn default_mysqldump_program() -> String {
    "/usr/bin/mysqldump".to_string()
}
fn default_mysqlclient_program() -> String {
    "/usr/bin/mysql".to_string()
}
fn default_shard_busy_wait() -> bool {
    true
}

/// Timing of the master-changeover protocols.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GroupsConfig {
    /// How long a promotion waits for secondaries to reach the fenced
    /// master's final position before giving up.
    #[serde(default = "default_catchup_timeout", with = "humantime_serde")]
    pub catchup_timeout: Duration,
    /// Upper bound of the random delay before an unattended fail-over acts.
    #[serde(default = "default_failover_jitter", with = "humantime_serde")]
    pub failover_jitter: Duration,
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            catchup_timeout: default_catchup_timeout(),
            failover_jitter: default_failover_jitter(),
        }
    }
}

fn default_catchup_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_failover_jitter() -> Duration {
    Duration::from_millis(500)
}

/// Credentials and connection limits for the managed servers themselves.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServersConfig {
    #[serde(default = "default_servers_user")]
    pub user: String,
    #[serde(default = "default_servers_password")]
    pub password: String,
    /// Maximum pooled connections per managed server.
    #[serde(default = "default_servers_connections")]
    pub connections: usize,
}

impl Default for ServersConfig {
    fn default() -> Self {
        Self {
            user: default_servers_user(),
            password: default_servers_password(),
            connections: default_servers_connections(),
        }
    }
}

fn default_servers_user() -> String {
    "fabric".to_string()
}
fn default_servers_password() -> String {
    "secret".to_string()
}
fn default_servers_connections() -> usize {
    4
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub groups: GroupsConfig,
    #[serde(default)]
    pub servers: ServersConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            storage: StorageConfig::default(),
            protocol: ProtocolConfig::default(),
            executor: ExecutorConfig::default(),
            sharding: ShardingConfig::default(),
            groups: GroupsConfig::default(),
            servers: ServersConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("could not read configuration file '{path}'"))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("could not parse configuration file '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.nworkers == 0 {
            return Err(anyhow!("executor.nworkers must be at least 1"));
        }
        if self.servers.connections == 0 {
            return Err(anyhow!("servers.connections must be at least 1"));
        }
        if self.protocol.address.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow!(
                "protocol.address '{}' is not a host:port pair",
                self.protocol.address
            ));
        }
        Ok(())
    }
}

// src/core/store/entities.rs

//! The persistent entities managed by the metadata store: servers, groups,
//! shard mappings, sharded tables, shards, and their key ranges.

use crate::core::errors::FabricError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Metadata table names, used as the first half of every store key.
pub mod tables {
    pub const SERVERS: &str = "servers";
    pub const GROUPS: &str = "groups";
    pub const SHARD_MAPPINGS: &str = "shard_mappings";
    pub const SHARD_TABLES: &str = "shard_tables";
    pub const SHARDS: &str = "shards";
    pub const SHARD_RANGES: &str = "shard_ranges";
    pub const PROCEDURE_AUDIT: &str = "procedure_audit";
}

/// The administrative status of a managed server inside its group.
#[derive(
    Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Primary,
    Secondary,
    Spare,
    Faulty,
    Offline,
}

/// Whether a managed server currently accepts writes.
#[derive(
    Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Hash, Default,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMode {
    ReadOnly,
    #[default]
    ReadWrite,
    Offline,
}

#[derive(
    Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Hash, Default,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupStatus {
    #[default]
    Active,
    Inactive,
}

/// Whether a shard participates in routing. DISABLED shards are invisible
/// to key lookup, which is how lifecycle operations fence traffic.
#[derive(
    Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardState {
    Enabled,
    Disabled,
}

/// The partitioning strategy of a shard mapping.
#[derive(
    Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardingType {
    Range,
    RangeString,
    Hash,
}

/// Routing scope for `lookup_servers`: the shard's own group or the
/// mapping's global group.
#[derive(
    Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LookupHint {
    Local,
    Global,
}

/// A fully qualified `schema.table` name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl FromStr for TableName {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((schema, name)) if !schema.is_empty() && !name.is_empty() => Ok(Self {
                schema: schema.to_string(),
                name: name.to_string(),
            }),
            _ => Err(FabricError::Sharding(format!(
                "'{s}' is not a qualified schema.table name"
            ))),
        }
    }
}

impl TryFrom<String> for TableName {
    type Error = FabricError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TableName> for String {
    fn from(t: TableName) -> Self {
        t.to_string()
    }
}

/// A managed database server. The uuid is generated by the server itself and
/// discovered on first contact; it is the primary key everywhere else.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub uuid: Uuid,
    pub address: String,
    pub user: String,
    pub passwd: String,
    pub status: ServerStatus,
    pub mode: ServerMode,
}

impl Server {
    /// A server only serves routed traffic while PRIMARY or SECONDARY.
    pub fn is_serving(&self) -> bool {
        matches!(self.status, ServerStatus::Primary | ServerStatus::Secondary)
    }
}

/// A high-availability group: a set of servers replicating among themselves
/// with at most one PRIMARY.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub group_id: String,
    pub description: String,
    pub servers: BTreeSet<Uuid>,
    pub master: Option<Uuid>,
    pub status: GroupStatus,
}

impl Group {
    pub fn new(group_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            description: description.into(),
            servers: BTreeSet::new(),
            master: None,
            status: GroupStatus::Active,
        }
    }
}

/// A sharding scheme: a partitioning strategy plus the group that holds the
/// globally replicated tables for this mapping.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShardMapping {
    pub mapping_id: u64,
    pub sharding_type: ShardingType,
    pub global_group_id: String,
}

/// A table registered under a mapping, sharded on `key_column`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShardTable {
    pub mapping_id: u64,
    pub table: TableName,
    pub key_column: String,
}

/// A horizontal partition owned by one group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub shard_id: u64,
    pub mapping_id: u64,
    pub state: ShardState,
    pub group_id: String,
}

/// The inclusive lower bound of a shard. Bounds are persisted as strings and
/// interpreted according to the mapping's sharding type: a decimal integer
/// for RANGE, an arbitrary string for RANGE_STRING, and a hex-encoded 128-bit
/// digest for HASH.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShardRange {
    pub shard_id: u64,
    pub mapping_id: u64,
    pub lower_bound: String,
}

/// One archived step of a finished procedure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuditStep {
    pub state: String,
    pub success: bool,
    pub description: String,
    pub diagnosis: String,
}

/// The terminal outcome of a procedure, kept for `status()` queries after
/// the in-memory record is dropped.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcedureAudit {
    pub procedure_id: Uuid,
    pub state: String,
    pub success: bool,
    pub steps: Vec<AuditStep>,
    pub return_value: Option<serde_json::Value>,
    pub finished_at: DateTime<Utc>,
}

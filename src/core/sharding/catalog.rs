// src/core/sharding/catalog.rs

//! The sharding catalog: shard definitions, table-to-mapping bindings, and
//! shard-to-group assignments, cached write-through over the metadata store.

use super::lookup::{
    self, KeyRange, RouteEntry, ShardingKey, parse_bound, route_hash, route_range,
};
use crate::core::errors::FabricError;
use crate::core::groups::GroupManager;
use crate::core::store::entities::{
    self, LookupHint, Server, Shard, ShardMapping, ShardRange, ShardState, ShardTable,
    ShardingType, TableName,
};
use crate::core::store::{MetadataStore, scan_entities, write_entity};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// What a routing query addresses: a sharded table (plus key) or a shard id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupTarget {
    Table(TableName),
    Shard(u64),
}

pub struct ShardingCatalog {
    store: Arc<dyn MetadataStore>,
    groups: Arc<GroupManager>,
    mappings: DashMap<u64, ShardMapping>,
    tables: DashMap<TableName, ShardTable>,
    shards: DashMap<u64, Shard>,
    /// Keyed by shard id; one range per shard.
    ranges: DashMap<u64, ShardRange>,
}

impl ShardingCatalog {
    pub fn new(store: Arc<dyn MetadataStore>, groups: Arc<GroupManager>) -> Self {
        Self {
            store,
            groups,
            mappings: DashMap::new(),
            tables: DashMap::new(),
            shards: DashMap::new(),
            ranges: DashMap::new(),
        }
    }

    /// Warms the caches from the metadata store at startup.
    pub async fn load(&self) -> Result<(), FabricError> {
        let mut txn = self.store.begin().await;
        let mappings: Vec<ShardMapping> =
            scan_entities(txn.as_mut(), entities::tables::SHARD_MAPPINGS).await?;
        let tables: Vec<ShardTable> =
            scan_entities(txn.as_mut(), entities::tables::SHARD_TABLES).await?;
        let shards: Vec<Shard> = scan_entities(txn.as_mut(), entities::tables::SHARDS).await?;
        let ranges: Vec<ShardRange> =
            scan_entities(txn.as_mut(), entities::tables::SHARD_RANGES).await?;
        txn.rollback().await?;
        for m in mappings {
            self.mappings.insert(m.mapping_id, m);
        }
        for t in tables {
            self.tables.insert(t.table.clone(), t);
        }
        for s in shards {
            self.shards.insert(s.shard_id, s);
        }
        for r in ranges {
            self.ranges.insert(r.shard_id, r);
        }
        info!(
            "sharding catalog loaded {} mapping(s), {} shard(s)",
            self.mappings.len(),
            self.shards.len()
        );
        Ok(())
    }

    /// Allocates a new mapping bound to a global group.
    pub async fn create_definition(
        &self,
        sharding_type: ShardingType,
        global_group_id: &str,
    ) -> Result<u64, FabricError> {
        self.groups.lookup_group(global_group_id)?;
        let mapping_id = self.store.next_id("shard_mappings");
        let mapping = ShardMapping {
            mapping_id,
            sharding_type,
            global_group_id: global_group_id.to_string(),
        };
        let mut txn = self.store.begin().await;
        write_entity(
            txn.as_mut(),
            entities::tables::SHARD_MAPPINGS,
            &mapping_id.to_string(),
            &mapping,
        )
        .await?;
        txn.commit().await?;
        self.mappings.insert(mapping_id, mapping);
        Ok(mapping_id)
    }

    /// Registers a table under a mapping.
    pub async fn add_table(
        &self,
        mapping_id: u64,
        table: TableName,
        key_column: &str,
    ) -> Result<(), FabricError> {
        self.mapping(mapping_id)?;
        if self.tables.contains_key(&table) {
            return Err(FabricError::Sharding(format!(
                "table {table} is already registered"
            )));
        }
        let record = ShardTable {
            mapping_id,
            table: table.clone(),
            key_column: key_column.to_string(),
        };
        let mut txn = self.store.begin().await;
        write_entity(
            txn.as_mut(),
            entities::tables::SHARD_TABLES,
            &table.to_string(),
            &record,
        )
        .await?;
        txn.commit().await?;
        self.tables.insert(table, record);
        Ok(())
    }

    /// Inserts one or more shards from a `"group/bound[,group/bound…]"` spec
    /// string. All inserts land in one transaction; any invalid item rejects
    /// the whole spec.
    pub async fn add_shards(
        &self,
        mapping_id: u64,
        spec: &str,
        state: ShardState,
    ) -> Result<Vec<u64>, FabricError> {
        let mapping = self.mapping(mapping_id)?;
        let mut parsed: Vec<(String, ShardingKey, String)> = Vec::new();
        for item in spec.split(',') {
            let item = item.trim();
            let (group_id, raw_bound) = item.split_once('/').ok_or_else(|| {
                FabricError::Sharding(format!(
                    "'{item}' is not a group/bound shard specification"
                ))
            })?;
            let group_id = group_id.trim();
            let raw_bound = raw_bound.trim();
            self.groups.lookup_group(group_id)?;
            if state == ShardState::Enabled {
                self.groups.master_of(group_id)?;
            }
            let bound = parse_bound(mapping.sharding_type, raw_bound)?;
            parsed.push((group_id.to_string(), bound, raw_bound.to_string()));
        }

        // Uniqueness against existing bounds and within the spec itself.
        let mut bounds: Vec<ShardingKey> = self
            .mapping_ranges(mapping_id)
            .iter()
            .map(|r| parse_bound(mapping.sharding_type, &r.lower_bound))
            .collect::<Result<_, _>>()?;
        for (_, bound, raw) in &parsed {
            if bounds.contains(bound) {
                return Err(FabricError::Sharding(format!(
                    "mapping {mapping_id} already has a shard with lower bound '{raw}'"
                )));
            }
            bounds.push(bound.clone());
        }

        let mut txn = self.store.begin().await;
        let mut created = Vec::with_capacity(parsed.len());
        let mut new_records = Vec::with_capacity(parsed.len());
        for (group_id, _, raw_bound) in parsed {
            let shard_id = self.store.next_id("shards");
            let shard = Shard {
                shard_id,
                mapping_id,
                state,
                group_id,
            };
            let range = ShardRange {
                shard_id,
                mapping_id,
                lower_bound: raw_bound,
            };
            write_entity(
                txn.as_mut(),
                entities::tables::SHARDS,
                &shard_id.to_string(),
                &shard,
            )
            .await?;
            write_entity(
                txn.as_mut(),
                entities::tables::SHARD_RANGES,
                &shard_id.to_string(),
                &range,
            )
            .await?;
            created.push(shard_id);
            new_records.push((shard, range));
        }
        txn.commit().await?;
        for (shard, range) in new_records {
            self.ranges.insert(shard.shard_id, range);
            self.shards.insert(shard.shard_id, shard);
        }

        // The item list was checked piecewise; the assembled bound array
        // must still form a sorted, disjoint cover.
        lookup::validate_bounds(&self.entries(mapping_id, false)?)?;

        // An ENABLED shard serves writes, so its group must start receiving
        // the globally replicated tables right away.
        if state == ShardState::Enabled {
            for shard_id in &created {
                let shard = self.shard(*shard_id)?;
                self.groups
                    .setup_group_replication(&mapping.global_group_id, &shard.group_id)
                    .await?;
            }
        }
        Ok(created)
    }

    pub fn mappings(&self) -> Vec<ShardMapping> {
        let mut mappings: Vec<ShardMapping> = self
            .mappings
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        mappings.sort_by_key(|m| m.mapping_id);
        mappings
    }

    pub fn mapping(&self, mapping_id: u64) -> Result<ShardMapping, FabricError> {
        self.mappings
            .get(&mapping_id)
            .map(|m| m.clone())
            .ok_or_else(|| {
                FabricError::Sharding(format!("no shard mapping with id {mapping_id}"))
            })
    }

    pub fn shard(&self, shard_id: u64) -> Result<Shard, FabricError> {
        self.shards
            .get(&shard_id)
            .map(|s| s.clone())
            .ok_or_else(|| FabricError::Sharding(format!("no shard with id {shard_id}")))
    }

    pub fn lookup_table(&self, table: &TableName) -> Result<ShardTable, FabricError> {
        self.tables
            .get(table)
            .map(|t| t.clone())
            .ok_or_else(|| FabricError::Sharding(format!("table {table} is not sharded")))
    }

    /// Every table registered under a mapping, in name order.
    pub fn tables_of(&self, mapping_id: u64) -> Vec<ShardTable> {
        let mut tables: Vec<ShardTable> = self
            .tables
            .iter()
            .filter(|entry| entry.value().mapping_id == mapping_id)
            .map(|entry| entry.value().clone())
            .collect();
        tables.sort_by(|a, b| a.table.cmp(&b.table));
        tables
    }

    pub fn shards_of(&self, mapping_id: u64) -> Vec<Shard> {
        let mut shards: Vec<Shard> = self
            .shards
            .iter()
            .filter(|entry| entry.value().mapping_id == mapping_id)
            .map(|entry| entry.value().clone())
            .collect();
        shards.sort_by_key(|s| s.shard_id);
        shards
    }

    fn mapping_ranges(&self, mapping_id: u64) -> Vec<ShardRange> {
        self.ranges
            .iter()
            .filter(|entry| entry.value().mapping_id == mapping_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// The sorted route entries of a mapping. Routing uses only ENABLED
    /// shards; range ownership (prune, split) considers every shard.
    pub fn entries(
        &self,
        mapping_id: u64,
        enabled_only: bool,
    ) -> Result<Vec<RouteEntry>, FabricError> {
        let mapping = self.mapping(mapping_id)?;
        let mut entries = Vec::new();
        for range in self.mapping_ranges(mapping_id) {
            let shard = self.shard(range.shard_id)?;
            if enabled_only && shard.state != ShardState::Enabled {
                continue;
            }
            entries.push(RouteEntry {
                shard_id: range.shard_id,
                bound: parse_bound(mapping.sharding_type, &range.lower_bound)?,
            });
        }
        entries.sort_by(|a, b| a.bound.cmp(&b.bound).then(a.shard_id.cmp(&b.shard_id)));
        Ok(entries)
    }

    /// Routes a key to the ENABLED shard owning it.
    pub fn lookup_shard(&self, mapping_id: u64, key: &ShardingKey) -> Result<u64, FabricError> {
        let mapping = self.mapping(mapping_id)?;
        let entries = self.entries(mapping_id, true)?;
        if entries.is_empty() {
            return Err(FabricError::NoSuchShard);
        }
        match mapping.sharding_type {
            ShardingType::Range | ShardingType::RangeString => route_range(&entries, key),
            ShardingType::Hash => route_hash(&entries, key),
        }
    }

    /// The key range a shard owns, computed over all bounds of its mapping
    /// regardless of shard state.
    pub fn owned_range(&self, shard_id: u64) -> Result<KeyRange, FabricError> {
        let shard = self.shard(shard_id)?;
        let entries = self.entries(shard.mapping_id, false)?;
        let idx = entries
            .iter()
            .position(|e| e.shard_id == shard_id)
            .ok_or_else(|| {
                FabricError::Sharding(format!("shard {shard_id} has no range record"))
            })?;
        Ok(lookup::owned_range(&entries, idx))
    }

    /// Resolves a routing query to the set of servers to contact.
    pub fn lookup_servers(
        &self,
        target: &LookupTarget,
        key: Option<&ShardingKey>,
        hint: LookupHint,
    ) -> Result<Vec<Server>, FabricError> {
        let mapping_id = match target {
            LookupTarget::Table(table) => self.lookup_table(table)?.mapping_id,
            LookupTarget::Shard(shard_id) => self.shard(*shard_id)?.mapping_id,
        };
        let servers = match hint {
            LookupHint::Global => {
                let mapping = self.mapping(mapping_id)?;
                self.groups.lookup_servers(&mapping.global_group_id)?
            }
            LookupHint::Local => {
                let shard = match target {
                    LookupTarget::Shard(shard_id) => self.shard(*shard_id)?,
                    LookupTarget::Table(_) => {
                        let key = key.ok_or_else(|| {
                            FabricError::Sharding(
                                "a shard key is required for LOCAL table lookups".into(),
                            )
                        })?;
                        self.shard(self.lookup_shard(mapping_id, key)?)?
                    }
                };
                self.groups.lookup_servers(&shard.group_id)?
            }
        };
        // FAULTY and OFFLINE members are not routable.
        Ok(servers.into_iter().filter(Server::is_serving).collect())
    }

    /// Flips a shard's state. Enabling verifies the owning group has a
    /// PRIMARY to serve writes and wires it into the global replication
    /// fan-out.
    pub async fn set_shard_state(
        &self,
        shard_id: u64,
        state: ShardState,
    ) -> Result<(), FabricError> {
        let mut shard = self.shard(shard_id)?;
        if state == ShardState::Enabled {
            self.groups.master_of(&shard.group_id)?;
            let mapping = self.mapping(shard.mapping_id)?;
            self.groups
                .setup_group_replication(&mapping.global_group_id, &shard.group_id)
                .await?;
        }
        shard.state = state;
        self.persist_shard(shard).await
    }

    /// Removes a shard definition. Only DISABLED shards can be removed.
    pub async fn remove_shard(&self, shard_id: u64) -> Result<(), FabricError> {
        let shard = self.shard(shard_id)?;
        if shard.state != ShardState::Disabled {
            return Err(FabricError::Sharding(format!(
                "shard {shard_id} must be DISABLED before removal"
            )));
        }
        let mut txn = self.store.begin().await;
        txn.delete(entities::tables::SHARDS, &shard_id.to_string())
            .await?;
        txn.delete(entities::tables::SHARD_RANGES, &shard_id.to_string())
            .await?;
        txn.commit().await?;
        self.shards.remove(&shard_id);
        self.ranges.remove(&shard_id);
        Ok(())
    }

    /// Atomically rebinds a shard to a new owning group and sets its state.
    /// This is the commit point of a shard move.
    pub async fn rebind_shard(
        &self,
        shard_id: u64,
        group_id: &str,
        state: ShardState,
    ) -> Result<(), FabricError> {
        let mut shard = self.shard(shard_id)?;
        shard.group_id = group_id.to_string();
        shard.state = state;
        self.persist_shard(shard).await
    }

    /// Atomically inserts the upper half of a split as a new ENABLED shard
    /// at `pivot` and re-enables the source. This is the commit point of a
    /// shard split.
    pub async fn split_binding(
        &self,
        shard_id: u64,
        pivot: &str,
        dest_group_id: &str,
    ) -> Result<u64, FabricError> {
        let mut source = self.shard(shard_id)?;
        let new_shard_id = self.store.next_id("shards");
        let new_shard = Shard {
            shard_id: new_shard_id,
            mapping_id: source.mapping_id,
            state: ShardState::Enabled,
            group_id: dest_group_id.to_string(),
        };
        let new_range = ShardRange {
            shard_id: new_shard_id,
            mapping_id: source.mapping_id,
            lower_bound: pivot.to_string(),
        };
        source.state = ShardState::Enabled;

        let mut txn = self.store.begin().await;
        write_entity(
            txn.as_mut(),
            entities::tables::SHARDS,
            &new_shard_id.to_string(),
            &new_shard,
        )
        .await?;
        write_entity(
            txn.as_mut(),
            entities::tables::SHARD_RANGES,
            &new_shard_id.to_string(),
            &new_range,
        )
        .await?;
        write_entity(
            txn.as_mut(),
            entities::tables::SHARDS,
            &shard_id.to_string(),
            &source,
        )
        .await?;
        txn.commit().await?;

        self.shards.insert(new_shard_id, new_shard);
        self.ranges.insert(new_shard_id, new_range);
        self.shards.insert(shard_id, source);
        Ok(new_shard_id)
    }

    /// Drops a shard created by a split that had to be rolled back.
    pub(crate) async fn unsplit_binding(
        &self,
        source_shard_id: u64,
        new_shard_id: u64,
        source_state: ShardState,
    ) -> Result<(), FabricError> {
        let mut source = self.shard(source_shard_id)?;
        source.state = source_state;
        let mut txn = self.store.begin().await;
        txn.delete(entities::tables::SHARDS, &new_shard_id.to_string())
            .await?;
        txn.delete(entities::tables::SHARD_RANGES, &new_shard_id.to_string())
            .await?;
        write_entity(
            txn.as_mut(),
            entities::tables::SHARDS,
            &source_shard_id.to_string(),
            &source,
        )
        .await?;
        txn.commit().await?;
        self.shards.remove(&new_shard_id);
        self.ranges.remove(&new_shard_id);
        self.shards.insert(source_shard_id, source);
        Ok(())
    }

    async fn persist_shard(&self, shard: Shard) -> Result<(), FabricError> {
        let mut txn = self.store.begin().await;
        write_entity(
            txn.as_mut(),
            entities::tables::SHARDS,
            &shard.shard_id.to_string(),
            &shard,
        )
        .await?;
        txn.commit().await?;
        self.shards.insert(shard.shard_id, shard);
        Ok(())
    }

}

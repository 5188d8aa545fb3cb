// src/core/groups/mod.rs

//! The group manager: membership of high-availability groups, replication
//! wiring for joining servers, and the startup reconciliation pass that
//! makes metadata agree with actual replication state.

pub mod promote;

use crate::core::conn::MasterInfo;
use crate::core::errors::FabricError;
use crate::core::registry::ServerRegistry;
use crate::core::store::entities::{
    self, Group, GroupStatus, Server, ServerMode, ServerStatus,
};
use crate::core::store::{MetadataStore, read_entity, scan_entities, write_entity};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Credentials used when the daemon connects to managed servers.
#[derive(Debug, Clone)]
pub struct ServerCredentials {
    pub user: String,
    pub passwd: String,
}

pub struct GroupManager {
    store: Arc<dyn MetadataStore>,
    registry: Arc<ServerRegistry>,
    credentials: ServerCredentials,
    /// Write-through cache of the `groups` table.
    cache: DashMap<String, Group>,
}

impl GroupManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        registry: Arc<ServerRegistry>,
        credentials: ServerCredentials,
    ) -> Self {
        Self {
            store,
            registry,
            credentials,
            cache: DashMap::new(),
        }
    }

    pub(crate) fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Warms the cache from the metadata store at startup.
    pub async fn load(&self) -> Result<(), FabricError> {
        let mut txn = self.store.begin().await;
        let groups: Vec<Group> = scan_entities(txn.as_mut(), entities::tables::GROUPS).await?;
        txn.rollback().await?;
        for group in groups {
            self.cache.insert(group.group_id.clone(), group);
        }
        info!("group manager loaded {} group(s)", self.cache.len());
        Ok(())
    }

    pub async fn create_group(
        &self,
        group_id: &str,
        description: &str,
    ) -> Result<(), FabricError> {
        if group_id.is_empty() {
            return Err(FabricError::Group("group id must not be empty".into()));
        }
        let mut txn = self.store.begin().await;
        let existing: Option<Group> =
            read_entity(txn.as_mut(), entities::tables::GROUPS, group_id).await?;
        if existing.is_some() {
            txn.rollback().await?;
            return Err(FabricError::Group(format!("group {group_id} already exists")));
        }
        let group = Group::new(group_id, description);
        write_entity(txn.as_mut(), entities::tables::GROUPS, group_id, &group).await?;
        txn.commit().await?;
        self.cache.insert(group_id.to_string(), group);
        Ok(())
    }

    /// Deletes a group. Only an empty group can be destroyed.
    pub async fn destroy_group(&self, group_id: &str) -> Result<(), FabricError> {
        let group = self.lookup_group(group_id)?;
        if !group.servers.is_empty() {
            return Err(FabricError::Group(format!(
                "group {group_id} still has {} server(s)",
                group.servers.len()
            )));
        }
        let mut txn = self.store.begin().await;
        txn.delete(entities::tables::GROUPS, group_id).await?;
        txn.commit().await?;
        self.cache.remove(group_id);
        Ok(())
    }

    pub async fn set_group_status(
        &self,
        group_id: &str,
        status: GroupStatus,
    ) -> Result<(), FabricError> {
        let mut group = self.lookup_group(group_id)?;
        group.status = status;
        self.persist_group(group).await
    }

    pub fn lookup_group(&self, group_id: &str) -> Result<Group, FabricError> {
        self.cache
            .get(group_id)
            .map(|g| g.clone())
            .ok_or_else(|| FabricError::Group(format!("no group with id {group_id}")))
    }

    pub fn groups(&self) -> Vec<Group> {
        self.cache.iter().map(|entry| entry.value().clone()).collect()
    }

    /// The member servers of a group, PRIMARY first.
    pub fn lookup_servers(&self, group_id: &str) -> Result<Vec<Server>, FabricError> {
        let group = self.lookup_group(group_id)?;
        let mut servers: Vec<Server> = group
            .servers
            .iter()
            .filter_map(|uuid| self.registry.lookup(*uuid).ok())
            .collect();
        servers.sort_by_key(|s| (s.status != ServerStatus::Primary, s.uuid));
        Ok(servers)
    }

    /// The PRIMARY of a group, or a GroupError when it has none.
    pub fn master_of(&self, group_id: &str) -> Result<Server, FabricError> {
        let group = self.lookup_group(group_id)?;
        let master = group
            .master
            .ok_or_else(|| FabricError::Group(format!("group {group_id} has no master")))?;
        self.registry.lookup(master)
    }

    /// Adds the server at `address` to a group as a SECONDARY. When the
    /// group already has a master, the new member is pointed at it and
    /// starts replicating; otherwise it sits idle until a promotion.
    pub async fn add_server(&self, group_id: &str, address: &str) -> Result<Uuid, FabricError> {
        let mut group = self.lookup_group(group_id)?;
        let uuid = self
            .registry
            .discover_uuid(address, &self.credentials.user, &self.credentials.passwd)
            .await?;

        for other in self.groups() {
            if other.servers.contains(&uuid) {
                return Err(FabricError::Group(format!(
                    "server {uuid} is already a member of group {}",
                    other.group_id
                )));
            }
        }

        let server = Server {
            uuid,
            address: address.to_string(),
            user: self.credentials.user.clone(),
            passwd: self.credentials.passwd.clone(),
            status: ServerStatus::Secondary,
            mode: ServerMode::ReadOnly,
        };
        self.registry.add(server).await?;

        if let Some(master_uuid) = group.master {
            let master = self.registry.lookup(master_uuid)?;
            let conn = self.registry.connect(uuid).await?;
            conn.set_mode(ServerMode::ReadOnly).await?;
            conn.change_master_to(&MasterInfo {
                address: master.address.clone(),
                user: master.user.clone(),
                passwd: master.passwd.clone(),
            })
            .await?;
            conn.start_replication().await?;
        }

        group.servers.insert(uuid);
        self.persist_group(group).await?;
        info!("server {uuid} at {address} joined group {group_id}");
        Ok(uuid)
    }

    /// Removes a member. The current master cannot be removed; demote or
    /// promote first.
    pub async fn remove_server(&self, group_id: &str, uuid: Uuid) -> Result<(), FabricError> {
        let mut group = self.lookup_group(group_id)?;
        if !group.servers.contains(&uuid) {
            return Err(FabricError::Group(format!(
                "server {uuid} is not a member of group {group_id}"
            )));
        }
        if group.master == Some(uuid) {
            return Err(FabricError::Group(format!(
                "server {uuid} is the master of group {group_id}; demote it first"
            )));
        }
        if let Ok(conn) = self.registry.connect(uuid).await {
            // Best effort: a dead server can still be removed.
            let _ = conn.stop_replication().await;
            let _ = conn.reset_replication().await;
        }
        group.servers.remove(&uuid);
        self.persist_group(group).await?;
        self.registry.remove(uuid).await?;
        Ok(())
    }

    /// Points `target_group`'s master at `source_group`'s master so writes
    /// on the source fan out to the target. This is how the global group's
    /// writes reach every shard group.
    pub async fn setup_group_replication(
        &self,
        source_group: &str,
        target_group: &str,
    ) -> Result<(), FabricError> {
        if source_group == target_group {
            return Ok(());
        }
        let source_master = self.master_of(source_group)?;
        let target_master = self.master_of(target_group)?;
        let conn = self.registry.connect(target_master.uuid).await?;
        conn.change_master_to(&MasterInfo {
            address: source_master.address.clone(),
            user: source_master.user.clone(),
            passwd: source_master.passwd.clone(),
        })
        .await?;
        conn.start_replication().await?;
        info!(
            "group {target_group} now replicates from {source_group} \
             ({} -> {})",
            source_master.address, target_master.address
        );
        Ok(())
    }

    /// Persists a group record, write-through.
    pub(crate) async fn persist_group(&self, group: Group) -> Result<(), FabricError> {
        let mut txn = self.store.begin().await;
        write_entity(
            txn.as_mut(),
            entities::tables::GROUPS,
            &group.group_id,
            &group,
        )
        .await?;
        txn.commit().await?;
        self.cache.insert(group.group_id.clone(), group);
        Ok(())
    }

    /// Updates one member's status and mode in the registry.
    pub(crate) async fn set_server_state(
        &self,
        uuid: Uuid,
        status: ServerStatus,
        mode: ServerMode,
    ) -> Result<(), FabricError> {
        let mut server = self.registry.lookup(uuid)?;
        server.status = status;
        server.mode = mode;
        self.registry.update(server).await
    }

    /// Startup reconciliation: for the PRIMARY invariant the remote
    /// replication state is authoritative, so metadata is rewritten to match
    /// whatever topology the reachable members actually form.
    pub async fn reconcile(&self) -> Result<(), FabricError> {
        for group in self.groups() {
            let mut actual_master: Option<Uuid> = None;
            for uuid in &group.servers {
                let Ok(conn) = self.registry.connect(*uuid).await else {
                    continue;
                };
                let Ok(status) = conn.replication_status().await else {
                    continue;
                };
                let Ok(mode) = conn.mode().await else {
                    continue;
                };
                if status.master_address.is_none() && mode == ServerMode::ReadWrite {
                    actual_master = Some(*uuid);
                }
            }
            if group.master != actual_master {
                warn!(
                    "group {}: metadata master {:?} disagrees with replication state {:?}; \
                     adopting remote state",
                    group.group_id, group.master, actual_master
                );
                let mut fixed = group.clone();
                fixed.master = actual_master;
                if let Some(master) = actual_master {
                    self.set_server_state(master, ServerStatus::Primary, ServerMode::ReadWrite)
                        .await?;
                }
                for uuid in fixed.servers.clone() {
                    if Some(uuid) != actual_master {
                        let server = self.registry.lookup(uuid)?;
                        if server.status == ServerStatus::Primary {
                            self.set_server_state(
                                uuid,
                                ServerStatus::Secondary,
                                ServerMode::ReadOnly,
                            )
                            .await?;
                        }
                    }
                }
                self.persist_group(fixed).await?;
            }
        }
        Ok(())
    }
}

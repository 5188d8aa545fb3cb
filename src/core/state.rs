// src/core/state.rs

//! The shared application state: every process-wide service object, built
//! once at startup in dependency order and handed around as one `Arc`.

use crate::config::Config;
use crate::core::conn::Connector;
use crate::core::errors::FabricError;
use crate::core::events::{EventBus, SERVER_LOST, SERVER_PROMOTED, Subscriber};
use crate::core::executor::Executor;
use crate::core::groups::promote::ChangeoverDeps;
use crate::core::groups::{GroupManager, ServerCredentials, promote};
use crate::core::registry::ServerRegistry;
use crate::core::sharding::ShardingCatalog;
use crate::core::sharding::lifecycle::LifecycleDeps;
use crate::core::store::MetadataStore;
use crate::core::store::entities::GroupStatus;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// The process-wide singletons. Construction follows the fixed order
/// store -> registry -> groups -> catalog -> executor -> events; teardown
/// reverses it in [`FabricState::shutdown`].
pub struct FabricState {
    pub config: Config,
    pub store: Arc<dyn MetadataStore>,
    pub registry: Arc<ServerRegistry>,
    pub groups: Arc<GroupManager>,
    pub catalog: Arc<ShardingCatalog>,
    pub executor: Arc<Executor>,
    pub events: Arc<EventBus>,
}

impl FabricState {
    pub fn initialize(
        config: Config,
        store: Arc<dyn MetadataStore>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let registry = Arc::new(ServerRegistry::new(
            store.clone(),
            connector,
            config.servers.connections,
        ));
        let groups = Arc::new(GroupManager::new(
            store.clone(),
            registry.clone(),
            ServerCredentials {
                user: config.servers.user.clone(),
                passwd: config.servers.password.clone(),
            },
        ));
        let catalog = Arc::new(ShardingCatalog::new(store.clone(), groups.clone()));
        let executor = Executor::new(store.clone(), config.executor.nworkers);
        let events = Arc::new(EventBus::new(executor.clone()));
        registry.set_event_bus(events.clone());

        let state = Arc::new(Self {
            config,
            store,
            registry,
            groups,
            catalog,
            executor,
            events,
        });
        state.install_reactors();
        state
    }

    /// Warms the write-through caches from the metadata store.
    pub async fn load_caches(&self) -> Result<(), FabricError> {
        self.registry.load().await?;
        self.groups.load().await?;
        self.catalog.load().await
    }

    /// The dependency bundle handed to master-changeover procedures.
    pub fn changeover_deps(&self) -> ChangeoverDeps {
        ChangeoverDeps {
            store: self.store.clone(),
            groups: self.groups.clone(),
            events: self.events.clone(),
            catchup_timeout: self.config.groups.catchup_timeout,
            failover_jitter: self.config.groups.failover_jitter,
        }
    }

    /// The dependency bundle handed to shard lifecycle procedures.
    pub fn lifecycle_deps(&self) -> LifecycleDeps {
        LifecycleDeps {
            store: self.store.clone(),
            catalog: self.catalog.clone(),
            groups: self.groups.clone(),
            events: self.events.clone(),
            catchup_timeout: self.config.groups.catchup_timeout,
            shard_busy_wait: self.config.sharding.shard_busy_wait,
        }
    }

    /// Registers the daemon's own event reactions: losing a group's master
    /// starts an unattended fail-over (gated on the group being ACTIVE),
    /// and any promotion repairs the global-to-shard replication fan-out.
    fn install_reactors(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let reactor = Subscriber::new("_fail_over_on_server_lost", move |args| {
            let weak = weak.clone();
            async move {
                let Some(state) = weak.upgrade() else {
                    return Ok(());
                };
                let lost: Uuid = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        FabricError::InvalidRequest("SERVER_LOST without a server uuid".into())
                    })?
                    .parse()?;
                for group in state.groups.groups() {
                    if group.status == GroupStatus::Active && group.master == Some(lost) {
                        info!(
                            "master {lost} of group {} reported lost; starting fail-over",
                            group.group_id
                        );
                        state.executor.schedule(promote::fail_over(
                            state.changeover_deps(),
                            group.group_id.clone(),
                        ))?;
                    }
                }
                Ok(())
            }
        });
        if let Err(e) = self.events.register(&SERVER_LOST, vec![reactor]) {
            warn!("failed to install SERVER_LOST reactor: {e}");
        }

        // A promotion anywhere can invalidate the global-to-shard fan-out:
        // a new global master must feed every shard group, and a shard
        // group's new master must resume feeding from the global group.
        let weak = Arc::downgrade(self);
        let repair = Subscriber::new("_restore_shard_replication", move |args| {
            let weak = weak.clone();
            async move {
                let Some(state) = weak.upgrade() else {
                    return Ok(());
                };
                let Some(group_id) = args.get(1).and_then(|v| v.as_str()).map(str::to_string)
                else {
                    return Ok(());
                };
                for mapping in state.catalog.mappings() {
                    for shard in state.catalog.shards_of(mapping.mapping_id) {
                        let pair = if mapping.global_group_id == group_id {
                            Some((group_id.clone(), shard.group_id.clone()))
                        } else if shard.group_id == group_id {
                            Some((mapping.global_group_id.clone(), group_id.clone()))
                        } else {
                            None
                        };
                        if let Some((source, target)) = pair
                            && let Err(e) =
                                state.groups.setup_group_replication(&source, &target).await
                        {
                            warn!(
                                "could not restore replication {source} -> {target} \
                                 after promotion: {e}"
                            );
                        }
                    }
                }
                Ok(())
            }
        });
        if let Err(e) = self.events.register(&SERVER_PROMOTED, vec![repair]) {
            warn!("failed to install SERVER_PROMOTED reactor: {e}");
        }
    }

    /// Drains the executor and tears the services down in reverse of the
    /// initialization order.
    pub async fn shutdown(&self) {
        self.executor
            .shutdown(self.config.executor.shutdown_timeout)
            .await;
        info!("executor drained; fabric state shut down");
    }
}

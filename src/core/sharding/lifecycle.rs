// src/core/sharding/lifecycle.rs

//! The shard lifecycle protocols: move, split, and prune. Each is a
//! procedure whose actions choreograph replication reconfiguration, data
//! movement, and pruning across the involved groups, with compensating
//! undos so a failure midway leaves the shard serving where it was.

use super::catalog::ShardingCatalog;
use super::lookup::{KeyPredicate, KeyRange, parse_bound};
use crate::core::conn::{MasterInfo, PooledConn, Statement};
use crate::core::errors::FabricError;
use crate::core::events::{EventBus, SHARD_MOVED, SHARD_SPLIT};
use crate::core::executor::procedure::{Action, Procedure};
use crate::core::groups::GroupManager;
use crate::core::store::AdvisoryLockGuard;
use crate::core::store::MetadataStore;
use crate::core::store::entities::{Server, ShardState, ShardingType, TableName};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Everything a lifecycle procedure needs, cloned into its actions.
#[derive(Clone)]
pub struct LifecycleDeps {
    pub store: Arc<dyn MetadataStore>,
    pub catalog: Arc<ShardingCatalog>,
    pub groups: Arc<GroupManager>,
    pub events: Arc<EventBus>,
    pub catchup_timeout: Duration,
    /// Whether a procedure waits for a busy shard or fails with ShardBusy.
    pub shard_busy_wait: bool,
}

impl LifecycleDeps {
    async fn master_conn(&self, group_id: &str) -> Result<(Server, PooledConn), FabricError> {
        let master = self.groups.master_of(group_id)?;
        let conn = self.groups.registry().connect(master.uuid).await?;
        Ok((master, conn))
    }

    /// Serializes concurrent lifecycle operations on one shard.
    async fn lock_shard(&self, shard_id: u64) -> Result<AdvisoryLockGuard, FabricError> {
        self.store
            .advisory_lock(
                &format!("shard/{shard_id}"),
                self.shard_busy_wait,
                FabricError::ShardBusy(shard_id),
            )
            .await
    }
}

/// Row filter selecting the rows a shard owns, digest-based for HASH.
fn member_predicate(sharding_type: ShardingType, range: &KeyRange) -> KeyPredicate {
    match sharding_type {
        ShardingType::Hash => KeyPredicate::HashInRange(range.clone()),
        _ => KeyPredicate::InRange(range.clone()),
    }
}

/// Row filter selecting the rows a shard does NOT own.
fn stranger_predicate(sharding_type: ShardingType, range: &KeyRange) -> KeyPredicate {
    match sharding_type {
        ShardingType::Hash => KeyPredicate::HashNotInRange(range.clone()),
        _ => KeyPredicate::NotInRange(range.clone()),
    }
}

#[derive(Default)]
struct TransferCtx {
    lock: Option<AdvisoryLockGuard>,
    prior_state: Option<ShardState>,
    src_group: String,
    copied_tables: Vec<TableName>,
    replication_configured: bool,
    /// Split only: the shard created for the upper half.
    new_shard_id: Option<u64>,
}

type SharedCtx = Arc<Mutex<TransferCtx>>;

/// Builds the shard-move procedure (§ sharding.move_shard). With
/// `update_only` no data is transferred: only the metadata binding changes.
pub fn move_shard(
    deps: LifecycleDeps,
    shard_id: u64,
    dest_group: String,
    update_only: bool,
) -> Procedure {
    let ctx: SharedCtx = Arc::default();

    let check = {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let dest_group = dest_group.clone();
        let undo_ctx = ctx.clone();
        Action::new("_check_shard_move", move || {
            let deps = deps.clone();
            let ctx = ctx.clone();
            let dest_group = dest_group.clone();
            async move {
                let shard = deps.catalog.shard(shard_id)?;
                if shard.group_id == dest_group {
                    return Err(FabricError::Sharding(format!(
                        "shard {shard_id} already belongs to group {dest_group}"
                    )));
                }
                deps.groups.master_of(&dest_group)?;
                deps.groups.master_of(&shard.group_id)?;
                let lock = deps.lock_shard(shard_id).await?;
                let mut guard = ctx.lock();
                guard.lock = Some(lock);
                guard.prior_state = Some(shard.state);
                guard.src_group = shard.group_id;
                Ok(None)
            }
        })
        .with_undo(move || {
            let ctx = undo_ctx.clone();
            async move {
                ctx.lock().lock.take();
                Ok(None)
            }
        })
    };

    let lock_shard = lock_shard_action(deps.clone(), ctx.clone(), shard_id);
    let backup_restore = {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let dest_group = dest_group.clone();
        let undo_deps = deps.clone();
        let undo_ctx = ctx.clone();
        let undo_dest = dest_group.clone();
        Action::new("_backup_and_restore", move || {
            let deps = deps.clone();
            let ctx = ctx.clone();
            let dest_group = dest_group.clone();
            async move {
                if update_only {
                    return Ok(None);
                }
                copy_shard_tables(&deps, &ctx, shard_id, &dest_group).await?;
                Ok(None)
            }
        })
        .with_undo(move || {
            let deps = undo_deps.clone();
            let ctx = undo_ctx.clone();
            let dest_group = undo_dest.clone();
            async move {
                drop_copied_tables(&deps, &ctx, &dest_group).await;
                Ok(None)
            }
        })
    };

    let setup_switch =
        setup_shard_switch_action(deps.clone(), ctx.clone(), !update_only, shard_id, dest_group.clone());

    let catch_up = {
        let deps = deps.clone();
        let dest_group = dest_group.clone();
        Action::new("_catch_up", move || {
            let deps = deps.clone();
            let dest_group = dest_group.clone();
            async move {
                if update_only {
                    return Ok(None);
                }
                let mapping_id = deps.catalog.shard(shard_id)?.mapping_id;
                let mapping = deps.catalog.mapping(mapping_id)?;
                let (_, global_conn) = deps.master_conn(&mapping.global_group_id).await?;
                let position = global_conn.replication_status().await?.applied_position;
                let (_, dest_conn) = deps.master_conn(&dest_group).await?;
                dest_conn
                    .wait_for_position(position, deps.catchup_timeout)
                    .await?;
                Ok(None)
            }
        })
    };

    let commit = {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let dest_group = dest_group.clone();
        let undo_deps = deps.clone();
        let undo_ctx = ctx.clone();
        Action::new("_commit_move", move || {
            let deps = deps.clone();
            let dest_group = dest_group.clone();
            async move {
                deps.catalog
                    .rebind_shard(shard_id, &dest_group, ShardState::Enabled)
                    .await?;
                info!("shard {shard_id} is now owned by group {dest_group}");
                Ok(None)
            }
        })
        .with_undo(move || {
            let deps = undo_deps.clone();
            let ctx = undo_ctx.clone();
            async move {
                let (src_group, prior_state) = {
                    let guard = ctx.lock();
                    (guard.src_group.clone(), guard.prior_state)
                };
                if let Some(prior_state) = prior_state {
                    deps.catalog
                        .rebind_shard(shard_id, &src_group, prior_state)
                        .await?;
                }
                Ok(None)
            }
        })
    };

    let teardown = {
        let deps = deps.clone();
        let ctx = ctx.clone();
        Action::new("_teardown_source", move || {
            let deps = deps.clone();
            let ctx = ctx.clone();
            async move {
                if update_only {
                    return Ok(None);
                }
                // Dropping the moved tables makes stale reads at the old
                // location fail instead of serving forgotten data. Failures
                // here must not unwind a committed move.
                let src_group = ctx.lock().src_group.clone();
                let mapping_id = deps.catalog.shard(shard_id)?.mapping_id;
                match deps.master_conn(&src_group).await {
                    Ok((_, src_conn)) => {
                        for table in deps.catalog.tables_of(mapping_id) {
                            if let Err(e) = src_conn
                                .exec_stmt(Statement::DropTable {
                                    table: table.table.clone(),
                                })
                                .await
                            {
                                warn!(
                                    "failed to drop {} on old owner {src_group}: {e}",
                                    table.table
                                );
                            }
                        }
                    }
                    Err(e) => warn!("old owner {src_group} unreachable for teardown: {e}"),
                }
                Ok(None)
            }
        })
    };

    let report = {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let dest_group = dest_group.clone();
        Action::new("_report_shard_move", move || {
            let deps = deps.clone();
            let ctx = ctx.clone();
            let dest_group = dest_group.clone();
            async move {
                let src_group = {
                    let mut guard = ctx.lock();
                    guard.lock.take();
                    guard.src_group.clone()
                };
                deps.events.trigger(
                    &SHARD_MOVED,
                    vec![json!(shard_id), json!(src_group), json!(dest_group.clone())],
                )?;
                Ok(Some(json!({ "shard_id": shard_id, "group_id": dest_group })))
            }
        })
    };

    Procedure::new(format!("move_shard({shard_id}, {dest_group})"))
        .push(check)
        .push(lock_shard)
        .push(backup_restore)
        .push(setup_switch)
        .push(catch_up)
        .push(commit)
        .push(teardown)
        .push(report)
}

/// Builds the shard-split procedure (§ sharding.split): the keys at and
/// above `pivot` move to a new shard on `dest_group`.
pub fn split_shard(
    deps: LifecycleDeps,
    shard_id: u64,
    dest_group: String,
    pivot: String,
) -> Procedure {
    let ctx: SharedCtx = Arc::default();

    let check = {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let dest_group = dest_group.clone();
        let pivot = pivot.clone();
        let undo_ctx = ctx.clone();
        Action::new("_check_shard_split", move || {
            let deps = deps.clone();
            let ctx = ctx.clone();
            let dest_group = dest_group.clone();
            let pivot = pivot.clone();
            async move {
                let shard = deps.catalog.shard(shard_id)?;
                let mapping = deps.catalog.mapping(shard.mapping_id)?;
                if mapping.sharding_type == ShardingType::Hash {
                    return Err(FabricError::Sharding(
                        "HASH shards cannot be split at an explicit pivot".into(),
                    ));
                }
                let pivot_key = parse_bound(mapping.sharding_type, &pivot)?;
                let range = deps.catalog.owned_range(shard_id)?;
                let lower = range.lower.clone().ok_or_else(|| {
                    FabricError::Sharding(format!("shard {shard_id} has no lower bound"))
                })?;
                let inside_upper = range.upper.as_ref().is_none_or(|u| pivot_key < *u);
                if pivot_key <= lower || !inside_upper {
                    return Err(FabricError::Sharding(format!(
                        "pivot '{pivot}' is not strictly inside the range of shard {shard_id}"
                    )));
                }
                deps.groups.master_of(&dest_group)?;
                deps.groups.master_of(&shard.group_id)?;
                let lock = deps.lock_shard(shard_id).await?;
                let mut guard = ctx.lock();
                guard.lock = Some(lock);
                guard.prior_state = Some(shard.state);
                guard.src_group = shard.group_id;
                Ok(None)
            }
        })
        .with_undo(move || {
            let ctx = undo_ctx.clone();
            async move {
                ctx.lock().lock.take();
                Ok(None)
            }
        })
    };

    let lock_shard = lock_shard_action(deps.clone(), ctx.clone(), shard_id);

    let backup_restore = {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let dest_group = dest_group.clone();
        let undo_deps = deps.clone();
        let undo_ctx = ctx.clone();
        let undo_dest = dest_group.clone();
        Action::new("_backup_and_restore_split", move || {
            let deps = deps.clone();
            let ctx = ctx.clone();
            let dest_group = dest_group.clone();
            async move {
                copy_shard_tables(&deps, &ctx, shard_id, &dest_group).await?;
                Ok(None)
            }
        })
        .with_undo(move || {
            let deps = undo_deps.clone();
            let ctx = undo_ctx.clone();
            let dest_group = undo_dest.clone();
            async move {
                drop_copied_tables(&deps, &ctx, &dest_group).await;
                Ok(None)
            }
        })
    };

    let setup_switch =
        setup_shard_switch_action(deps.clone(), ctx.clone(), true, shard_id, dest_group.clone());

    let add_split = {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let dest_group = dest_group.clone();
        let pivot = pivot.clone();
        let undo_deps = deps.clone();
        let undo_ctx = ctx.clone();
        Action::new("_add_shard_split", move || {
            let deps = deps.clone();
            let ctx = ctx.clone();
            let dest_group = dest_group.clone();
            let pivot = pivot.clone();
            async move {
                let new_shard_id = deps
                    .catalog
                    .split_binding(shard_id, &pivot, &dest_group)
                    .await?;
                ctx.lock().new_shard_id = Some(new_shard_id);
                deps.events.trigger(
                    &SHARD_SPLIT,
                    vec![json!(shard_id), json!(new_shard_id)],
                )?;
                info!(
                    "shard {shard_id} split at '{pivot}': new shard {new_shard_id} on {dest_group}"
                );
                Ok(None)
            }
        })
        .with_undo(move || {
            let deps = undo_deps.clone();
            let ctx = undo_ctx.clone();
            async move {
                let (new_shard_id, prior_state) = {
                    let guard = ctx.lock();
                    (guard.new_shard_id, guard.prior_state)
                };
                if let (Some(new_shard_id), Some(prior_state)) = (new_shard_id, prior_state) {
                    deps.catalog
                        .unsplit_binding(shard_id, new_shard_id, prior_state)
                        .await?;
                }
                Ok(None)
            }
        })
    };

    let prune_after_split = {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let dest_group = dest_group.clone();
        let pivot = pivot.clone();
        Action::new("_prune_shard_tables_after_split", move || {
            let deps = deps.clone();
            let ctx = ctx.clone();
            let dest_group = dest_group.clone();
            let pivot = pivot.clone();
            async move {
                let shard = deps.catalog.shard(shard_id)?;
                let mapping = deps.catalog.mapping(shard.mapping_id)?;
                let pivot_key = parse_bound(mapping.sharding_type, &pivot)?;

                let (src_group, new_shard_id) = {
                    let guard = ctx.lock();
                    (guard.src_group.clone(), guard.new_shard_id)
                };
                let (_, src_conn) = deps.master_conn(&src_group).await?;
                let (_, dest_conn) = deps.master_conn(&dest_group).await?;
                let upper_half = KeyRange::new(Some(pivot_key.clone()), None);
                let lower_half = KeyRange::new(None, Some(pivot_key));
                for table in deps.catalog.tables_of(shard.mapping_id) {
                    src_conn
                        .exec_stmt(Statement::DeleteWhere {
                            table: table.table.clone(),
                            predicate: KeyPredicate::InRange(upper_half.clone()),
                        })
                        .await?;
                    dest_conn
                        .exec_stmt(Statement::DeleteWhere {
                            table: table.table.clone(),
                            predicate: KeyPredicate::InRange(lower_half.clone()),
                        })
                        .await?;
                }
                ctx.lock().lock.take();
                Ok(Some(json!({
                    "shard_id": shard_id,
                    "new_shard_id": new_shard_id,
                })))
            }
        })
    };

    Procedure::new(format!("split_shard({shard_id}, {dest_group}, {pivot})"))
        .push(check)
        .push(lock_shard)
        .push(backup_restore)
        .push(setup_switch)
        .push(add_split)
        .push(prune_after_split)
}

/// Builds the prune procedure (§ sharding.prune_shard): on every shard of
/// the table's mapping, deletes the rows whose key falls outside the
/// shard's range. Running it again is a no-op.
pub fn prune_shard(deps: LifecycleDeps, table: TableName) -> Procedure {
    Procedure::new(format!("prune_shard({table})"))
        .push(Action::new("_prune_shard_tables", move || {
            let deps = deps.clone();
            let table = table.clone();
            async move {
                let shard_table = deps.catalog.lookup_table(&table)?;
                let mapping = deps.catalog.mapping(shard_table.mapping_id)?;
                let mut pruned = 0u64;
                for shard in deps.catalog.shards_of(mapping.mapping_id) {
                    let range = deps.catalog.owned_range(shard.shard_id)?;
                    let predicate = stranger_predicate(mapping.sharding_type, &range);
                    let (_, conn) = deps.master_conn(&shard.group_id).await?;
                    let result = conn
                        .exec_stmt(Statement::DeleteWhere {
                            table: table.clone(),
                            predicate,
                        })
                        .await?;
                    pruned += result.count.unwrap_or(0);
                }
                Ok(Some(json!({ "rows_pruned": pruned })))
            }
        }))
}

/// The DISABLE step shared by move and split: fences routing before any
/// data is touched.
fn lock_shard_action(deps: LifecycleDeps, ctx: SharedCtx, shard_id: u64) -> Action {
    let undo_deps = deps.clone();
    let undo_ctx = ctx.clone();
    Action::new("_lock_shard", move || {
        let deps = deps.clone();
        async move {
            deps.catalog
                .set_shard_state(shard_id, ShardState::Disabled)
                .await?;
            Ok(None)
        }
    })
    .with_undo(move || {
        let deps = undo_deps.clone();
        let ctx = undo_ctx.clone();
        async move {
            let prior_state = ctx.lock().prior_state;
            if let Some(prior_state) = prior_state {
                deps.catalog.set_shard_state(shard_id, prior_state).await?;
            }
            Ok(None)
        }
    })
}

/// Points the destination group's master at the mapping's global group so
/// globally replicated writes keep fanning out to the shard's new home.
fn setup_shard_switch_action(
    deps: LifecycleDeps,
    ctx: SharedCtx,
    enabled: bool,
    shard_id: u64,
    dest_group: String,
) -> Action {
    let undo_deps = deps.clone();
    let undo_ctx = ctx.clone();
    let undo_dest = dest_group.clone();
    Action::new("_setup_shard_switch", move || {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let dest_group = dest_group.clone();
        async move {
            if !enabled {
                return Ok(None);
            }
            let mapping_id = deps.catalog.shard(shard_id)?.mapping_id;
            let mapping = deps.catalog.mapping(mapping_id)?;
            let (global_master, _) = deps.master_conn(&mapping.global_group_id).await?;
            let (_, dest_conn) = deps.master_conn(&dest_group).await?;
            dest_conn
                .change_master_to(&MasterInfo {
                    address: global_master.address.clone(),
                    user: global_master.user.clone(),
                    passwd: global_master.passwd.clone(),
                })
                .await?;
            dest_conn.start_replication().await?;
            ctx.lock().replication_configured = true;
            Ok(None)
        }
    })
    .with_undo(move || {
        let deps = undo_deps.clone();
        let ctx = undo_ctx.clone();
        let dest_group = undo_dest.clone();
        async move {
            if !ctx.lock().replication_configured {
                return Ok(None);
            }
            if let Ok((_, dest_conn)) = deps.master_conn(&dest_group).await {
                let _ = dest_conn.stop_replication().await;
                let _ = dest_conn.reset_replication().await;
            }
            Ok(None)
        }
    })
}

/// Dumps every table of the shard's mapping, filtered to the shard's key
/// range, from the source master and restores it on the destination master.
async fn copy_shard_tables(
    deps: &LifecycleDeps,
    ctx: &SharedCtx,
    shard_id: u64,
    dest_group: &str,
) -> Result<(), FabricError> {
    let shard = deps.catalog.shard(shard_id)?;
    let mapping = deps.catalog.mapping(shard.mapping_id)?;
    let range = deps.catalog.owned_range(shard_id)?;
    let predicate = member_predicate(mapping.sharding_type, &range);
    let src_group = ctx.lock().src_group.clone();
    let (_, src_conn) = deps.master_conn(&src_group).await?;
    let (_, dest_conn) = deps.master_conn(dest_group).await?;

    for table in deps.catalog.tables_of(mapping.mapping_id) {
        let dumped = src_conn
            .exec_stmt(Statement::Dump {
                table: table.table.clone(),
                predicate: predicate.clone(),
            })
            .await?;
        dest_conn
            .exec_stmt(Statement::Load {
                table: table.table.clone(),
                rows: dumped.rows,
            })
            .await?;
        ctx.lock().copied_tables.push(table.table.clone());
        info!(
            "copied {} to group {dest_group} for shard {shard_id}",
            table.table
        );
    }
    Ok(())
}

/// Best-effort removal of tables restored on the destination, for undo.
async fn drop_copied_tables(deps: &LifecycleDeps, ctx: &SharedCtx, dest_group: &str) {
    let copied = ctx.lock().copied_tables.clone();
    if copied.is_empty() {
        return;
    }
    match deps.master_conn(dest_group).await {
        Ok((_, conn)) => {
            for table in copied {
                if let Err(e) = conn.exec_stmt(Statement::DropTable { table }).await {
                    warn!("failed to drop restored table on {dest_group}: {e}");
                }
            }
        }
        Err(e) => warn!("destination {dest_group} unreachable while undoing restore: {e}"),
    }
}

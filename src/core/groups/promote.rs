// src/core/groups/promote.rs

//! The master-changeover protocols: attended promotion, demotion, and the
//! unattended fail-over reaction to SERVER_LOST. Each protocol is built as
//! a procedure whose actions carry compensating undos, so a failure midway
//! restores the replication topology that existed before the call.

use super::GroupManager;
use crate::core::conn::MasterInfo;
use crate::core::errors::FabricError;
use crate::core::events::{EventBus, SERVER_DEMOTED, SERVER_PROMOTED};
use crate::core::executor::procedure::{Action, Procedure};
use crate::core::store::entities::{Group, ServerMode, ServerStatus};
use crate::core::store::{AdvisoryLockGuard, MetadataStore};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Everything a changeover procedure needs, cloned into its actions.
#[derive(Clone)]
pub struct ChangeoverDeps {
    pub store: Arc<dyn MetadataStore>,
    pub groups: Arc<GroupManager>,
    pub events: Arc<EventBus>,
    pub catchup_timeout: Duration,
    pub failover_jitter: Duration,
}

impl ChangeoverDeps {
    /// Serializes concurrent changeovers on one group.
    async fn lock_group(&self, group_id: &str) -> Result<AdvisoryLockGuard, FabricError> {
        self.store
            .advisory_lock(
                &format!("group/{group_id}"),
                true,
                FabricError::Group(format!("group {group_id} is busy")),
            )
            .await
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// Attended switchover: the old master is healthy and gets demoted.
    Switch,
    /// Unattended fail-over: the old master may be unreachable.
    Failover,
}

/// State shared between the actions of one changeover procedure.
#[derive(Default)]
struct ChangeoverCtx {
    lock: Option<AdvisoryLockGuard>,
    old_master: Option<Uuid>,
    candidate: Option<Uuid>,
    master_position: u64,
    /// Snapshot taken before metadata is rewritten, for the undo path.
    prior_group: Option<Group>,
    /// Members already pointed at the candidate, in repointing order.
    repointed: Vec<Uuid>,
    candidate_changed: bool,
    old_master_blocked: bool,
}

type SharedCtx = Arc<Mutex<ChangeoverCtx>>;

/// Builds the attended promotion procedure (§ group.promote).
pub fn promote(deps: ChangeoverDeps, group_id: String, candidate: Option<Uuid>) -> Procedure {
    let ctx: SharedCtx = Arc::default();
    Procedure::new(format!("promote({group_id})"))
        .push(check_candidate_action(
            deps.clone(),
            ctx.clone(),
            group_id.clone(),
            candidate,
            Flavor::Switch,
        ))
        .push(block_write_action(deps.clone(), ctx.clone(), group_id.clone()))
        .push(catch_up_action(deps.clone(), ctx.clone(), group_id.clone()))
        .push(change_to_candidate_action(deps.clone(), ctx.clone()))
        .push(reconfigure_slaves_action(
            deps.clone(),
            ctx.clone(),
            group_id.clone(),
            Flavor::Switch,
        ))
        .push(update_metadata_action(
            deps.clone(),
            ctx.clone(),
            group_id.clone(),
            Flavor::Switch,
        ))
        .push(report_action(deps, ctx, group_id, true))
}

/// Builds the demotion procedure: the master becomes a SECONDARY and the
/// group runs without one (globally read-only) until the next promotion.
pub fn demote(deps: ChangeoverDeps, group_id: String) -> Procedure {
    let ctx: SharedCtx = Arc::default();

    let check = {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let group_id = group_id.clone();
        let undo_ctx = ctx.clone();
        Action::new("_check_group_demote", move || {
            let deps = deps.clone();
            let ctx = ctx.clone();
            let group_id = group_id.clone();
            async move {
                let lock = deps.lock_group(&group_id).await?;
                let master = deps.groups.master_of(&group_id)?;
                let mut guard = ctx.lock();
                guard.lock = Some(lock);
                guard.old_master = Some(master.uuid);
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

    let update_metadata = {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let group_id = group_id.clone();
        Action::new("_update_group_status_demote", move || {
            let deps = deps.clone();
            let ctx = ctx.clone();
            let group_id = group_id.clone();
            async move {
                let old_master = ctx.lock().old_master.ok_or_else(|| {
                    FabricError::Group("demotion lost track of the master".into())
                })?;
                let mut group = deps.groups.lookup_group(&group_id)?;
                ctx.lock().prior_group = Some(group.clone());
                group.master = None;
                deps.groups
                    .set_server_state(old_master, ServerStatus::Secondary, ServerMode::ReadOnly)
                    .await?;
                deps.groups.persist_group(group).await?;
                Ok(None)
            }
        })
    };

    Procedure::new(format!("demote({group_id})"))
        .push(check)
        .push(block_write_action(deps.clone(), ctx.clone(), group_id.clone()))
        .push(catch_up_action(deps.clone(), ctx.clone(), group_id.clone()))
        .push(update_metadata)
        .push(report_action(deps, ctx, group_id, false))
}

/// Builds the unattended fail-over procedure, the SERVER_LOST reaction.
/// There is no write barrier: the old master is presumed gone.
pub fn fail_over(deps: ChangeoverDeps, group_id: String) -> Procedure {
    let ctx: SharedCtx = Arc::default();
    Procedure::new(format!("fail_over({group_id})"))
        .push(check_candidate_action(
            deps.clone(),
            ctx.clone(),
            group_id.clone(),
            None,
            Flavor::Failover,
        ))
        .push(change_to_candidate_action(deps.clone(), ctx.clone()))
        .push(reconfigure_slaves_action(
            deps.clone(),
            ctx.clone(),
            group_id.clone(),
            Flavor::Failover,
        ))
        .push(update_metadata_action(
            deps.clone(),
            ctx.clone(),
            group_id.clone(),
            Flavor::Failover,
        ))
        .push(report_action(deps, ctx, group_id, true))
}

/// Picks the most caught-up eligible secondary; ties go to the lowest uuid.
async fn select_candidate(
    deps: &ChangeoverDeps,
    group: &Group,
    exclude: Option<Uuid>,
) -> Result<Uuid, FabricError> {
    let mut best: Option<(u64, Uuid)> = None;
    for uuid in &group.servers {
        if Some(*uuid) == exclude {
            continue;
        }
        let Ok(server) = deps.groups.registry().lookup(*uuid) else {
            continue;
        };
        if server.status != ServerStatus::Secondary {
            continue;
        }
        let Ok(conn) = deps.groups.registry().connect(*uuid).await else {
            continue;
        };
        let Ok(status) = conn.replication_status().await else {
            continue;
        };
        let position = status.applied_position;
        best = match best {
            None => Some((position, *uuid)),
            Some((best_pos, best_uuid)) => {
                if position > best_pos || (position == best_pos && *uuid < best_uuid) {
                    Some((position, *uuid))
                } else {
                    Some((best_pos, best_uuid))
                }
            }
        };
    }
    best.map(|(_, uuid)| uuid).ok_or_else(|| {
        FabricError::Group(format!(
            "group {} has no promotable secondary",
            group.group_id
        ))
    })
}

fn check_candidate_action(
    deps: ChangeoverDeps,
    ctx: SharedCtx,
    group_id: String,
    explicit: Option<Uuid>,
    flavor: Flavor,
) -> Action {
    let name = match flavor {
        Flavor::Switch => "_check_candidate_switch",
        Flavor::Failover => "_check_candidate_fail",
    };
    let undo_ctx = ctx.clone();
    Action::new(name, move || {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let group_id = group_id.clone();
        async move {
            let lock = deps.lock_group(&group_id).await?;
            ctx.lock().lock = Some(lock);

            if flavor == Flavor::Failover && !deps.failover_jitter.is_zero() {
                // Spread out concurrent reactors racing to the same group.
                let jitter_ms = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(0..deps.failover_jitter.as_millis().max(1) as u64)
                };
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }

            let group = deps.groups.lookup_group(&group_id)?;
            let old_master = group.master;

            if flavor == Flavor::Failover
                && let Some(old) = old_master
            {
                let server = deps.groups.registry().lookup(old)?;
                if server.status != ServerStatus::Faulty {
                    deps.groups
                        .set_server_state(old, ServerStatus::Faulty, ServerMode::Offline)
                        .await?;
                }
            }

            let candidate = match explicit {
                Some(uuid) => {
                    if !group.servers.contains(&uuid) {
                        return Err(FabricError::Group(format!(
                            "candidate {uuid} is not a member of group {group_id}"
                        )));
                    }
                    if Some(uuid) == old_master {
                        return Err(FabricError::Group(format!(
                            "candidate {uuid} is already the master of group {group_id}"
                        )));
                    }
                    // The candidate must be alive before anything is touched.
                    deps.groups.registry().connect(uuid).await?.ping().await?;
                    uuid
                }
                None => select_candidate(&deps, &group, old_master).await?,
            };

            let mut guard = ctx.lock();
            guard.old_master = old_master;
            guard.candidate = Some(candidate);
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
}

fn block_write_action(deps: ChangeoverDeps, ctx: SharedCtx, group_id: String) -> Action {
    let undo_deps = deps.clone();
    let undo_ctx = ctx.clone();
    Action::new("_block_write_switch", move || {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let group_id = group_id.clone();
        async move {
            let Some(old_master) = ctx.lock().old_master else {
                // First promotion of a fresh group: nothing to fence.
                return Ok(None);
            };
            let conn = deps.groups.registry().connect(old_master).await?;
            conn.set_mode(ServerMode::ReadOnly).await?;
            let position = conn.replication_status().await?.applied_position;
            let mut guard = ctx.lock();
            guard.master_position = position;
            guard.old_master_blocked = true;
            info!(
                "group {group_id}: master {old_master} fenced at position {position}"
            );
            Ok(None)
        }
    })
    .with_undo(move || {
        let deps = undo_deps.clone();
        let ctx = undo_ctx.clone();
        async move {
            let (old_master, blocked) = {
                let guard = ctx.lock();
                (guard.old_master, guard.old_master_blocked)
            };
            if let Some(old_master) = old_master
                && blocked
            {
                let conn = deps.groups.registry().connect(old_master).await?;
                conn.set_mode(ServerMode::ReadWrite).await?;
            }
            Ok(None)
        }
    })
}

fn catch_up_action(deps: ChangeoverDeps, ctx: SharedCtx, group_id: String) -> Action {
    Action::new("_wait_slaves_catch_up", move || {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let group_id = group_id.clone();
        async move {
            let (old_master, position) = {
                let guard = ctx.lock();
                (guard.old_master, guard.master_position)
            };
            if old_master.is_none() {
                return Ok(None);
            }
            let group = deps.groups.lookup_group(&group_id)?;
            for uuid in &group.servers {
                if Some(*uuid) == old_master {
                    continue;
                }
                let server = deps.groups.registry().lookup(*uuid)?;
                if server.status != ServerStatus::Secondary {
                    continue;
                }
                let conn = deps.groups.registry().connect(*uuid).await?;
                conn.wait_for_position(position, deps.catchup_timeout)
                    .await?;
            }
            Ok(None)
        }
    })
}

fn change_to_candidate_action(deps: ChangeoverDeps, ctx: SharedCtx) -> Action {
    let undo_deps = deps.clone();
    let undo_ctx = ctx.clone();
    Action::new("_change_to_candidate", move || {
        let deps = deps.clone();
        let ctx = ctx.clone();
        async move {
            let candidate = ctx.lock().candidate.ok_or_else(|| {
                FabricError::Group("changeover lost track of its candidate".into())
            })?;
            let conn = deps.groups.registry().connect(candidate).await?;
            conn.stop_replication().await?;
            conn.reset_replication().await?;
            conn.set_mode(ServerMode::ReadWrite).await?;
            ctx.lock().candidate_changed = true;
            Ok(None)
        }
    })
    .with_undo(move || {
        let deps = undo_deps.clone();
        let ctx = undo_ctx.clone();
        async move {
            let (candidate, old_master, changed) = {
                let guard = ctx.lock();
                (guard.candidate, guard.old_master, guard.candidate_changed)
            };
            let (Some(candidate), true) = (candidate, changed) else {
                return Ok(None);
            };
            let conn = deps.groups.registry().connect(candidate).await?;
            conn.set_mode(ServerMode::ReadOnly).await?;
            if let Some(old_master) = old_master {
                let master = deps.groups.registry().lookup(old_master)?;
                conn.change_master_to(&MasterInfo {
                    address: master.address.clone(),
                    user: master.user.clone(),
                    passwd: master.passwd.clone(),
                })
                .await?;
                conn.start_replication().await?;
            } else {
                conn.reset_replication().await?;
            }
            Ok(None)
        }
    })
}

fn reconfigure_slaves_action(
    deps: ChangeoverDeps,
    ctx: SharedCtx,
    group_id: String,
    flavor: Flavor,
) -> Action {
    let undo_deps = deps.clone();
    let undo_ctx = ctx.clone();
    Action::new("_reconfigure_slaves", move || {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let group_id = group_id.clone();
        async move {
            let (candidate, old_master) = {
                let guard = ctx.lock();
                (guard.candidate, guard.old_master)
            };
            let candidate = candidate.ok_or_else(|| {
                FabricError::Group("changeover lost track of its candidate".into())
            })?;
            let new_master = deps.groups.registry().lookup(candidate)?;
            let group = deps.groups.lookup_group(&group_id)?;

            for uuid in &group.servers {
                if *uuid == candidate {
                    continue;
                }
                let conn = match deps.groups.registry().connect(*uuid).await {
                    Ok(conn) => conn,
                    Err(e) if flavor == Flavor::Failover => {
                        warn!(
                            "group {group_id}: skipping unreachable member {uuid} \
                             during fail-over: {e}"
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                conn.set_mode(ServerMode::ReadOnly).await?;
                conn.change_master_to(&MasterInfo {
                    address: new_master.address.clone(),
                    user: new_master.user.clone(),
                    passwd: new_master.passwd.clone(),
                })
                .await?;
                conn.start_replication().await?;
                ctx.lock().repointed.push(*uuid);
                if Some(*uuid) == old_master {
                    info!("group {group_id}: old master {uuid} now replicates from {candidate}");
                }
            }
            Ok(None)
        }
    })
    .with_undo(move || {
        let deps = undo_deps.clone();
        let ctx = undo_ctx.clone();
        async move {
            let (old_master, repointed) = {
                let guard = ctx.lock();
                (guard.old_master, guard.repointed.clone())
            };
            for uuid in repointed {
                let Ok(conn) = deps.groups.registry().connect(uuid).await else {
                    continue;
                };
                match old_master {
                    Some(old) if old != uuid => {
                        let master = deps.groups.registry().lookup(old)?;
                        let _ = conn
                            .change_master_to(&MasterInfo {
                                address: master.address.clone(),
                                user: master.user.clone(),
                                passwd: master.passwd.clone(),
                            })
                            .await;
                        let _ = conn.start_replication().await;
                    }
                    _ => {
                        let _ = conn.stop_replication().await;
                        let _ = conn.reset_replication().await;
                    }
                }
            }
            Ok(None)
        }
    })
}

fn update_metadata_action(
    deps: ChangeoverDeps,
    ctx: SharedCtx,
    group_id: String,
    flavor: Flavor,
) -> Action {
    let undo_deps = deps.clone();
    let undo_ctx = ctx.clone();
    Action::new("_update_group_status", move || {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let group_id = group_id.clone();
        async move {
            let (candidate, old_master) = {
                let guard = ctx.lock();
                (guard.candidate, guard.old_master)
            };
            let candidate = candidate.ok_or_else(|| {
                FabricError::Group("changeover lost track of its candidate".into())
            })?;
            let mut group = deps.groups.lookup_group(&group_id)?;
            ctx.lock().prior_group = Some(group.clone());

            deps.groups
                .set_server_state(candidate, ServerStatus::Primary, ServerMode::ReadWrite)
                .await?;
            if let Some(old) = old_master
                && flavor == Flavor::Switch
            {
                deps.groups
                    .set_server_state(old, ServerStatus::Secondary, ServerMode::ReadOnly)
                    .await?;
            }
            group.master = Some(candidate);
            deps.groups.persist_group(group).await?;
            Ok(None)
        }
    })
    .with_undo(move || {
        let deps = undo_deps.clone();
        let ctx = undo_ctx.clone();
        async move {
            let (candidate, old_master, prior) = {
                let guard = ctx.lock();
                (guard.candidate, guard.old_master, guard.prior_group.clone())
            };
            let Some(prior) = prior else { return Ok(None) };
            if let Some(candidate) = candidate {
                deps.groups
                    .set_server_state(candidate, ServerStatus::Secondary, ServerMode::ReadOnly)
                    .await?;
            }
            if let Some(old) = old_master {
                deps.groups
                    .set_server_state(old, ServerStatus::Primary, ServerMode::ReadWrite)
                    .await?;
            }
            deps.groups.persist_group(prior).await?;
            Ok(None)
        }
    })
}

fn report_action(
    deps: ChangeoverDeps,
    ctx: SharedCtx,
    group_id: String,
    promoted: bool,
) -> Action {
    let name = if promoted {
        "_report_promotion"
    } else {
        "_report_demotion"
    };
    Action::new(name, move || {
        let deps = deps.clone();
        let ctx = ctx.clone();
        let group_id = group_id.clone();
        async move {
            let (candidate, old_master) = {
                let mut guard = ctx.lock();
                guard.lock.take();
                (guard.candidate, guard.old_master)
            };
            if promoted {
                let candidate = candidate.ok_or_else(|| {
                    FabricError::Group("changeover lost track of its candidate".into())
                })?;
                deps.events.trigger(
                    &SERVER_PROMOTED,
                    vec![json!(candidate.to_string()), json!(group_id.clone())],
                )?;
                if let Some(old) = old_master {
                    deps.events.trigger(
                        &SERVER_DEMOTED,
                        vec![json!(old.to_string()), json!(group_id.clone())],
                    )?;
                }
                Ok(Some(json!({ "master_uuid": candidate.to_string() })))
            } else {
                if let Some(old) = old_master {
                    deps.events.trigger(
                        &SERVER_DEMOTED,
                        vec![json!(old.to_string()), json!(group_id.clone())],
                    )?;
                }
                Ok(None)
            }
        }
    })
}

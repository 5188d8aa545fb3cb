// src/server/dispatch.rs

//! The command registry: an explicit table of `(namespace, method)` to
//! handler, populated at startup. Every handler returns the uniform
//! `(summary, steps, return_value)` procedure status, whether the command
//! ran a multi-step protocol or a single metadata update.

use crate::core::errors::FabricError;
use crate::core::events::EventArgs;
use crate::core::executor::procedure::{
    Action, ActionResult, Procedure, ProcedureState, ProcedureStatus, StepReport, StepState,
};
use crate::core::groups::promote;
use crate::core::sharding::lifecycle;
use crate::core::sharding::lookup::ShardingKey;
use crate::core::sharding::LookupTarget;
use crate::core::state::FabricState;
use crate::core::store::entities::{
    GroupStatus, LookupHint, Server, ShardState, ShardingType, TableName,
};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Positional command arguments as delivered by the transport.
#[derive(Debug, Clone, Default)]
pub struct CommandArgs(pub Vec<Value>);

impl CommandArgs {
    fn require(&self, idx: usize, command: &str) -> Result<&Value, FabricError> {
        self.0
            .get(idx)
            .ok_or_else(|| FabricError::WrongArgumentCount(command.to_string()))
    }

    pub fn str_arg(&self, idx: usize, command: &str) -> Result<String, FabricError> {
        match self.require(idx, command)? {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(FabricError::InvalidRequest(format!(
                "argument {idx} of {command} must be a string, got {other}"
            ))),
        }
    }

    pub fn opt_str_arg(&self, idx: usize) -> Option<String> {
        match self.0.get(idx) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn u64_arg(&self, idx: usize, command: &str) -> Result<u64, FabricError> {
        let value = self.require(idx, command)?;
        match value {
            Value::Number(n) => n.as_u64().ok_or_else(|| {
                FabricError::InvalidRequest(format!(
                    "argument {idx} of {command} must be a non-negative integer"
                ))
            }),
            Value::String(s) => s.trim().parse().map_err(|_| {
                FabricError::InvalidRequest(format!(
                    "argument {idx} of {command} must be an integer, got '{s}'"
                ))
            }),
            other => Err(FabricError::InvalidRequest(format!(
                "argument {idx} of {command} must be an integer, got {other}"
            ))),
        }
    }

    pub fn uuid_arg(&self, idx: usize, command: &str) -> Result<Uuid, FabricError> {
        Ok(self.str_arg(idx, command)?.parse()?)
    }

    pub fn opt_bool_arg(&self, idx: usize) -> bool {
        matches!(self.0.get(idx), Some(Value::Bool(true)))
    }

    /// A shard key: JSON numbers become integer keys, strings stay strings.
    pub fn key_arg(&self, idx: usize) -> Option<ShardingKey> {
        match self.0.get(idx) {
            Some(Value::Number(n)) => n.as_i64().map(ShardingKey::Int),
            Some(Value::String(s)) => Some(ShardingKey::Str(s.clone())),
            _ => None,
        }
    }

    pub fn rest(&self, from: usize) -> Vec<Value> {
        self.0.iter().skip(from).cloned().collect()
    }
}

pub type HandlerResult = Result<ProcedureStatus, FabricError>;
type Handler =
    Arc<dyn Fn(Arc<FabricState>, CommandArgs) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub struct CommandRegistry {
    handlers: IndexMap<String, Handler>,
}

impl CommandRegistry {
    /// Builds the registry with every built-in namespace populated.
    pub fn builtin() -> Self {
        let mut registry = Self {
            handlers: IndexMap::new(),
        };
        registry.register("group", "create", wrap(group_create));
        registry.register("group", "add", wrap(group_add));
        registry.register("group", "remove", wrap(group_remove));
        registry.register("group", "promote", wrap(group_promote));
        registry.register("group", "demote", wrap(group_demote));
        registry.register("group", "destroy", wrap(group_destroy));
        registry.register("group", "lookup_servers", wrap(group_lookup_servers));
        registry.register("group", "activate", wrap(group_activate));
        registry.register("group", "deactivate", wrap(group_deactivate));
        registry.register("server", "lookup_uuid", wrap(server_lookup_uuid));
        registry.register("sharding", "create_definition", wrap(sharding_create_definition));
        registry.register("sharding", "add_table", wrap(sharding_add_table));
        registry.register("sharding", "add_shard", wrap(sharding_add_shard));
        registry.register("sharding", "lookup_table", wrap(sharding_lookup_table));
        registry.register("sharding", "lookup_servers", wrap(sharding_lookup_servers));
        registry.register("sharding", "move_shard", wrap(sharding_move_shard));
        registry.register("sharding", "split", wrap(sharding_split));
        registry.register("sharding", "prune_shard", wrap(sharding_prune_shard));
        registry.register("sharding", "enable_shard", wrap(sharding_enable_shard));
        registry.register("sharding", "disable_shard", wrap(sharding_disable_shard));
        registry.register("sharding", "remove_shard", wrap(sharding_remove_shard));
        registry.register("event", "trigger", wrap(event_trigger));
        registry.register("event", "wait_for", wrap(event_wait_for));
        registry.register("manage", "ping", wrap(manage_ping));
        registry
    }

    fn register(&mut self, namespace: &str, method: &str, handler: Handler) {
        self.handlers
            .insert(format!("{namespace}.{method}"), handler);
    }

    pub fn methods(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub async fn dispatch(
        &self,
        state: Arc<FabricState>,
        namespace: &str,
        method: &str,
        args: CommandArgs,
    ) -> HandlerResult {
        let key = format!("{namespace}.{method}");
        let handler = self
            .handlers
            .get(&key)
            .ok_or_else(|| FabricError::UnknownCommand(key.clone()))?
            .clone();
        handler(state, args).await
    }
}

fn wrap<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<FabricState>, CommandArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |state, args| Box::pin(f(state, args)))
}

/// Runs one closure as a single-action procedure so the caller gets the
/// uniform status shape with per-step diagnosis.
async fn run_single<F, Fut>(
    state: Arc<FabricState>,
    title: String,
    action_name: &str,
    body: F,
) -> HandlerResult
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    state
        .executor
        .run_sync(Procedure::new(title).push(Action::new(action_name, body)))
        .await
}

/// A status for commands that execute inline rather than on the executor.
fn synthetic_status(title: &str, action_name: &str, return_value: Option<Value>) -> ProcedureStatus {
    ProcedureStatus {
        procedure_id: Uuid::new_v4(),
        title: title.to_string(),
        state: ProcedureState::Complete,
        success: true,
        steps: vec![StepReport {
            state: StepState::Complete,
            success: true,
            description: format!("Executed action ({action_name})."),
            diagnosis: String::new(),
        }],
        return_value,
    }
}

fn server_row(server: &Server) -> Value {
    json!({
        "server_uuid": server.uuid.to_string(),
        "address": server.address,
        "status": server.status.to_string(),
        "mode": server.mode.to_string(),
    })
}

// --- group.* ---

async fn group_create(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let group_id = args.str_arg(0, "group.create")?;
    let description = args.opt_str_arg(1).unwrap_or_default();
    let title = format!("group.create({group_id})");
    run_single(state.clone(), title, "_create_group", move || {
        let state = state.clone();
        let group_id = group_id.clone();
        let description = description.clone();
        async move {
            state.groups.create_group(&group_id, &description).await?;
            Ok(None)
        }
    })
    .await
}

async fn group_add(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let group_id = args.str_arg(0, "group.add")?;
    let address = args.str_arg(1, "group.add")?;
    let title = format!("group.add({group_id}, {address})");
    run_single(state.clone(), title, "_add_server", move || {
        let state = state.clone();
        let group_id = group_id.clone();
        let address = address.clone();
        async move {
            let uuid = state.groups.add_server(&group_id, &address).await?;
            Ok(Some(json!({ "server_uuid": uuid.to_string() })))
        }
    })
    .await
}

async fn group_remove(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let group_id = args.str_arg(0, "group.remove")?;
    let uuid = args.uuid_arg(1, "group.remove")?;
    let title = format!("group.remove({group_id}, {uuid})");
    run_single(state.clone(), title, "_remove_server", move || {
        let state = state.clone();
        let group_id = group_id.clone();
        async move {
            state.groups.remove_server(&group_id, uuid).await?;
            Ok(None)
        }
    })
    .await
}

async fn group_promote(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let group_id = args.str_arg(0, "group.promote")?;
    let candidate = match args.opt_str_arg(1) {
        Some(raw) => Some(raw.parse::<Uuid>()?),
        None => None,
    };
    state
        .executor
        .run_sync(promote::promote(
            state.changeover_deps(),
            group_id,
            candidate,
        ))
        .await
}

async fn group_demote(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let group_id = args.str_arg(0, "group.demote")?;
    state
        .executor
        .run_sync(promote::demote(state.changeover_deps(), group_id))
        .await
}

async fn group_destroy(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let group_id = args.str_arg(0, "group.destroy")?;
    let title = format!("group.destroy({group_id})");
    run_single(state.clone(), title, "_destroy_group", move || {
        let state = state.clone();
        let group_id = group_id.clone();
        async move {
            state.groups.destroy_group(&group_id).await?;
            Ok(None)
        }
    })
    .await
}

async fn group_lookup_servers(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let group_id = args.str_arg(0, "group.lookup_servers")?;
    let title = format!("group.lookup_servers({group_id})");
    run_single(state.clone(), title, "_lookup_servers", move || {
        let state = state.clone();
        let group_id = group_id.clone();
        async move {
            let rows: Vec<Value> = state
                .groups
                .lookup_servers(&group_id)?
                .iter()
                .map(server_row)
                .collect();
            Ok(Some(Value::Array(rows)))
        }
    })
    .await
}

async fn group_activate(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    set_group_status(state, args, "group.activate", GroupStatus::Active).await
}

async fn group_deactivate(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    set_group_status(state, args, "group.deactivate", GroupStatus::Inactive).await
}

async fn set_group_status(
    state: Arc<FabricState>,
    args: CommandArgs,
    command: &str,
    status: GroupStatus,
) -> HandlerResult {
    let group_id = args.str_arg(0, command)?;
    let action_name = if status == GroupStatus::Active {
        "_activate_group"
    } else {
        "_deactivate_group"
    };
    let title = format!("{command}({group_id})");
    run_single(state.clone(), title, action_name, move || {
        let state = state.clone();
        let group_id = group_id.clone();
        async move {
            state.groups.set_group_status(&group_id, status).await?;
            Ok(None)
        }
    })
    .await
}

// --- server.* ---

async fn server_lookup_uuid(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let address = args.str_arg(0, "server.lookup_uuid")?;
    let title = format!("server.lookup_uuid({address})");
    run_single(state.clone(), title, "_lookup_uuid", move || {
        let state = state.clone();
        let address = address.clone();
        async move {
            let uuid = state
                .registry
                .discover_uuid(
                    &address,
                    &state.config.servers.user,
                    &state.config.servers.password,
                )
                .await?;
            Ok(Some(json!(uuid.to_string())))
        }
    })
    .await
}

// --- sharding.* ---

async fn sharding_create_definition(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let raw_type = args.str_arg(0, "sharding.create_definition")?;
    let global_group = args.str_arg(1, "sharding.create_definition")?;
    let sharding_type: ShardingType = raw_type
        .parse()
        .map_err(|_| FabricError::Sharding(format!("'{raw_type}' is not a sharding type")))?;
    let title = format!("sharding.create_definition({raw_type}, {global_group})");
    run_single(state.clone(), title, "_define_shard_mapping", move || {
        let state = state.clone();
        let global_group = global_group.clone();
        async move {
            let mapping_id = state
                .catalog
                .create_definition(sharding_type, &global_group)
                .await?;
            Ok(Some(json!(mapping_id)))
        }
    })
    .await
}

async fn sharding_add_table(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let mapping_id = args.u64_arg(0, "sharding.add_table")?;
    let table: TableName = args.str_arg(1, "sharding.add_table")?.parse()?;
    let key_column = args.str_arg(2, "sharding.add_table")?;
    let title = format!("sharding.add_table({mapping_id}, {table})");
    run_single(state.clone(), title, "_add_shard_mapping", move || {
        let state = state.clone();
        let table = table.clone();
        let key_column = key_column.clone();
        async move {
            state
                .catalog
                .add_table(mapping_id, table.clone(), &key_column)
                .await?;
            Ok(None)
        }
    })
    .await
}

async fn sharding_add_shard(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let mapping_id = args.u64_arg(0, "sharding.add_shard")?;
    let spec = args.str_arg(1, "sharding.add_shard")?;
    let raw_state = args
        .opt_str_arg(2)
        .unwrap_or_else(|| "DISABLED".to_string());
    let shard_state: ShardState = raw_state
        .parse()
        .map_err(|_| FabricError::Sharding(format!("'{raw_state}' is not a shard state")))?;
    let title = format!("sharding.add_shard({mapping_id}, {spec})");
    run_single(state.clone(), title, "_add_shard", move || {
        let state = state.clone();
        let spec = spec.clone();
        async move {
            let ids = state
                .catalog
                .add_shards(mapping_id, &spec, shard_state)
                .await?;
            Ok(Some(json!(ids)))
        }
    })
    .await
}

async fn sharding_lookup_table(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let table: TableName = args.str_arg(0, "sharding.lookup_table")?.parse()?;
    let title = format!("sharding.lookup_table({table})");
    run_single(state.clone(), title, "_lookup_shard_mapping", move || {
        let state = state.clone();
        let table = table.clone();
        async move {
            let record = state.catalog.lookup_table(&table)?;
            let mapping = state.catalog.mapping(record.mapping_id)?;
            Ok(Some(json!({
                "mapping_id": record.mapping_id,
                "table": record.table.to_string(),
                "key_column": record.key_column,
                "type": mapping.sharding_type.to_string(),
                "global_group_id": mapping.global_group_id,
            })))
        }
    })
    .await
}

/// `"db1.t1"` addresses a sharded table; anything else is a shard id.
fn parse_lookup_target(raw: &str) -> Result<LookupTarget, FabricError> {
    if raw.contains('.') {
        Ok(LookupTarget::Table(raw.parse()?))
    } else {
        Ok(LookupTarget::Shard(raw.trim().parse().map_err(|_| {
            FabricError::Sharding(format!("'{raw}' is neither a table nor a shard id"))
        })?))
    }
}

async fn sharding_lookup_servers(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let raw_target = args.str_arg(0, "sharding.lookup_servers")?;
    let target = parse_lookup_target(&raw_target)?;
    let key = args.key_arg(1);
    let hint: LookupHint = match args.opt_str_arg(2) {
        Some(raw) => raw
            .parse()
            .map_err(|_| FabricError::Sharding(format!("'{raw}' is not a lookup hint")))?,
        None => LookupHint::Local,
    };
    let title = format!("sharding.lookup_servers({raw_target})");
    run_single(state.clone(), title, "_lookup_shard_servers", move || {
        let state = state.clone();
        let target = target.clone();
        let key = key.clone();
        async move {
            // Integer keys may arrive as strings; coerce them for RANGE
            // mappings so bound comparisons stay numeric.
            let key = match (&key, &target) {
                (Some(ShardingKey::Str(s)), LookupTarget::Table(table)) => {
                    let mapping_id = state.catalog.lookup_table(table)?.mapping_id;
                    let mapping = state.catalog.mapping(mapping_id)?;
                    match (mapping.sharding_type, s.trim().parse::<i64>()) {
                        (ShardingType::Range, Ok(v)) => Some(ShardingKey::Int(v)),
                        _ => key.clone(),
                    }
                }
                _ => key.clone(),
            };
            let rows: Vec<Value> = state
                .catalog
                .lookup_servers(&target, key.as_ref(), hint)?
                .iter()
                .map(server_row)
                .collect();
            Ok(Some(Value::Array(rows)))
        }
    })
    .await
}

async fn sharding_move_shard(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let shard_id = args.u64_arg(0, "sharding.move_shard")?;
    let dest_group = args.str_arg(1, "sharding.move_shard")?;
    let update_only = args.opt_bool_arg(2);
    state
        .executor
        .run_sync(lifecycle::move_shard(
            state.lifecycle_deps(),
            shard_id,
            dest_group,
            update_only,
        ))
        .await
}

async fn sharding_split(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let shard_id = args.u64_arg(0, "sharding.split")?;
    let dest_group = args.str_arg(1, "sharding.split")?;
    let pivot = args.str_arg(2, "sharding.split")?;
    state
        .executor
        .run_sync(lifecycle::split_shard(
            state.lifecycle_deps(),
            shard_id,
            dest_group,
            pivot,
        ))
        .await
}

async fn sharding_prune_shard(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let table: TableName = args.str_arg(0, "sharding.prune_shard")?.parse()?;
    state
        .executor
        .run_sync(lifecycle::prune_shard(state.lifecycle_deps(), table))
        .await
}

async fn sharding_enable_shard(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    shard_state_command(state, args, "sharding.enable_shard", ShardState::Enabled).await
}

async fn sharding_disable_shard(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    shard_state_command(state, args, "sharding.disable_shard", ShardState::Disabled).await
}

async fn shard_state_command(
    state: Arc<FabricState>,
    args: CommandArgs,
    command: &str,
    shard_state: ShardState,
) -> HandlerResult {
    let shard_id = args.u64_arg(0, command)?;
    let action_name = if shard_state == ShardState::Enabled {
        "_enable_shard"
    } else {
        "_disable_shard"
    };
    let title = format!("{command}({shard_id})");
    run_single(state.clone(), title, action_name, move || {
        let state = state.clone();
        async move {
            state.catalog.set_shard_state(shard_id, shard_state).await?;
            Ok(None)
        }
    })
    .await
}

async fn sharding_remove_shard(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let shard_id = args.u64_arg(0, "sharding.remove_shard")?;
    let title = format!("sharding.remove_shard({shard_id})");
    run_single(state.clone(), title, "_remove_shard", move || {
        let state = state.clone();
        async move {
            state.catalog.remove_shard(shard_id).await?;
            Ok(None)
        }
    })
    .await
}

// --- event.* ---

async fn event_trigger(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    let name = args.str_arg(0, "event.trigger")?;
    let event_args: EventArgs = args.rest(1);
    let jobs = state.events.trigger_by_name(&name, event_args)?;
    let ids: Vec<Value> = jobs.iter().map(|id| json!(id.to_string())).collect();
    Ok(synthetic_status(
        &format!("event.trigger({name})"),
        "_trigger_event",
        Some(Value::Array(ids)),
    ))
}

async fn event_wait_for(state: Arc<FabricState>, args: CommandArgs) -> HandlerResult {
    // Accepts either a JSON array of ids or the ids as positional args.
    let raw_ids: Vec<Value> = match args.0.first() {
        Some(Value::Array(ids)) => ids.clone(),
        _ => args.0.clone(),
    };
    let mut ids = Vec::with_capacity(raw_ids.len());
    for raw in &raw_ids {
        let id: Uuid = raw
            .as_str()
            .ok_or_else(|| {
                FabricError::InvalidRequest("event.wait_for expects procedure ids".into())
            })?
            .parse()?;
        ids.push(id);
    }
    let statuses = state.executor.wait_for(&ids).await?;
    let rows: Vec<Value> = statuses
        .iter()
        .map(|s| {
            json!({
                "procedure_id": s.procedure_id.to_string(),
                "state": s.state.to_string(),
                "success": s.success,
            })
        })
        .collect();
    Ok(synthetic_status(
        "event.wait_for",
        "_wait_for_procedures",
        Some(Value::Array(rows)),
    ))
}

// --- manage.* ---

async fn manage_ping(_state: Arc<FabricState>, _args: CommandArgs) -> HandlerResult {
    Ok(synthetic_status("manage.ping", "_ping", Some(json!("pong"))))
}

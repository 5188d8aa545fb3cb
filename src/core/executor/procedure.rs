// src/core/executor/procedure.rs

//! Procedures and their actions: the unit of work the executor sequences.
//! An action is a forward closure with an optional compensating undo; a
//! procedure is an ordered list of actions plus the bookkeeping the status
//! API exposes.

use crate::core::errors::FabricError;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::sync::watch;
use uuid::Uuid;

pub type ActionResult = Result<Option<serde_json::Value>, FabricError>;
pub type ActionFn = Box<dyn Fn() -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// The lifecycle of a whole procedure.
#[derive(
    Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcedureState {
    Scheduled,
    Running,
    Complete,
    Undoing,
    Undone,
    Failed,
}

impl ProcedureState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcedureState::Complete | ProcedureState::Failed | ProcedureState::Undone
        )
    }
}

/// The lifecycle of one step inside a procedure.
#[derive(
    Serialize, Deserialize, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Scheduled,
    Running,
    Complete,
    Failed,
}

/// Per-step status, part of the wire contract of every command result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub state: StepState,
    pub success: bool,
    pub description: String,
    pub diagnosis: String,
}

impl StepReport {
    fn scheduled(action_name: &str) -> Self {
        Self {
            state: StepState::Scheduled,
            success: false,
            description: format!("Tried to execute action ({action_name})."),
            diagnosis: String::new(),
        }
    }
}

/// One unit of a procedure: a forward callable, an optional undo, and an
/// optional deadline checked around the forward phase.
pub struct Action {
    pub(crate) name: String,
    pub(crate) forward: ActionFn,
    pub(crate) undo: Option<ActionFn>,
    pub(crate) deadline: Option<Duration>,
}

impl Action {
    pub fn new<F, Fut>(name: impl Into<String>, forward: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            forward: Box::new(move || forward().boxed()),
            undo: None,
            deadline: None,
        }
    }

    pub fn with_undo<F, Fut>(mut self, undo: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        self.undo = Some(Box::new(move || undo().boxed()));
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A multi-step administrative operation, ready to be scheduled.
pub struct Procedure {
    pub id: Uuid,
    pub title: String,
    pub actions: Vec<Action>,
}

impl Procedure {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            actions: Vec::new(),
        }
    }

    pub fn push(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }
}

pub(crate) struct ProcedureInner {
    pub state: ProcedureState,
    /// Index of the next action to execute.
    pub cursor: usize,
    pub steps: Vec<StepReport>,
    pub return_value: Option<serde_json::Value>,
}

/// The executor-owned record of a scheduled procedure.
pub struct ProcedureRecord {
    pub id: Uuid,
    pub title: String,
    pub(crate) actions: Vec<Action>,
    pub(crate) inner: Mutex<ProcedureInner>,
    pub(crate) state_tx: watch::Sender<ProcedureState>,
}

impl ProcedureRecord {
    pub(crate) fn new(procedure: Procedure) -> Self {
        let steps = procedure
            .actions
            .iter()
            .map(|a| StepReport::scheduled(&a.name))
            .collect();
        let (state_tx, _) = watch::channel(ProcedureState::Scheduled);
        Self {
            id: procedure.id,
            title: procedure.title,
            actions: procedure.actions,
            inner: Mutex::new(ProcedureInner {
                state: ProcedureState::Scheduled,
                cursor: 0,
                steps,
                return_value: None,
            }),
            state_tx,
        }
    }

    pub(crate) fn set_state(&self, state: ProcedureState) {
        self.inner.lock().state = state;
        // Nobody listening is fine; wait_for subscribes lazily.
        let _ = self.state_tx.send(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcedureState> {
        self.state_tx.subscribe()
    }

    pub fn status(&self) -> ProcedureStatus {
        let inner = self.inner.lock();
        ProcedureStatus {
            procedure_id: self.id,
            title: self.title.clone(),
            state: inner.state,
            success: inner.state == ProcedureState::Complete,
            steps: inner.steps.clone(),
            return_value: inner.return_value.clone(),
        }
    }
}

/// A point-in-time view of a procedure, also the archival format. This is
/// what every command returns over the wire as `(summary, steps, result)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcedureStatus {
    pub procedure_id: Uuid,
    pub title: String,
    pub state: ProcedureState,
    pub success: bool,
    pub steps: Vec<StepReport>,
    pub return_value: Option<serde_json::Value>,
}

impl ProcedureStatus {
    /// The diagnosis of the first failed step, if any.
    pub fn first_failure(&self) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.state == StepState::Failed)
    }
}

// src/core/executor/mod.rs

//! The event/job executor. Procedures go through a FIFO queue onto a bounded
//! worker pool; actions within a procedure run sequentially, and a failing
//! action triggers the compensating undos of itself and every previously
//! completed action, in reverse order.

pub mod procedure;

use self::procedure::{
    Procedure, ProcedureRecord, ProcedureState, ProcedureStatus, StepState,
};
use crate::core::errors::FabricError;
use crate::core::store::entities::{self, AuditStep, ProcedureAudit};
use crate::core::store::{MetadataStore, write_entity};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct Executor {
    store: Arc<dyn MetadataStore>,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<Arc<ProcedureRecord>>>>,
    procedures: DashMap<Uuid, Arc<ProcedureRecord>>,
    workers: Mutex<JoinSet<()>>,
    shutting_down: AtomicBool,
}

impl Executor {
    /// Starts `nworkers` pool workers consuming the shared FIFO queue.
    pub fn new(store: Arc<dyn MetadataStore>, nworkers: usize) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<Arc<ProcedureRecord>>();
        let executor = Arc::new(Self {
            store,
            queue_tx: Mutex::new(Some(queue_tx)),
            procedures: DashMap::new(),
            workers: Mutex::new(JoinSet::new()),
            shutting_down: AtomicBool::new(false),
        });

        let queue_rx = Arc::new(AsyncMutex::new(queue_rx));
        let mut workers = executor.workers.lock();
        for worker_id in 0..nworkers.max(1) {
            let queue_rx = queue_rx.clone();
            let executor_ref = executor.clone();
            workers.spawn(async move {
                debug!("executor worker {worker_id} started");
                loop {
                    let record = { queue_rx.lock().await.recv().await };
                    match record {
                        Some(record) => executor_ref.run_procedure(record).await,
                        None => break,
                    }
                }
                debug!("executor worker {worker_id} stopped");
            });
        }
        drop(workers);
        executor
    }

    /// Enqueues a procedure and returns its id immediately.
    pub fn schedule(&self, procedure: Procedure) -> Result<Uuid, FabricError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(FabricError::ShuttingDown);
        }
        let record = Arc::new(ProcedureRecord::new(procedure));
        let id = record.id;
        self.procedures.insert(id, record.clone());
        let queue = self.queue_tx.lock();
        let Some(tx) = queue.as_ref() else {
            self.procedures.remove(&id);
            return Err(FabricError::ShuttingDown);
        };
        tx.send(record).map_err(|_| FabricError::ShuttingDown)?;
        Ok(id)
    }

    /// Schedules a procedure and blocks until it reaches a terminal state.
    pub async fn run_sync(&self, procedure: Procedure) -> Result<ProcedureStatus, FabricError> {
        let id = self.schedule(procedure)?;
        let statuses = self.wait_for(&[id]).await?;
        statuses
            .into_iter()
            .next()
            .ok_or(FabricError::UnknownProcedure(id))
    }

    /// Blocks until every referenced procedure reaches a terminal state and
    /// returns their statuses in argument order.
    pub async fn wait_for(&self, ids: &[Uuid]) -> Result<Vec<ProcedureStatus>, FabricError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            eprintln!("DEBUG wait_for about to await wait_for_one {}", id);
            out.push(self.wait_for_one(*id).await?);
            eprintln!("DEBUG wait_for done awaiting wait_for_one {}", id);
        }
        eprintln!("DEBUG wait_for returning");
        Ok(out)
    }

    async fn wait_for_one(&self, id: Uuid) -> Result<ProcedureStatus, FabricError> {
        eprintln!("DEBUG wait_for_one start {}", id);
        let record = match self.procedures.get(&id) {
            Some(record) => record.clone(),
            None => {
                // Completed long ago and evicted, or never existed; the audit
                // table decides which.
                return self
                    .archived_status(id)
                    .await?
                    .ok_or(FabricError::UnknownProcedure(id));
            }
        };
        let mut rx = record.subscribe();
        loop {
            eprintln!("DEBUG wait_for_one loop {} state={:?}", id, record.status().state);
            if rx.borrow_and_update().is_terminal() {
                return Ok(record.status());
            }
            if rx.changed().await.is_err() {
                return Ok(record.status());
            }
        }
    }

    /// The status of a live or archived procedure.
    pub async fn status(&self, id: Uuid) -> Result<ProcedureStatus, FabricError> {
        if let Some(record) = self.procedures.get(&id) {
            return Ok(record.status());
        }
        self.archived_status(id)
            .await?
            .ok_or(FabricError::UnknownProcedure(id))
    }

    async fn archived_status(&self, id: Uuid) -> Result<Option<ProcedureStatus>, FabricError> {
        let mut txn = self.store.begin().await;
        let audit: Option<ProcedureAudit> = crate::core::store::read_entity(
            txn.as_mut(),
            entities::tables::PROCEDURE_AUDIT,
            &id.to_string(),
        )
        .await?;
        txn.rollback().await?;
        Ok(audit.map(|a| ProcedureStatus {
            procedure_id: a.procedure_id,
            title: String::new(),
            state: a.state.parse().unwrap_or(ProcedureState::Failed),
            success: a.success,
            steps: a
                .steps
                .into_iter()
                .map(|s| procedure::StepReport {
                    state: s.state.parse().unwrap_or(StepState::Failed),
                    success: s.success,
                    description: s.description,
                    diagnosis: s.diagnosis,
                })
                .collect(),
            return_value: a.return_value,
        }))
    }

    /// Runs one procedure to a terminal state. Called from pool workers.
    async fn run_procedure(&self, record: Arc<ProcedureRecord>) {
        eprintln!("DEBUG run_procedure start {}", record.id);
        record.set_state(ProcedureState::Running);
        info!("procedure {} started: {}", record.id, record.title);

        let mut failed_at: Option<usize> = None;
        for index in 0..record.actions.len() {
            {
                let mut inner = record.inner.lock();
                inner.cursor = index;
                inner.steps[index].state = StepState::Running;
            }
            let action = &record.actions[index];
            let outcome = match action.deadline {
                Some(deadline) => match timeout(deadline, (action.forward)()).await {
                    Ok(result) => result,
                    Err(_) => Err(FabricError::Timeout(format!(
                        "action ({}) exceeded its deadline",
                        action.name
                    ))),
                },
                None => (action.forward)().await,
            };

            match outcome {
                Ok(value) => {
                    let mut inner = record.inner.lock();
                    inner.steps[index].state = StepState::Complete;
                    inner.steps[index].success = true;
                    inner.steps[index].description =
                        format!("Executed action ({}).", action.name);
                    if let Some(value) = value {
                        inner.return_value = Some(value);
                    }
                }
                Err(e) => {
                    warn!(
                        "procedure {} action ({}) failed: {e}",
                        record.id, action.name
                    );
                    let mut inner = record.inner.lock();
                    inner.steps[index].state = StepState::Failed;
                    inner.steps[index].success = false;
                    inner.steps[index].diagnosis = e.to_string();
                    drop(inner);
                    failed_at = Some(index);
                    break;
                }
            }
        }

        let final_state = match failed_at {
            None => ProcedureState::Complete,
            Some(index) => {
                record.set_state(ProcedureState::Undoing);
                self.run_undo_chain(&record, index).await;
                ProcedureState::Failed
            }
        };

        eprintln!("DEBUG run_procedure about to set final {} {:?}", record.id, final_state);
        record.set_state(final_state);
        info!("procedure {} finished: {final_state}", record.id);
        if let Err(e) = self.archive(&record).await {
            error!("failed to archive procedure {}: {e}", record.id);
        }
    }

    /// Invokes undos starting with the failing action itself (its forward
    /// phase may have partially mutated external state), then every
    /// previously completed action in reverse order. Undo failures are
    /// recorded and skipped; they never stop the chain.
    async fn run_undo_chain(&self, record: &ProcedureRecord, failed_index: usize) {
        for index in (0..=failed_index).rev() {
            let action = &record.actions[index];
            let Some(undo) = &action.undo else { continue };
            debug!(
                "procedure {} undoing action ({})",
                record.id, action.name
            );
            if let Err(e) = undo().await {
                warn!(
                    "procedure {} undo of action ({}) failed: {e}",
                    record.id, action.name
                );
                let mut inner = record.inner.lock();
                let diagnosis = &mut inner.steps[index].diagnosis;
                if !diagnosis.is_empty() {
                    diagnosis.push_str("; ");
                }
                diagnosis.push_str(&format!("undo failed: {e}"));
            }
        }
    }

    /// Persists the terminal outcome for later `status()` queries.
    async fn archive(&self, record: &ProcedureRecord) -> Result<(), FabricError> {
        let status = record.status();
        let audit = ProcedureAudit {
            procedure_id: status.procedure_id,
            state: status.state.to_string(),
            success: status.success,
            steps: status
                .steps
                .iter()
                .map(|s| AuditStep {
                    state: s.state.to_string(),
                    success: s.success,
                    description: s.description.clone(),
                    diagnosis: s.diagnosis.clone(),
                })
                .collect(),
            return_value: status.return_value.clone(),
            finished_at: Utc::now(),
        };
        let mut txn = self.store.begin().await;
        write_entity(
            txn.as_mut(),
            entities::tables::PROCEDURE_AUDIT,
            &status.procedure_id.to_string(),
            &audit,
        )
        .await?;
        txn.commit().await
    }

    /// The ids of procedures that have not reached a terminal state yet.
    pub fn in_flight(&self) -> Vec<Uuid> {
        self.procedures
            .iter()
            .filter(|entry| !entry.value().status().state.is_terminal())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Stops accepting work, waits up to `grace` for queued and running
    /// procedures to finish, then aborts the remaining workers.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        // Closing the queue lets idle workers exit once it drains.
        self.queue_tx.lock().take();

        let drain = async {
            while !self.in_flight().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        if timeout(grace, drain).await.is_err() {
            warn!("executor shutdown grace period expired; aborting workers");
        }
        self.workers.lock().abort_all();
    }
}

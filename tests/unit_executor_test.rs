// tests/unit_executor_test.rs

use fabricd::FabricError;
use fabricd::core::executor::Executor;
use fabricd::core::executor::procedure::{Action, Procedure, ProcedureState, StepState};
use fabricd::core::store::memory::MemoryStore;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn executor() -> Arc<Executor> {
    Executor::new(Arc::new(MemoryStore::new()), 2)
}

type Log = Arc<Mutex<Vec<&'static str>>>;

fn logging_action(name: &'static str, log: &Log, fail: bool) -> Action {
    let forward_log = log.clone();
    let undo_log = log.clone();
    Action::new(name, move || {
        let log = forward_log.clone();
        async move {
            log.lock().push(name);
            if fail {
                Err(FabricError::Service(format!("{name} exploded")))
            } else {
                Ok(None)
            }
        }
    })
    .with_undo(move || {
        let log = undo_log.clone();
        async move {
            log.lock().push("undo");
            Ok(None)
        }
    })
}

#[tokio::test]
async fn test_actions_run_sequentially_and_complete() {
    let executor = executor();
    let log: Log = Arc::default();
    let procedure = Procedure::new("three steps")
        .push(logging_action("_one", &log, false))
        .push(logging_action("_two", &log, false))
        .push(logging_action("_three", &log, false));

    let status = executor.run_sync(procedure).await.unwrap();
    assert_eq!(status.state, ProcedureState::Complete);
    assert!(status.success);
    assert_eq!(*log.lock(), vec!["_one", "_two", "_three"]);
    assert_eq!(status.steps.len(), 3);
    for (step, name) in status.steps.iter().zip(["_one", "_two", "_three"]) {
        assert_eq!(step.state, StepState::Complete);
        assert!(step.success);
        assert_eq!(step.description, format!("Executed action ({name})."));
    }
}

#[tokio::test]
async fn test_last_action_value_becomes_return_value() {
    let executor = executor();
    let procedure = Procedure::new("returns")
        .push(Action::new("_first", || async { Ok(Some(json!(1))) }))
        .push(Action::new("_second", || async { Ok(Some(json!(42))) }));
    let status = executor.run_sync(procedure).await.unwrap();
    assert_eq!(status.return_value, Some(json!(42)));
}

#[tokio::test]
async fn test_undo_runs_in_reverse_order_including_failed_action() {
    let executor = executor();
    let order: Arc<Mutex<Vec<String>>> = Arc::default();

    let mut procedure = Procedure::new("undo order");
    for name in ["_a", "_b", "_c"] {
        let fail = name == "_c";
        let forward_order = order.clone();
        let undo_order = order.clone();
        procedure = procedure.push(
            Action::new(name, move || {
                let order = forward_order.clone();
                async move {
                    order.lock().push(format!("fwd {name}"));
                    if fail {
                        Err(FabricError::Service("failing on purpose".into()))
                    } else {
                        Ok(None)
                    }
                }
            })
            .with_undo(move || {
                let order = undo_order.clone();
                async move {
                    order.lock().push(format!("undo {name}"));
                    Ok(None)
                }
            }),
        );
    }

    let status = executor.run_sync(procedure).await.unwrap();
    assert_eq!(status.state, ProcedureState::Failed);
    assert_eq!(
        *order.lock(),
        vec!["fwd _a", "fwd _b", "fwd _c", "undo _c", "undo _b", "undo _a"]
    );
    let failed = status.first_failure().unwrap();
    assert!(failed.diagnosis.contains("failing on purpose"));
}

#[tokio::test]
async fn test_undo_failure_does_not_stop_remaining_undos() {
    let executor = executor();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::default();

    let first_undo = order.clone();
    let first = Action::new("_first", || async { Ok(None) }).with_undo(move || {
        let order = first_undo.clone();
        async move {
            order.lock().push("undo _first");
            Ok(None)
        }
    });
    let second = Action::new("_second", || async { Ok(None) })
        .with_undo(|| async { Err(FabricError::Service("undo broken".into())) });
    let third = Action::new("_third", || async {
        Err(FabricError::Service("forward broken".into()))
    });

    let status = executor
        .run_sync(Procedure::new("bad undo").push(first).push(second).push(third))
        .await
        .unwrap();

    assert_eq!(status.state, ProcedureState::Failed);
    // The broken undo was recorded on its own step and the chain went on.
    assert!(status.steps[1].diagnosis.contains("undo failed"));
    assert_eq!(*order.lock(), vec!["undo _first"]);
}

#[tokio::test]
async fn test_action_deadline_fails_the_procedure() {
    let executor = executor();
    let undone: Arc<Mutex<bool>> = Arc::default();
    let undone_ref = undone.clone();

    let slow = Action::new("_slow", || async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(None)
    })
    .with_deadline(Duration::from_millis(50));
    let setup = Action::new("_setup", || async { Ok(None) }).with_undo(move || {
        let undone = undone_ref.clone();
        async move {
            *undone.lock() = true;
            Ok(None)
        }
    });

    let status = executor
        .run_sync(Procedure::new("deadline").push(setup).push(slow))
        .await
        .unwrap();

    assert_eq!(status.state, ProcedureState::Failed);
    assert!(status.steps[1].diagnosis.contains("deadline"));
    assert!(*undone.lock());
}

#[tokio::test]
async fn test_procedures_run_concurrently_across_workers() {
    let executor = executor();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let rx = Arc::new(Mutex::new(Some(rx)));

    // The first procedure blocks until the second one runs, which only
    // works if they execute on different workers.
    let blocker = Procedure::new("blocker").push(Action::new("_block", move || {
        let rx = rx.clone();
        async move {
            let rx = rx.lock().take().expect("single run");
            rx.await
                .map_err(|_| FabricError::Service("unblocked sender dropped".into()))?;
            Ok(None)
        }
    }));
    let tx = Arc::new(Mutex::new(Some(tx)));
    let unblocker = Procedure::new("unblocker").push(Action::new("_unblock", move || {
        let tx = tx.clone();
        async move {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
            Ok(None)
        }
    }));

    let blocker_id = executor.schedule(blocker).unwrap();
    let unblocker_id = executor.schedule(unblocker).unwrap();
    let statuses = executor.wait_for(&[blocker_id, unblocker_id]).await.unwrap();
    assert!(statuses.iter().all(|s| s.success));
}

#[tokio::test]
async fn test_status_survives_via_audit_archive() {
    let executor = executor();
    let procedure = Procedure::new("archived")
        .push(Action::new("_noop", || async { Ok(Some(json!("done"))) }));
    let id = executor.schedule(procedure).unwrap();
    executor.wait_for(&[id]).await.unwrap();

    let status = executor.status(id).await.unwrap();
    assert_eq!(status.state, ProcedureState::Complete);
    assert_eq!(status.return_value, Some(json!("done")));

    let unknown = executor.status(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(unknown, FabricError::UnknownProcedure(_)));
}

#[tokio::test]
async fn test_shutdown_rejects_new_work() {
    let executor = executor();
    executor.shutdown(Duration::from_millis(200)).await;
    let err = executor
        .schedule(Procedure::new("late").push(Action::new("_noop", || async { Ok(None) })))
        .unwrap_err();
    assert_eq!(err, FabricError::ShuttingDown);
}

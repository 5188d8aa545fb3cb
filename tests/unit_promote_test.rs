// tests/unit_promote_test.rs

mod support;

use fabricd::core::events::{SERVER_PROMOTED, Subscriber};
use fabricd::core::store::entities::{ServerMode, ServerStatus};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::TestFabric;

async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_promote_after_add_elects_exactly_one_primary() {
    let fabric = TestFabric::new().await;
    for address in ["hostA:3306", "hostB:3306"] {
        fabric.farm.add_server(address);
    }

    let promoted_count: Arc<Mutex<u32>> = Arc::default();
    let counter = promoted_count.clone();
    fabric
        .state
        .events
        .register(
            &SERVER_PROMOTED,
            vec![Subscriber::new("count_promotions", move |_args| {
                let counter = counter.clone();
                async move {
                    *counter.lock() += 1;
                    Ok(())
                }
            })],
        )
        .unwrap();

    fabric
        .call_ok("group", "create", vec![json!("G1"), json!("First description.")])
        .await;
    fabric
        .call_ok("group", "add", vec![json!("G1"), json!("hostA:3306")])
        .await;
    fabric
        .call_ok("group", "add", vec![json!("G1"), json!("hostB:3306")])
        .await;
    fabric.call_ok("group", "promote", vec![json!("G1")]).await;

    let servers = fabric.state.groups.lookup_servers("G1").unwrap();
    let primaries: Vec<_> = servers
        .iter()
        .filter(|s| s.status == ServerStatus::Primary)
        .collect();
    let secondaries: Vec<_> = servers
        .iter()
        .filter(|s| s.status == ServerStatus::Secondary)
        .collect();
    assert_eq!(primaries.len(), 1);
    assert_eq!(secondaries.len(), 1);
    assert_eq!(primaries[0].mode, ServerMode::ReadWrite);
    assert_eq!(secondaries[0].mode, ServerMode::ReadOnly);

    // The secondary replicates from the elected master.
    let secondary_conn = fabric.conn(&secondaries[0].address).await;
    let replication = secondary_conn.replication_status().await.unwrap();
    assert_eq!(replication.master_address.as_deref(), Some(primaries[0].address.as_str()));
    assert!(replication.replica_running);

    wait_until(|| *promoted_count.lock() == 1, "SERVER_PROMOTED job").await;
    assert_eq!(*promoted_count.lock(), 1);
}

#[tokio::test]
async fn test_promote_with_explicit_candidate() {
    let fabric = TestFabric::new().await;
    fabric.make_group("G1", &["hostC:3306", "hostD:3306"]).await;

    let secondary = fabric
        .state
        .groups
        .lookup_servers("G1")
        .unwrap()
        .into_iter()
        .find(|s| s.status == ServerStatus::Secondary)
        .unwrap();

    fabric
        .call_ok(
            "group",
            "promote",
            vec![json!("G1"), json!(secondary.uuid.to_string())],
        )
        .await;

    let master = fabric.state.groups.master_of("G1").unwrap();
    assert_eq!(master.uuid, secondary.uuid);

    // The demoted master is now a replica of the new one.
    let demoted = fabric
        .state
        .groups
        .lookup_servers("G1")
        .unwrap()
        .into_iter()
        .find(|s| s.status == ServerStatus::Secondary)
        .unwrap();
    let conn = fabric.conn(&demoted.address).await;
    let replication = conn.replication_status().await.unwrap();
    assert_eq!(replication.master_address.as_deref(), Some(master.address.as_str()));
}

#[tokio::test]
async fn test_promote_candidate_must_be_member() {
    let fabric = TestFabric::new().await;
    fabric.make_group("G1", &["hostE:3306"]).await;

    let status = fabric
        .call(
            "group",
            "promote",
            vec![json!("G1"), json!(uuid::Uuid::new_v4().to_string())],
        )
        .await;
    assert!(!status.success);
    let failed = status.first_failure().unwrap();
    assert!(failed.diagnosis.contains("not a member"));
}

#[tokio::test]
async fn test_demote_leaves_group_without_master() {
    let fabric = TestFabric::new().await;
    fabric.make_group("G1", &["hostF:3306", "hostG:3306"]).await;
    let old_master = fabric.state.groups.master_of("G1").unwrap();

    fabric.call_ok("group", "demote", vec![json!("G1")]).await;

    let group = fabric.state.groups.lookup_group("G1").unwrap();
    assert_eq!(group.master, None);
    let demoted = fabric.state.registry.lookup(old_master.uuid).unwrap();
    assert_eq!(demoted.status, ServerStatus::Secondary);
    assert_eq!(demoted.mode, ServerMode::ReadOnly);

    // A fresh promotion brings the group back.
    fabric.call_ok("group", "promote", vec![json!("G1")]).await;
    assert!(fabric.state.groups.master_of("G1").is_ok());
}

#[tokio::test]
async fn test_promote_fails_without_switching_when_catchup_times_out() {
    let fabric = TestFabric::new().await;
    fabric.make_group("G1", &["hostH:3306", "hostI:3306"]).await;
    let master = fabric.state.groups.master_of("G1").unwrap();
    let secondary = fabric
        .state
        .groups
        .lookup_servers("G1")
        .unwrap()
        .into_iter()
        .find(|s| s.status == ServerStatus::Secondary)
        .unwrap();

    // Break replication, then write on the master so the secondary lags.
    let secondary_conn = fabric.conn(&secondary.address).await;
    secondary_conn.stop_replication().await.unwrap();
    fabric
        .seed_int_rows(&master.address, "db1.t1", &[1, 2, 3])
        .await;

    let status = fabric.call("group", "promote", vec![json!("G1")]).await;
    assert!(!status.success);
    let failed = status.first_failure().unwrap();
    assert_eq!(failed.description, "Tried to execute action (_wait_slaves_catch_up).");
    assert!(failed.diagnosis.contains("did not reach position"));

    // The old master kept its role and is writable again.
    let unchanged = fabric.state.groups.master_of("G1").unwrap();
    assert_eq!(unchanged.uuid, master.uuid);
    let server = fabric.farm.server(&master.address).unwrap();
    assert_eq!(server.mode(), ServerMode::ReadWrite);
}

#[tokio::test]
async fn test_lost_master_triggers_unattended_fail_over() {
    let fabric = TestFabric::new().await;
    fabric.make_group("G1", &["hostJ:3306", "hostK:3306"]).await;
    let old_master = fabric.state.groups.master_of("G1").unwrap();
    let survivor = fabric
        .state
        .groups
        .lookup_servers("G1")
        .unwrap()
        .into_iter()
        .find(|s| s.status == ServerStatus::Secondary)
        .unwrap();

    fabric.farm.set_reachable(&old_master.address, false);

    // The next contact attempt marks the server FAULTY and fires
    // SERVER_LOST, whose reactor schedules the fail-over.
    let err = fabric.state.registry.connect(old_master.uuid).await;
    assert!(err.is_err());

    let groups = fabric.state.groups.clone();
    let survivor_uuid = survivor.uuid;
    wait_until(
        move || {
            groups
                .master_of("G1")
                .map(|m| m.uuid == survivor_uuid)
                .unwrap_or(false)
        },
        "fail-over to the surviving secondary",
    )
    .await;

    let new_master = fabric.state.registry.lookup(survivor.uuid).unwrap();
    assert_eq!(new_master.status, ServerStatus::Primary);
    assert_eq!(new_master.mode, ServerMode::ReadWrite);
    let lost = fabric.state.registry.lookup(old_master.uuid).unwrap();
    assert_eq!(lost.status, ServerStatus::Faulty);
}

// tests/unit_group_test.rs

mod support;

use fabricd::core::store::entities::{GroupStatus, ServerStatus};
use serde_json::json;
use support::TestFabric;

#[tokio::test]
async fn test_create_and_destroy_group() {
    let fabric = TestFabric::new().await;
    fabric
        .call_ok("group", "create", vec![json!("G1"), json!("First description.")])
        .await;

    let duplicate = fabric
        .call("group", "create", vec![json!("G1"), json!("again")])
        .await;
    assert!(!duplicate.success);
    assert!(
        duplicate
            .first_failure()
            .unwrap()
            .diagnosis
            .contains("already exists")
    );

    fabric.call_ok("group", "destroy", vec![json!("G1")]).await;
    assert!(fabric.state.groups.lookup_group("G1").is_err());
}

#[tokio::test]
async fn test_destroy_refuses_non_empty_group() {
    let fabric = TestFabric::new().await;
    fabric.farm.add_server("host1:3306");
    fabric
        .call_ok("group", "create", vec![json!("G1"), json!("desc")])
        .await;
    fabric
        .call_ok("group", "add", vec![json!("G1"), json!("host1:3306")])
        .await;

    let status = fabric.call("group", "destroy", vec![json!("G1")]).await;
    assert!(!status.success);
    assert!(status.first_failure().unwrap().diagnosis.contains("server"));
}

#[tokio::test]
async fn test_add_discovers_uuid_and_rejects_double_membership() {
    let fabric = TestFabric::new().await;
    let uuid = fabric.farm.add_server("host1:3306");
    fabric
        .call_ok("group", "create", vec![json!("G1"), json!("desc")])
        .await;
    fabric
        .call_ok("group", "create", vec![json!("G2"), json!("desc")])
        .await;

    let status = fabric
        .call_ok("group", "add", vec![json!("G1"), json!("host1:3306")])
        .await;
    let returned = status.return_value.unwrap();
    assert_eq!(returned["server_uuid"], json!(uuid.to_string()));

    let second = fabric
        .call("group", "add", vec![json!("G2"), json!("host1:3306")])
        .await;
    assert!(!second.success);
    assert!(
        second
            .first_failure()
            .unwrap()
            .diagnosis
            .contains("already a member")
    );
}

#[tokio::test]
async fn test_add_unreachable_server_fails() {
    let fabric = TestFabric::new().await;
    fabric
        .call_ok("group", "create", vec![json!("G1"), json!("desc")])
        .await;
    let status = fabric
        .call("group", "add", vec![json!("G1"), json!("nowhere:3306")])
        .await;
    assert!(!status.success);
    assert!(
        status
            .first_failure()
            .unwrap()
            .diagnosis
            .contains("Could not connect")
    );
}

#[tokio::test]
async fn test_remove_server_but_never_the_master() {
    let fabric = TestFabric::new().await;
    fabric.make_group("G1", &["host1:3306", "host2:3306"]).await;

    let servers = fabric.state.groups.lookup_servers("G1").unwrap();
    let master = servers
        .iter()
        .find(|s| s.status == ServerStatus::Primary)
        .unwrap();
    let secondary = servers
        .iter()
        .find(|s| s.status == ServerStatus::Secondary)
        .unwrap();

    let refused = fabric
        .call(
            "group",
            "remove",
            vec![json!("G1"), json!(master.uuid.to_string())],
        )
        .await;
    assert!(!refused.success);
    assert!(refused.first_failure().unwrap().diagnosis.contains("demote"));

    fabric
        .call_ok(
            "group",
            "remove",
            vec![json!("G1"), json!(secondary.uuid.to_string())],
        )
        .await;
    assert_eq!(fabric.state.groups.lookup_servers("G1").unwrap().len(), 1);
    assert!(fabric.state.registry.lookup(secondary.uuid).is_err());
}

#[tokio::test]
async fn test_new_member_replicates_from_existing_master() {
    let fabric = TestFabric::new().await;
    fabric.make_group("G1", &["host1:3306"]).await;
    let master = fabric.state.groups.master_of("G1").unwrap();

    // Data written before the join must arrive on the new member.
    fabric
        .seed_int_rows(&master.address, "db1.t1", &[1, 2, 3])
        .await;

    fabric.farm.add_server("host2:3306");
    fabric
        .call_ok("group", "add", vec![json!("G1"), json!("host2:3306")])
        .await;

    assert_eq!(fabric.count_rows("host2:3306", "db1.t1").await.unwrap(), 3);

    // And so must data written after it.
    let conn = fabric.conn(&master.address).await;
    conn.exec_stmt(fabricd::core::conn::Statement::Insert {
        table: "db1.t1".parse().unwrap(),
        row: fabricd::core::conn::DataRow {
            key: fabricd::core::sharding::ShardingKey::Int(4),
            payload: json!({ "name": "TEST 4" }),
        },
    })
    .await
    .unwrap();
    assert_eq!(fabric.count_rows("host2:3306", "db1.t1").await.unwrap(), 4);
}

#[tokio::test]
async fn test_reconcile_adopts_remote_replication_state() {
    let fabric = TestFabric::new().await;
    fabric.make_group("G1", &["host1:3306", "host2:3306"]).await;

    let old_master = fabric.state.groups.master_of("G1").unwrap();
    let secondary = fabric
        .state
        .groups
        .lookup_servers("G1")
        .unwrap()
        .into_iter()
        .find(|s| s.status == ServerStatus::Secondary)
        .unwrap();

    // An out-of-band changeover the daemon never saw: the secondary became
    // the writable master and the old master now replicates from it.
    let new_master_conn = fabric.conn(&secondary.address).await;
    new_master_conn.reset_replication().await.unwrap();
    new_master_conn
        .set_mode(fabricd::core::store::entities::ServerMode::ReadWrite)
        .await
        .unwrap();
    let old_master_conn = fabric.conn(&old_master.address).await;
    old_master_conn
        .set_mode(fabricd::core::store::entities::ServerMode::ReadOnly)
        .await
        .unwrap();
    old_master_conn
        .change_master_to(&fabricd::core::conn::MasterInfo {
            address: secondary.address.clone(),
            user: secondary.user.clone(),
            passwd: secondary.passwd.clone(),
        })
        .await
        .unwrap();
    old_master_conn.start_replication().await.unwrap();

    fabric.state.groups.reconcile().await.unwrap();

    // The remote topology is authoritative: metadata now matches it.
    let master = fabric.state.groups.master_of("G1").unwrap();
    assert_eq!(master.uuid, secondary.uuid);
    assert_eq!(
        fabric.state.registry.lookup(old_master.uuid).unwrap().status,
        ServerStatus::Secondary
    );
}

#[tokio::test]
async fn test_activate_and_deactivate_toggle_group_status() {
    let fabric = TestFabric::new().await;
    fabric
        .call_ok("group", "create", vec![json!("G1"), json!("desc")])
        .await;
    fabric.call_ok("group", "deactivate", vec![json!("G1")]).await;
    assert_eq!(
        fabric.state.groups.lookup_group("G1").unwrap().status,
        GroupStatus::Inactive
    );
    fabric.call_ok("group", "activate", vec![json!("G1")]).await;
    assert_eq!(
        fabric.state.groups.lookup_group("G1").unwrap().status,
        GroupStatus::Active
    );
}

#[tokio::test]
async fn test_lookup_servers_reports_rows() {
    let fabric = TestFabric::new().await;
    fabric.make_group("G1", &["host1:3306", "host2:3306"]).await;

    let status = fabric
        .call_ok("group", "lookup_servers", vec![json!("G1")])
        .await;
    let rows = status.return_value.unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    // PRIMARY sorts first in the row set.
    assert_eq!(rows[0]["status"], json!("PRIMARY"));
    assert_eq!(rows[1]["status"], json!("SECONDARY"));
}

#[tokio::test]
async fn test_server_lookup_uuid_roundtrip() {
    let fabric = TestFabric::new().await;
    let uuid = fabric.farm.add_server("host9:3306");
    let status = fabric
        .call_ok("server", "lookup_uuid", vec![json!("host9:3306")])
        .await;
    assert_eq!(status.return_value.unwrap(), json!(uuid.to_string()));
}

// tests/unit_shard_move_test.rs

mod support;

use fabricd::FabricError;
use fabricd::core::store::entities::ShardState;
use serde_json::json;
use std::time::Duration;
use support::TestFabric;

const ROW_KEYS: [i64; 7] = [101, 102, 103, 1001, 1002, 1003, 1004];

/// GROUPID1 is the global group, GROUPID2 owns shard 1, GROUPID3 is empty.
async fn setup_move_topology() -> TestFabric {
    let fabric = TestFabric::new().await;
    fabric
        .make_group("GROUPID1", &["host1:3306", "host2:3306"])
        .await;
    fabric
        .make_group("GROUPID2", &["host3:3306", "host4:3306"])
        .await;
    fabric
        .make_group("GROUPID3", &["host5:3306", "host6:3306"])
        .await;

    fabric
        .call_ok(
            "sharding",
            "create_definition",
            vec![json!("RANGE"), json!("GROUPID1")],
        )
        .await;
    fabric
        .call_ok(
            "sharding",
            "add_table",
            vec![json!(1), json!("db1.t1"), json!("userID")],
        )
        .await;
    fabric
        .call_ok(
            "sharding",
            "add_shard",
            vec![json!(1), json!("GROUPID2/0"), json!("ENABLED")],
        )
        .await;

    let shard_master = fabric.master_address("GROUPID2");
    fabric.seed_int_rows(&shard_master, "db1.t1", &ROW_KEYS).await;
    fabric
}

#[tokio::test]
async fn test_shard_move_transfers_data_and_rebinds() {
    let fabric = setup_move_topology().await;
    let old_master = fabric.master_address("GROUPID2");

    fabric
        .call_ok(
            "sharding",
            "move_shard",
            vec![json!("1"), json!("GROUPID3")],
        )
        .await;

    // Routing now points at GROUPID3 and all seven rows are there.
    let local = fabric
        .call_ok(
            "sharding",
            "lookup_servers",
            vec![json!("db1.t1"), json!(500), json!("LOCAL")],
        )
        .await;
    let rows = local.return_value.unwrap();
    for row in rows.as_array().unwrap() {
        let address = row["address"].as_str().unwrap();
        let data = fabric.select_rows(address, "db1.t1").await.unwrap();
        assert_eq!(data.len(), 7);
        for (row, key) in data.iter().zip(ROW_KEYS) {
            assert_eq!(row.payload["name"], json!(format!("TEST {key}")));
        }
    }

    // Reads at the old location fail: the tables were dropped there.
    let err = fabric.count_rows(&old_master, "db1.t1").await.unwrap_err();
    assert!(matches!(err, FabricError::Database(_)));

    // Writes on the global group fan out to the shard's new home.
    let global_master = fabric.master_address("GROUPID1");
    fabric
        .seed_int_rows(&global_master, "global_db.global_table", &[101, 202])
        .await;
    let new_master = fabric.master_address("GROUPID3");
    assert_eq!(
        fabric
            .count_rows(&new_master, "global_db.global_table")
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn test_global_fanout_survives_global_master_change() {
    let fabric = setup_move_topology().await;
    fabric
        .call_ok(
            "sharding",
            "move_shard",
            vec![json!("1"), json!("GROUPID3")],
        )
        .await;

    let global_master = fabric.master_address("GROUPID1");
    fabric
        .seed_int_rows(&global_master, "global_db.global_table", &[101, 202])
        .await;

    // Swap the global group's master; the repair reaction re-points every
    // shard group at the new one.
    fabric
        .call_ok("group", "promote", vec![json!("GROUPID1")])
        .await;
    // The re-pointing runs as scheduled jobs; give them a moment.
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if fabric.state.executor.in_flight().is_empty() {
            break;
        }
    }

    let new_global_master = fabric.master_address("GROUPID1");
    assert_ne!(global_master, new_global_master);
    let conn = fabric.conn(&new_global_master).await;
    for key in [303i64, 404, 505, 606] {
        conn.exec_stmt(fabricd::core::conn::Statement::Insert {
            table: "global_db.global_table".parse().unwrap(),
            row: fabricd::core::conn::DataRow {
                key: fabricd::core::sharding::ShardingKey::Int(key),
                payload: json!({ "name": format!("TEST {key}") }),
            },
        })
        .await
        .unwrap();
    }

    let shard_master = fabric.master_address("GROUPID3");
    assert_eq!(
        fabric
            .count_rows(&shard_master, "global_db.global_table")
            .await
            .unwrap(),
        6
    );
}

#[tokio::test]
async fn test_update_only_move_rebinds_without_data() {
    let fabric = setup_move_topology().await;
    let old_master = fabric.master_address("GROUPID2");

    fabric
        .call_ok(
            "sharding",
            "move_shard",
            vec![json!("1"), json!("GROUPID3"), json!(true)],
        )
        .await;

    // The binding changed but no data was transferred: the table exists
    // only at the old location, so reads at the new one fail.
    let shard = fabric.state.catalog.shard(1).unwrap();
    assert_eq!(shard.group_id, "GROUPID3");
    assert_eq!(shard.state, ShardState::Enabled);
    assert_eq!(fabric.count_rows(&old_master, "db1.t1").await.unwrap(), 7);

    let new_master = fabric.master_address("GROUPID3");
    let err = fabric.count_rows(&new_master, "db1.t1").await.unwrap_err();
    assert!(matches!(err, FabricError::Database(_)));
}

#[tokio::test]
async fn test_failed_restore_rolls_the_move_back() {
    let fabric = setup_move_topology().await;
    let old_master = fabric.master_address("GROUPID2");
    let dest_master = fabric.master_address("GROUPID3");

    fabric.farm.inject_failure(
        &dest_master,
        FabricError::Database("disk full".into()),
    );

    let status = fabric
        .call(
            "sharding",
            "move_shard",
            vec![json!("1"), json!("GROUPID3")],
        )
        .await;
    assert!(!status.success);
    let failed = status.first_failure().unwrap();
    assert_eq!(
        failed.description,
        "Tried to execute action (_backup_and_restore)."
    );

    // The shard is back to serving from its original group.
    let shard = fabric.state.catalog.shard(1).unwrap();
    assert_eq!(shard.group_id, "GROUPID2");
    assert_eq!(shard.state, ShardState::Enabled);
    assert_eq!(fabric.count_rows(&old_master, "db1.t1").await.unwrap(), 7);
    let err = fabric.count_rows(&dest_master, "db1.t1").await.unwrap_err();
    assert!(matches!(err, FabricError::Database(_)));

    // The advisory lock was released: a retry succeeds.
    fabric
        .call_ok(
            "sharding",
            "move_shard",
            vec![json!("1"), json!("GROUPID3")],
        )
        .await;
}

#[tokio::test]
async fn test_move_to_masterless_group_fails_upfront() {
    let fabric = setup_move_topology().await;
    fabric.farm.add_server("host7:3306");
    fabric
        .call_ok("group", "create", vec![json!("GROUPID4"), json!("desc")])
        .await;
    fabric
        .call_ok("group", "add", vec![json!("GROUPID4"), json!("host7:3306")])
        .await;

    let status = fabric
        .call(
            "sharding",
            "move_shard",
            vec![json!("1"), json!("GROUPID4")],
        )
        .await;
    assert!(!status.success);
    assert_eq!(
        status.first_failure().unwrap().description,
        "Tried to execute action (_check_shard_move)."
    );
    assert_eq!(
        fabric.state.catalog.shard(1).unwrap().state,
        ShardState::Enabled
    );
}

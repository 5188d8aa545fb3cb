// tests/unit_registry_test.rs

mod support;

use fabricd::FabricError;
use fabricd::core::conn::mock::FARM_USER;
use fabricd::core::store::entities::{Server, ServerMode, ServerStatus};
use support::TestFabric;
use uuid::Uuid;

fn server_record(uuid: Uuid, address: &str) -> Server {
    Server {
        uuid,
        address: address.to_string(),
        user: FARM_USER.to_string(),
        passwd: "secret".to_string(),
        status: ServerStatus::Secondary,
        mode: ServerMode::ReadOnly,
    }
}

#[tokio::test]
async fn test_discover_uuid_and_credentials() {
    let fabric = TestFabric::new().await;
    let uuid = fabric.farm.add_server("host1:3306");

    let discovered = fabric
        .state
        .registry
        .discover_uuid("host1:3306", FARM_USER, "secret")
        .await
        .unwrap();
    assert_eq!(discovered, uuid);

    let bad_creds = fabric
        .state
        .registry
        .discover_uuid("host1:3306", FARM_USER, "wrong")
        .await
        .unwrap_err();
    assert!(matches!(bad_creds, FabricError::Auth(_)));

    let unknown = fabric
        .state
        .registry
        .discover_uuid("ghost:3306", FARM_USER, "secret")
        .await
        .unwrap_err();
    assert!(matches!(unknown, FabricError::Connect(_)));
}

#[tokio::test]
async fn test_duplicate_uuid_with_new_address_is_split_brain_guard() {
    let fabric = TestFabric::new().await;
    let uuid = fabric.farm.add_server("host1:3306");

    let registry = &fabric.state.registry;
    registry.add(server_record(uuid, "host1:3306")).await.unwrap();
    // Same uuid, same address: an idempotent re-add.
    registry.add(server_record(uuid, "host1:3306")).await.unwrap();

    let err = registry
        .add(server_record(uuid, "host2:3306"))
        .await
        .unwrap_err();
    assert!(matches!(err, FabricError::Server(_)));
    assert!(err.to_string().contains("refusing to re-register"));
}

#[tokio::test]
async fn test_connect_failure_marks_server_faulty() {
    let fabric = TestFabric::new().await;
    let uuid = fabric.farm.add_server("host1:3306");
    let registry = &fabric.state.registry;
    registry.add(server_record(uuid, "host1:3306")).await.unwrap();

    assert!(registry.connect(uuid).await.is_ok());

    fabric.farm.set_reachable("host1:3306", false);
    let err = registry.connect(uuid).await.unwrap_err();
    assert!(matches!(err, FabricError::Connect(_)));
    assert_eq!(
        registry.lookup(uuid).unwrap().status,
        ServerStatus::Faulty
    );
}

#[tokio::test]
async fn test_remove_forgets_the_server() {
    let fabric = TestFabric::new().await;
    let uuid = fabric.farm.add_server("host1:3306");
    let registry = &fabric.state.registry;
    registry.add(server_record(uuid, "host1:3306")).await.unwrap();

    registry.remove(uuid).await.unwrap();
    assert!(registry.lookup(uuid).is_err());
    assert!(registry.connect(uuid).await.is_err());
}

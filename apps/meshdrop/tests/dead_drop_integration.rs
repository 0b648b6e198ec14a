//! Integration tests for the dead drop lifecycle.
//!
//! These tests drive the public Coordinator API end to end with file-backed
//! storage in temporary directories and in-process mesh nodes.
//!
//! Run with: cargo test --test `dead_drop_integration`

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;

use meshdrop::config::Settings;
use meshdrop::crypto::MeshKeyPair;
use meshdrop::distribution::{
    Coordinator, CreateDropRequest, DropStatus, InMemoryNodeRegistry, LoopbackTransport, MeshNode,
    NodeId, TargetLocation,
};
use meshdrop::error::DropError;
use meshdrop::location::{
    BeaconSignal, Coordinates, HistoryScope, LocationClaim, LocationHistoryStore,
    VerificationResult,
};
use meshdrop::storage::Storage;
use meshdrop::transfer_log::{TransferLog, TransferOutcome};

const NYC: (f64, f64) = (40.7128, -74.0060);
const LA: (f64, f64) = (34.0522, -118.2437);

type TestCoordinator = Coordinator<InMemoryNodeRegistry, LoopbackTransport>;

struct Mesh {
    coordinator: TestCoordinator,
    registry: Arc<InMemoryNodeRegistry>,
    transport: Arc<LoopbackTransport>,
    node_ids: Vec<NodeId>,
}

/// Five nodes around New York with trust scores 0.70 to 0.90.
fn create_mesh(temp_dir: &TempDir, capacity: u32) -> Mesh {
    let db_path = temp_dir.path().join("meshdrop.redb");
    let storage = Storage::open(&db_path).expect("Failed to create storage");
    let registry = Arc::new(InMemoryNodeRegistry::new());
    let transport = Arc::new(LoopbackTransport::new());

    let node_ids: Vec<NodeId> = (0..5)
        .map(|i| {
            let id = format!("node-{i}");
            let location = Coordinates::new(NYC.0 + f64::from(i) * 0.0003, NYC.1).unwrap();
            registry
                .register(
                    MeshNode::new(id.clone(), MeshKeyPair::generate().public_key, capacity)
                        .with_trust(0.70 + f64::from(i) * 0.05)
                        .with_location(location),
                )
                .unwrap();
            id
        })
        .collect();

    let settings = Settings::for_tests().with_db_path(&db_path);
    let coordinator = Coordinator::new(
        storage,
        Arc::clone(&registry),
        Arc::clone(&transport),
        settings,
    )
    .expect("Failed to create coordinator")
    .with_rng(StdRng::seed_from_u64(7));

    Mesh {
        coordinator,
        registry,
        transport,
        node_ids,
    }
}

fn nyc_drop(secret: &str, k: u16, n: u16) -> CreateDropRequest {
    CreateDropRequest::new("owner-1", secret, TargetLocation::new(NYC.0, NYC.1, 100.0), k, n)
}

fn holder_of(mesh: &Mesh, drop_id: &uuid::Uuid, index: u16) -> NodeId {
    mesh.coordinator
        .storage()
        .get_fragment(drop_id, index)
        .unwrap()
        .and_then(|f| f.holder.node_id().map(str::to_string))
        .unwrap()
}

#[tokio::test]
async fn test_collect_with_two_nodes_offline() {
    let temp_dir = TempDir::new().unwrap();
    let mesh = create_mesh(&temp_dir, 4);

    let (drop, distribution) = mesh
        .coordinator
        .create_and_distribute(nyc_drop("correct horse battery staple", 3, 5))
        .await
        .unwrap();
    assert_eq!(distribution.fragments_distributed, 5);
    assert_eq!(drop.status, DropStatus::Active);

    mesh.registry.set_online(&mesh.node_ids[0], false).unwrap();
    mesh.registry.set_online(&mesh.node_ids[1], false).unwrap();
    let online: Vec<NodeId> = mesh.node_ids[2..].to_vec();

    let result = mesh
        .coordinator
        .collect_fragments(&drop.id, &online)
        .await
        .unwrap();

    assert!(result.success, "{}", result.message);
    assert_eq!(result.fragments_collected, 3);
    assert_eq!(result.secret_utf8(), Some("correct horse battery staple"));
    assert_eq!(
        mesh.coordinator.get_drop(&drop.id).unwrap().status,
        DropStatus::Collected
    );
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let drop_id = {
        let mesh = create_mesh(&temp_dir, 4);
        let (drop, _) = mesh
            .coordinator
            .create_and_distribute(nyc_drop("persisted", 2, 3))
            .await
            .unwrap();
        drop.id
    };

    let storage = Storage::open(&temp_dir.path().join("meshdrop.redb")).unwrap();
    let drop = storage.get_drop(&drop_id).unwrap().unwrap();
    assert_eq!(drop.status, DropStatus::Active);
    assert_eq!(storage.list_fragments(&drop_id).unwrap().len(), 3);
    assert_eq!(storage.get_latest_transfer_seq().unwrap(), Some(3));
}

#[tokio::test]
async fn test_beacon_backed_access_granted() {
    let temp_dir = TempDir::new().unwrap();
    let mesh = create_mesh(&temp_dir, 4);
    let (drop, _) = mesh
        .coordinator
        .create_and_distribute(nyc_drop("beacons", 3, 5).with_beacon())
        .await
        .unwrap();

    let history = LocationHistoryStore::default();
    let claim = LocationClaim::at(NYC.0 + 0.0001, NYC.1, 8.0).with_beacons(vec![
        BeaconSignal::new("node-2", -60),
        BeaconSignal::new("node-3", -65),
    ]);

    let response = mesh
        .coordinator
        .verify_access(&drop.id, &claim, Some(HistoryScope::new(&history, "alice")))
        .await
        .unwrap();

    assert_eq!(response.result, VerificationResult::Success);
    assert!(response.gps_verified && response.beacon_verified);
    assert!(response.confidence >= 0.7);
    response.ensure_granted().unwrap();
}

#[tokio::test]
async fn test_coast_to_coast_jump_is_spoofing() {
    let temp_dir = TempDir::new().unwrap();
    let mesh = create_mesh(&temp_dir, 4);
    let (nyc, _) = mesh
        .coordinator
        .create_and_distribute(nyc_drop("east", 2, 3))
        .await
        .unwrap();
    let la_request =
        CreateDropRequest::new("owner-2", "west", TargetLocation::new(LA.0, LA.1, 100.0), 2, 3);
    let (la, _) = mesh.coordinator.create_and_distribute(la_request).await.unwrap();

    let history = LocationHistoryStore::default();
    let start = Utc::now() - Duration::minutes(10);

    let at_nyc = LocationClaim::at(NYC.0, NYC.1, 5.0).with_timestamp(start);
    let first = mesh
        .coordinator
        .verify_access(&nyc.id, &at_nyc, Some(HistoryScope::new(&history, "mallory")))
        .await
        .unwrap();
    assert!(first.gps_verified);

    // Roughly 3,936 km in a minute
    let at_la = LocationClaim::at(LA.0, LA.1, 5.0).with_timestamp(start + Duration::minutes(1));
    let second = mesh
        .coordinator
        .verify_access(&la.id, &at_la, Some(HistoryScope::new(&history, "mallory")))
        .await
        .unwrap();

    assert_eq!(second.result, VerificationResult::SpoofingDetected);
    assert!(matches!(
        second.ensure_granted(),
        Err(DropError::SpoofingDetected(_))
    ));
    // The rejected claim never entered the history
    assert_eq!(history.snapshot("mallory").unwrap().len(), 1);
}

#[tokio::test]
async fn test_rebalance_respects_capacity() {
    let temp_dir = TempDir::new().unwrap();
    let mesh = create_mesh(&temp_dir, 1);
    let (drop, _) = mesh
        .coordinator
        .create_and_distribute(nyc_drop("crowded", 2, 4))
        .await
        .unwrap();

    let offline = holder_of(&mesh, &drop.id, 1);
    mesh.registry.set_online(&offline, false).unwrap();

    // One spare node with one slot
    let moved = mesh.coordinator.rebalance_fragments(&drop.id).await.unwrap();
    assert_eq!(moved, 1);
    for id in &mesh.node_ids {
        assert!(mesh.registry.load(id).unwrap() <= 1);
    }
    assert_ne!(holder_of(&mesh, &drop.id, 1), offline);

    // Second node lost, nowhere left to go
    let offline_again = holder_of(&mesh, &drop.id, 2);
    mesh.registry.set_online(&offline_again, false).unwrap();
    assert_eq!(mesh.coordinator.rebalance_fragments(&drop.id).await.unwrap(), 0);
    assert_eq!(holder_of(&mesh, &drop.id, 2), offline_again);
}

#[tokio::test]
async fn test_cancel_frees_nodes_for_new_drops() {
    let temp_dir = TempDir::new().unwrap();
    let mesh = create_mesh(&temp_dir, 1);

    let (first, _) = mesh
        .coordinator
        .create_and_distribute(nyc_drop("first", 3, 5))
        .await
        .unwrap();
    assert_eq!(first.status, DropStatus::Active);

    // Every node is full
    let (blocked, result) = mesh
        .coordinator
        .create_and_distribute(nyc_drop("blocked", 2, 3))
        .await
        .unwrap();
    assert_eq!(result.fragments_local, 3);
    assert_eq!(blocked.status, DropStatus::Distributed);

    mesh.coordinator.cancel_drop(&first.id).await.unwrap();
    for id in &mesh.node_ids {
        assert_eq!(mesh.registry.load(id).unwrap(), 0);
    }

    let (second, result) = mesh
        .coordinator
        .create_and_distribute(nyc_drop("second", 2, 3))
        .await
        .unwrap();
    assert!(result.is_complete());
    assert_eq!(second.status, DropStatus::Active);
}

#[tokio::test]
async fn test_local_fragments_placed_by_rebalance() {
    let temp_dir = TempDir::new().unwrap();
    let mesh = create_mesh(&temp_dir, 2);
    // The two most trusted nodes rank first and drop their deliveries
    for id in &mesh.node_ids[3..] {
        mesh.transport.set_unreachable(id, true);
    }

    let (drop, result) = mesh
        .coordinator
        .create_and_distribute(nyc_drop("recover", 2, 3))
        .await
        .unwrap();
    assert_eq!(result.fragments_distributed, 1);
    assert_eq!(result.errors.len(), 2);
    assert_eq!(drop.status, DropStatus::Distributed);

    for id in &mesh.node_ids[3..] {
        mesh.transport.set_unreachable(id, false);
    }
    let moved = mesh.coordinator.rebalance_fragments(&drop.id).await.unwrap();
    assert_eq!(moved, 2);

    let status = mesh.coordinator.get_distribution_status(&drop.id).await.unwrap();
    assert_eq!(status.local, 0);
    assert_eq!(status.status, DropStatus::Active);
}

#[tokio::test]
async fn test_transfer_log_records_every_move() {
    let temp_dir = TempDir::new().unwrap();
    let mesh = create_mesh(&temp_dir, 4);
    mesh.transport.set_unreachable(&mesh.node_ids[4], true);

    let (drop, _) = mesh
        .coordinator
        .create_and_distribute(nyc_drop("audited", 3, 5))
        .await
        .unwrap();

    let log: &Arc<TransferLog> = mesh.coordinator.transfer_log();
    let entries = log.entries_for_drop(&drop.id).unwrap();
    assert_eq!(entries.len(), 5);
    assert_eq!(
        entries
            .iter()
            .filter(|e| matches!(e.outcome, TransferOutcome::Failure { .. }))
            .count(),
        1
    );
    assert!(entries.iter().all(|e| e.from_node.is_none()));
    assert!(log.verify_chain(1, log.current_seq()).unwrap());
}

#[tokio::test]
async fn test_expired_drop_cannot_be_collected() {
    let temp_dir = TempDir::new().unwrap();
    let mesh = create_mesh(&temp_dir, 4);

    let (drop, _) = mesh
        .coordinator
        .create_and_distribute(
            nyc_drop("brief", 2, 3).with_expiry(Utc::now() + Duration::milliseconds(50)),
        )
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let err = mesh
        .coordinator
        .collect_fragments(&drop.id, &mesh.node_ids)
        .await
        .unwrap_err();
    assert!(matches!(err, DropError::Expired(_)));

    let status = mesh.coordinator.get_distribution_status(&drop.id).await.unwrap();
    assert_eq!(status.status, DropStatus::Expired);
}

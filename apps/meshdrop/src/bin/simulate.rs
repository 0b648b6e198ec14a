//! Mesh dead drop simulator.
//!
//! Runs one drop end to end against in-process nodes: create and distribute,
//! verify the collector's location, lose two nodes, rebalance, collect.
//!
//! ## Environment
//!
//! All `MESHDROP_*` settings apply. `MESHDROP_DB_PATH` is where the drop,
//! its fragments and the transfer log are written.

use std::sync::Arc;

use anyhow::{Context, bail};
use meshdrop::crypto::MeshKeyPair;
use meshdrop::distribution::{
    Coordinator, CreateDropRequest, InMemoryNodeRegistry, LoopbackTransport, MeshNode,
    TargetLocation,
};
use meshdrop::location::{BeaconSignal, Coordinates, HistoryScope, LocationClaim, LocationHistoryStore};
use meshdrop::{Settings, Storage, telemetry};

const TARGET_LAT: f64 = 40.7128;
const TARGET_LON: f64 = -74.0060;
const SECRET: &str = "correct horse battery staple";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(message) => {
            tracing::error!("{message}");
            std::process::exit(1);
        }
    };
    if let Err(message) = settings.validate() {
        tracing::error!("{message}");
        std::process::exit(1);
    }
    if settings.escrow_key_generated() {
        tracing::warn!("MESHDROP_ESCROW_KEY not set, using a random escrow key for this run");
    }

    let storage = Storage::open(settings.db_path()).context("Failed to open storage database")?;
    let registry = Arc::new(InMemoryNodeRegistry::new());
    let transport = Arc::new(LoopbackTransport::new());

    let mut node_ids = Vec::new();
    for i in 0..5_u32 {
        let id = format!("node-{i}");
        let keys = MeshKeyPair::generate();
        let location = Coordinates::new(TARGET_LAT + f64::from(i) * 0.0002, TARGET_LON)?;
        registry.register(
            MeshNode::new(id.clone(), keys.public_key, 3)
                .with_trust(0.70 + f64::from(i) * 0.05)
                .with_location(location),
        )?;
        node_ids.push(id);
    }

    let coordinator = Coordinator::new(
        storage,
        Arc::clone(&registry),
        Arc::clone(&transport),
        settings.clone(),
    )?;

    let request = CreateDropRequest::new(
        "simulator",
        SECRET,
        TargetLocation::new(TARGET_LAT, TARGET_LON, 50.0),
        3,
        5,
    )
    .with_beacon();
    let (drop, distribution) = coordinator.create_and_distribute(request).await?;
    tracing::info!(
        drop_id = %drop.id,
        status = %drop.status,
        distributed = distribution.fragments_distributed,
        local = distribution.fragments_local,
        "Drop placed"
    );

    let history = LocationHistoryStore::new(settings.history_limit());
    let claim = LocationClaim::at(TARGET_LAT + 0.0001, TARGET_LON, 8.0).with_beacons(vec![
        BeaconSignal::new("node-0", -60),
        BeaconSignal::new("node-1", -65),
    ]);
    let response = coordinator
        .verify_access(
            &drop.id,
            &claim,
            Some(HistoryScope::new(&history, "collector")),
        )
        .await?;
    tracing::info!(
        result = %response.result,
        confidence = response.confidence,
        distance_m = response.distance_m,
        "Collector location checked"
    );
    response.ensure_granted()?;

    for offline in &node_ids[..2] {
        registry.set_online(offline, false)?;
    }
    let status = coordinator.get_distribution_status(&drop.id).await?;
    tracing::info!(
        available = status.available,
        health = %status.health,
        "Two nodes went offline"
    );

    let moved = coordinator.rebalance_fragments(&drop.id).await?;
    tracing::info!(moved, "Rebalanced fragments");

    let online: Vec<String> = node_ids[2..].to_vec();
    let collection = coordinator.collect_fragments(&drop.id, &online).await?;
    if !collection.success {
        bail!("collection failed: {}", collection.message);
    }

    let log = coordinator.transfer_log();
    let chain_ok = log.verify_chain(1, log.current_seq())?;
    tracing::info!(
        collected = collection.fragments_collected,
        transfers = log.current_seq(),
        chain_ok,
        "Drop collected"
    );

    match collection.secret_utf8() {
        Some(secret) => println!("{secret}"),
        None => bail!("reconstructed secret is not UTF-8"),
    }

    Ok(())
}

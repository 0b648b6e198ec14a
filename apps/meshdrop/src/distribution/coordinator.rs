//! Dead drop coordinator.
//!
//! Owns the drop lifecycle: split and escrow a secret, place fragments on
//! mesh nodes, gate access by location, collect and reconstruct, rebalance
//! off offline nodes, cancel and expire.
//!
//! Every share is escrowed at rest, sealed to the drop's geohash cell under
//! the coordinator escrow key. Nodes receive their own copy sealed to their
//! X25519 key. Collection counts a fragment only when its holder node is
//! visible to the collector, then unseals the share from escrow and checks it
//! against the drop's Feldman commitments.
//!
//! Operations that load a drop and write it back hold that drop's lock from
//! the read to the write, including across transport awaits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::Settings;
use crate::crypto::{
    decrypt_with_location, encrypt_for_node, encrypt_with_location, serialize_payload,
};
use crate::distribution::registry::NodeRegistry;
use crate::distribution::scoring::select_nodes;
use crate::distribution::transport::MeshTransport;
use crate::distribution::types::{
    CollectionResult, CreateDropRequest, DeadDrop, DistributionResult, DistributionStatus,
    DropHealth, DropId, DropStatus, Fragment, FragmentHolder, MeshNode, NodeAssignment, NodeId,
};
use crate::error::{DropError, DropResult};
use crate::location::{
    Coordinates, HistoryScope, LocationClaim, LocationVerifier, VerificationPolicy,
    VerificationResponse,
};
use crate::sharing::{Commitments, Share, reconstruct_with_threshold, split, verify_share};
use crate::storage::Storage;
use crate::transfer_log::{TransferLog, TransferOutcome};

/// Fragment distribution coordinator.
pub struct Coordinator<R: NodeRegistry, T: MeshTransport> {
    storage: Storage,
    registry: Arc<R>,
    transport: Arc<T>,
    transfer_log: Arc<TransferLog>,
    settings: Settings,
    verifier: LocationVerifier,
    rng: Mutex<StdRng>,
    drop_locks: Mutex<HashMap<DropId, Arc<AsyncMutex<()>>>>,
}

impl<R: NodeRegistry, T: MeshTransport> Coordinator<R, T> {
    pub fn new(
        storage: Storage,
        registry: Arc<R>,
        transport: Arc<T>,
        settings: Settings,
    ) -> DropResult<Self> {
        let transfer_log = TransferLog::new(storage.clone())?;

        Ok(Self {
            storage,
            registry,
            transport,
            transfer_log: Arc::new(transfer_log),
            verifier: LocationVerifier::new(settings.max_speed_mps()),
            settings,
            rng: Mutex::new(StdRng::from_entropy()),
            drop_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Use a fixed RNG for node selection.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Use an existing transfer log, e.g. one opened with a persistent key.
    pub fn with_transfer_log(mut self, transfer_log: Arc<TransferLog>) -> Self {
        self.transfer_log = transfer_log;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    pub fn transfer_log(&self) -> &Arc<TransferLog> {
        &self.transfer_log
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn lock_rng(&self) -> DropResult<MutexGuard<'_, StdRng>> {
        self.rng
            .lock()
            .map_err(|_| DropError::Internal("node selection rng lock poisoned".to_string()))
    }

    /// Serialize read-modify-write operations on one drop.
    async fn lock_drop(&self, drop_id: &DropId) -> DropResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .drop_locks
                .lock()
                .map_err(|_| DropError::Internal("drop lock table poisoned".to_string()))?;
            Arc::clone(locks.entry(*drop_id).or_default())
        };
        Ok(lock.lock_owned().await)
    }

    /// Drop the lock entry of a drop that reached a terminal status. Later
    /// callers see the terminal status and never write the drop again.
    fn forget_drop_lock(&self, drop_id: &DropId) {
        if let Ok(mut locks) = self.drop_locks.lock() {
            locks.remove(drop_id);
        }
    }

    /// Load a drop or fail with [`DropError::DropNotFound`].
    pub fn get_drop(&self, drop_id: &DropId) -> DropResult<DeadDrop> {
        self.storage
            .get_drop(drop_id)?
            .ok_or_else(|| DropError::DropNotFound(drop_id.to_string()))
    }

    // =========================================================================
    // Creation and placement
    // =========================================================================

    /// Split a secret, persist the drop and place its fragments.
    ///
    /// Placement failures are not fatal: the fragment stays with the
    /// coordinator and the failure is listed in the result.
    pub async fn create_and_distribute(
        &self,
        request: CreateDropRequest,
    ) -> DropResult<(DeadDrop, DistributionResult)> {
        let target = Coordinates::new(request.target.lat, request.target.lon)?;
        if !request.target.radius_m.is_finite() || request.target.radius_m <= 0.0 {
            return Err(DropError::InvalidInput(format!(
                "radius {} must be a positive number of meters",
                request.target.radius_m
            )));
        }

        let now = Utc::now();
        let expires_at = match request.expires_at {
            Some(at) => at,
            None => now
                .checked_add_signed(self.settings.drop_expiry())
                .ok_or_else(|| {
                    DropError::InvalidInput("default drop expiry is out of range".to_string())
                })?,
        };
        if expires_at <= now {
            return Err(DropError::InvalidInput(
                "expiry must be in the future".to_string(),
            ));
        }

        let threshold = usize::from(request.threshold);
        let sharing = split(&request.secret, threshold, usize::from(request.total), true)?;

        let mut drop = DeadDrop {
            id: Uuid::new_v4(),
            owner_id: request.owner_id,
            target: request.target,
            threshold: request.threshold,
            total: request.total,
            secret_hash: sharing.secret_hash.clone(),
            secret_len: sharing.secret_len,
            commitments: sharing
                .commitments
                .as_ref()
                .map(Commitments::to_hex)
                .unwrap_or_default(),
            status: DropStatus::Pending,
            strategy: request.strategy.unwrap_or(self.settings.strategy()),
            require_beacon: request.require_beacon,
            require_tap: request.require_tap,
            created_at: now,
            expires_at,
            collected_at: None,
        };

        let mut fragments = sharing
            .shares
            .iter()
            .map(|share| -> DropResult<Fragment> {
                let encoded = Zeroizing::new(share.to_bytes()?);
                let escrow = encrypt_with_location(
                    &encoded,
                    target.lat,
                    target.lon,
                    self.settings.geohash_precision(),
                    Some(self.settings.escrow_key().as_bytes()),
                )?;
                Ok(Fragment::new(drop.id, share.index, escrow))
            })
            .collect::<DropResult<Vec<_>>>()?;

        self.storage.create_drop_with_fragments(&drop, &fragments)?;
        let _guard = self.lock_drop(&drop.id).await?;

        tracing::info!(
            drop_id = %drop.id,
            owner_id = %drop.owner_id,
            threshold = drop.threshold,
            total = drop.total,
            strategy = %drop.strategy,
            "Dead drop created"
        );

        let candidates = self.registry.online_nodes()?;
        let selected = {
            let mut rng = self.lock_rng()?;
            select_nodes(
                &candidates,
                drop.strategy,
                &target,
                fragments.len(),
                &mut *rng,
            )
        };

        let mut result = DistributionResult {
            dead_drop_id: drop.id,
            fragments_total: fragments.len(),
            fragments_distributed: 0,
            fragments_local: 0,
            assignments: Vec::with_capacity(selected.len()),
            errors: Vec::new(),
        };

        for (position, (fragment, share)) in fragments
            .iter_mut()
            .zip(sharing.shares.iter())
            .enumerate()
        {
            let Some(node) = selected.get(position) else {
                result.fragments_local += 1;
                result.errors.push(format!(
                    "fragment {}: no mesh node available, kept locally",
                    fragment.index
                ));
                continue;
            };

            match self.place(fragment, share, node, None).await {
                Ok(()) => {
                    result.fragments_distributed += 1;
                    result.assignments.push(NodeAssignment {
                        index: fragment.index,
                        node_id: node.id.clone(),
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        drop_id = %drop.id,
                        fragment = fragment.index,
                        node_id = %node.id,
                        error = %err,
                        "Fragment placement failed, keeping locally"
                    );
                    result.fragments_local += 1;
                    result
                        .errors
                        .push(format!("fragment {}: {err}; kept locally", fragment.index));
                }
            }
        }

        drop.status = if result.fragments_distributed >= threshold {
            DropStatus::Active
        } else {
            DropStatus::Distributed
        };
        self.storage.put_drop_and_fragments(&drop, &fragments)?;

        tracing::info!(
            drop_id = %drop.id,
            status = %drop.status,
            distributed = result.fragments_distributed,
            local = result.fragments_local,
            "Dead drop distributed"
        );

        Ok((drop, result))
    }

    /// Place one fragment on `node` and persist it.
    pub async fn assign_fragment_to_node(
        &self,
        fragment: &mut Fragment,
        share: &Share,
        node: &MeshNode,
    ) -> DropResult<()> {
        let _guard = self.lock_drop(&fragment.dead_drop_id).await?;
        let drop = self.get_drop(&fragment.dead_drop_id)?;
        if drop.status.is_terminal() {
            return Err(DropError::InvalidState {
                expected: "pending, distributed or active".to_string(),
                actual: drop.status.to_string(),
            });
        }

        self.place(fragment, share, node, None).await?;
        self.storage.put_fragment(fragment)
    }

    /// Reserve a slot, deliver, and record the move. The slot is returned on
    /// any delivery failure.
    async fn place(
        &self,
        fragment: &mut Fragment,
        share: &Share,
        node: &MeshNode,
        from_node: Option<NodeId>,
    ) -> DropResult<()> {
        if share.index != fragment.index {
            return Err(DropError::InvalidShare(format!(
                "share {} does not belong to fragment {}",
                share.index, fragment.index
            )));
        }

        self.registry.try_reserve_slot(&node.id)?;

        match self.deliver(fragment, share, node).await {
            Ok(wire) => {
                fragment.holder = FragmentHolder::Node(node.id.clone());
                fragment.ciphertext = Some(wire);
                fragment.is_distributed = true;
                fragment.is_available = true;
                fragment.updated_at = Utc::now();

                self.transfer_log.append(
                    fragment.dead_drop_id,
                    fragment.index,
                    from_node,
                    fragment.holder.clone(),
                    TransferOutcome::Success,
                )?;

                tracing::debug!(
                    drop_id = %fragment.dead_drop_id,
                    fragment = fragment.index,
                    node_id = %node.id,
                    "Fragment delivered"
                );
                Ok(())
            }
            Err(err) => {
                if let Err(release_err) = self.registry.release_slot(&node.id) {
                    tracing::warn!(node_id = %node.id, error = %release_err, "Failed to release slot");
                }
                self.transfer_log.append(
                    fragment.dead_drop_id,
                    fragment.index,
                    from_node,
                    FragmentHolder::Node(node.id.clone()),
                    TransferOutcome::Failure {
                        reason: err.to_string(),
                    },
                )?;
                Err(err)
            }
        }
    }

    /// Seal the share for `node` and send it under the transfer timeout.
    async fn deliver(&self, fragment: &Fragment, share: &Share, node: &MeshNode) -> DropResult<Vec<u8>> {
        let wire = {
            let plaintext = Zeroizing::new(share.to_bytes()?);
            let aad = fragment.aad();
            let payload = encrypt_for_node(&plaintext, &node.public_key, Some(aad.as_bytes()))?;
            serialize_payload(&payload)?
        };

        let timeout = self.settings.transfer_timeout();
        match tokio::time::timeout(timeout, self.transport.send(&node.id, &wire)).await {
            Ok(Ok(())) => Ok(wire),
            Ok(Err(err)) => Err(DropError::TransferFailed {
                node_id: node.id.clone(),
                reason: err.to_string(),
            }),
            Err(_) => Err(DropError::TransferFailed {
                node_id: node.id.clone(),
                reason: format!("timed out after {} ms", timeout.as_millis()),
            }),
        }
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Check a location claim against the drop's target and requirements.
    pub async fn verify_access(
        &self,
        drop_id: &DropId,
        claim: &LocationClaim,
        history: Option<HistoryScope<'_>>,
    ) -> DropResult<VerificationResponse> {
        let _guard = self.lock_drop(drop_id).await?;
        let mut drop = self.get_drop(drop_id)?;
        let mut fragments = self.storage.list_fragments(drop_id)?;
        self.ensure_accessible(&mut drop, &mut fragments)?;

        let mut policy = VerificationPolicy::new(drop.target.coordinates(), drop.target.radius_m);
        if drop.require_beacon {
            policy = policy.require_beacons(self.settings.min_beacons());
        }
        if drop.require_tap {
            policy = policy.require_tap(None);
        }

        let response = self.verifier.verify(claim, &policy, history)?;
        if response.is_success() {
            tracing::info!(
                drop_id = %drop.id,
                confidence = response.confidence,
                "Location access granted"
            );
        } else {
            tracing::warn!(
                drop_id = %drop.id,
                result = %response.result,
                confidence = response.confidence,
                message = %response.message,
                "Location access denied"
            );
        }
        Ok(response)
    }

    /// Collect fragments held by the visible nodes and reconstruct once the
    /// threshold is met.
    ///
    /// Fragments collected by earlier attempts still count. A reconstruction
    /// that fails its hash check is reported in the result and leaves the
    /// drop open.
    pub async fn collect_fragments(
        &self,
        drop_id: &DropId,
        visible_node_ids: &[NodeId],
    ) -> DropResult<CollectionResult> {
        let _guard = self.lock_drop(drop_id).await?;
        let mut drop = self.get_drop(drop_id)?;
        let mut fragments = self.storage.list_fragments(drop_id)?;
        self.ensure_accessible(&mut drop, &mut fragments)?;

        let now = Utc::now();
        let visible: HashSet<&str> = visible_node_ids.iter().map(String::as_str).collect();
        for fragment in &mut fragments {
            let on_visible_node = fragment
                .holder
                .node_id()
                .is_some_and(|id| visible.contains(id));
            if fragment.is_available && !fragment.is_collected && on_visible_node {
                fragment.is_collected = true;
                fragment.updated_at = now;
            }
        }

        let threshold = usize::from(drop.threshold);
        let commitments = Commitments::from_hex(&drop.commitments)?;
        let mut errors = Vec::new();
        let mut shares = Vec::new();
        for fragment in fragments.iter().filter(|f| f.is_collected) {
            match self.unseal_share(&drop, fragment) {
                Ok(share)
                    if commitments.is_empty()
                        || verify_share(&share, &commitments, threshold) =>
                {
                    shares.push(share);
                }
                Ok(share) => errors.push(format!(
                    "fragment {}: share does not match the drop commitments",
                    share.index
                )),
                Err(err) => errors.push(format!("fragment {}: {err}", fragment.index)),
            }
        }

        let fragments_collected = shares.len();
        if fragments_collected < threshold {
            self.storage.put_fragments(&fragments)?;
            let shortfall = DropError::InsufficientFragments {
                needed: threshold,
                have: fragments_collected,
            };
            tracing::info!(
                drop_id = %drop.id,
                collected = fragments_collected,
                needed = threshold,
                "Collection below threshold"
            );
            return Ok(CollectionResult {
                success: false,
                fragments_collected,
                fragments_needed: threshold,
                reconstructed_secret: None,
                message: shortfall.to_string(),
                errors,
            });
        }

        match reconstruct_with_threshold(
            &shares,
            threshold,
            drop.secret_len,
            Some(&drop.secret_hash),
        ) {
            Ok(secret) => {
                drop.status = DropStatus::Collected;
                drop.collected_at = Some(Utc::now());
                self.retire_fragments(&mut fragments);
                self.storage.put_drop_and_fragments(&drop, &fragments)?;
                self.forget_drop_lock(&drop.id);

                tracing::info!(
                    drop_id = %drop.id,
                    collected = fragments_collected,
                    "Dead drop collected"
                );

                Ok(CollectionResult {
                    success: true,
                    fragments_collected,
                    fragments_needed: threshold,
                    reconstructed_secret: Some(secret),
                    message: format!(
                        "Secret reconstructed from {threshold} of {} fragments",
                        drop.total
                    ),
                    errors,
                })
            }
            Err(err) => {
                self.storage.put_fragments(&fragments)?;
                tracing::warn!(drop_id = %drop.id, error = %err, "Reconstruction failed");
                errors.push(err.to_string());
                Ok(CollectionResult {
                    success: false,
                    fragments_collected,
                    fragments_needed: threshold,
                    reconstructed_secret: None,
                    message: format!("Reconstruction failed: {err}"),
                    errors,
                })
            }
        }
    }

    fn unseal_share(&self, drop: &DeadDrop, fragment: &Fragment) -> DropResult<Share> {
        let encoded = Zeroizing::new(decrypt_with_location(
            &fragment.escrow,
            drop.target.lat,
            drop.target.lon,
            Some(self.settings.escrow_key().as_bytes()),
        )?);
        let share = Share::from_bytes(&encoded)?;
        if share.index != fragment.index {
            return Err(DropError::InvalidShare(format!(
                "escrow for fragment {} holds share {}",
                fragment.index, share.index
            )));
        }
        Ok(share)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Placement summary. Expiry is applied but never reported as an error.
    pub async fn get_distribution_status(
        &self,
        drop_id: &DropId,
    ) -> DropResult<DistributionStatus> {
        let _guard = self.lock_drop(drop_id).await?;
        let mut drop = self.get_drop(drop_id)?;
        let mut fragments = self.storage.list_fragments(drop_id)?;
        self.expire_if_due(&mut drop, &mut fragments)?;

        let mut online_holders = HashSet::new();
        let mut available = 0;
        for fragment in &fragments {
            let Some(node_id) = fragment.holder.node_id() else {
                continue;
            };
            let online = self.registry.get(node_id)?.is_some_and(|node| node.is_online);
            if online {
                online_holders.insert(node_id);
                if fragment.is_available {
                    available += 1;
                }
            }
        }

        let health = if available < usize::from(drop.threshold) {
            DropHealth::Degraded
        } else {
            DropHealth::Good
        };

        Ok(DistributionStatus {
            dead_drop_id: drop.id,
            status: drop.status,
            threshold: drop.threshold,
            total: drop.total,
            distributed: fragments.iter().filter(|f| f.is_distributed).count(),
            available,
            collected: fragments.iter().filter(|f| f.is_collected).count(),
            local: fragments
                .iter()
                .filter(|f| f.holder == FragmentHolder::Local)
                .count(),
            nodes_online: online_holders.len(),
            health,
        })
    }

    /// Move uncollected fragments off offline nodes, and place locally kept
    /// fragments, onto random online nodes with spare capacity.
    ///
    /// Nodes not already holding part of this drop are preferred. Returns the
    /// number of fragments moved; fragments without a destination stay put.
    pub async fn rebalance_fragments(&self, drop_id: &DropId) -> DropResult<usize> {
        let _guard = self.lock_drop(drop_id).await?;
        let mut drop = self.get_drop(drop_id)?;
        let mut fragments = self.storage.list_fragments(drop_id)?;
        self.ensure_accessible(&mut drop, &mut fragments)?;

        let mut moved = 0;
        for position in 0..fragments.len() {
            if fragments[position].is_collected {
                continue;
            }

            let from_node = match &fragments[position].holder {
                FragmentHolder::Node(id) => {
                    if self.registry.get(id)?.is_some_and(|node| node.is_online) {
                        continue;
                    }
                    Some(id.clone())
                }
                FragmentHolder::Local => None,
            };

            let holders: HashSet<NodeId> = fragments
                .iter()
                .filter_map(|f| f.holder.node_id().map(str::to_string))
                .collect();
            let candidates: Vec<MeshNode> = self
                .registry
                .online_nodes()?
                .into_iter()
                .filter(|node| node.has_capacity() && Some(&node.id) != from_node.as_ref())
                .collect();

            let destination = {
                let fresh: Vec<&MeshNode> = candidates
                    .iter()
                    .filter(|node| !holders.contains(&node.id))
                    .collect();
                let pool: Vec<&MeshNode> = if fresh.is_empty() {
                    candidates.iter().collect()
                } else {
                    fresh
                };
                let mut rng = self.lock_rng()?;
                pool.choose(&mut *rng).map(|node| (*node).clone())
            };

            let Some(node) = destination else {
                tracing::debug!(
                    drop_id = %drop.id,
                    fragment = fragments[position].index,
                    "No destination for fragment"
                );
                continue;
            };

            let share = match self.unseal_share(&drop, &fragments[position]) {
                Ok(share) => share,
                Err(err) => {
                    tracing::warn!(
                        drop_id = %drop.id,
                        fragment = fragments[position].index,
                        error = %err,
                        "Cannot recover share for rebalancing"
                    );
                    continue;
                }
            };

            let fragment = &mut fragments[position];
            match self.place(fragment, &share, &node, from_node.clone()).await {
                Ok(()) => {
                    if let Some(old) = &from_node {
                        if let Err(err) = self.registry.release_slot(old) {
                            tracing::warn!(node_id = %old, error = %err, "Failed to release slot");
                        }
                    }
                    moved += 1;
                    tracing::info!(
                        drop_id = %drop.id,
                        fragment = fragment.index,
                        from = from_node.as_deref().unwrap_or("local"),
                        to = %node.id,
                        "Fragment rebalanced"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        drop_id = %drop.id,
                        fragment = fragment.index,
                        node_id = %node.id,
                        error = %err,
                        "Rebalance placement failed"
                    );
                }
            }
        }

        if moved > 0 {
            let on_nodes = fragments.iter().filter(|f| f.holds_node_slot()).count();
            if drop.status == DropStatus::Distributed && on_nodes >= usize::from(drop.threshold) {
                drop.status = DropStatus::Active;
            }
            self.storage.put_drop_and_fragments(&drop, &fragments)?;
        }

        Ok(moved)
    }

    /// Withdraw a drop and free every node slot it holds.
    pub async fn cancel_drop(&self, drop_id: &DropId) -> DropResult<DeadDrop> {
        let _guard = self.lock_drop(drop_id).await?;
        let mut drop = self.get_drop(drop_id)?;
        let mut fragments = self.storage.list_fragments(drop_id)?;
        self.expire_if_due(&mut drop, &mut fragments)?;

        if drop.status.is_terminal() {
            return Err(DropError::InvalidState {
                expected: "pending, distributed or active".to_string(),
                actual: drop.status.to_string(),
            });
        }

        drop.status = DropStatus::Cancelled;
        self.retire_fragments(&mut fragments);
        self.storage.put_drop_and_fragments(&drop, &fragments)?;
        self.forget_drop_lock(&drop.id);

        tracing::info!(drop_id = %drop.id, "Dead drop cancelled");
        Ok(drop)
    }

    // =========================================================================
    // Lifecycle helpers
    // =========================================================================

    /// Mark the drop expired when its time has passed. Returns whether it is
    /// now expired.
    fn expire_if_due(&self, drop: &mut DeadDrop, fragments: &mut [Fragment]) -> DropResult<bool> {
        if drop.status.is_terminal() || !drop.is_expired_at(Utc::now()) {
            return Ok(drop.status == DropStatus::Expired);
        }

        drop.status = DropStatus::Expired;
        self.retire_fragments(fragments);
        self.storage.put_drop_and_fragments(drop, fragments)?;
        self.forget_drop_lock(&drop.id);

        tracing::info!(drop_id = %drop.id, expires_at = %drop.expires_at, "Dead drop expired");
        Ok(true)
    }

    fn ensure_accessible(&self, drop: &mut DeadDrop, fragments: &mut [Fragment]) -> DropResult<()> {
        if self.expire_if_due(drop, fragments)? {
            return Err(DropError::Expired(format!(
                "dead drop {} expired at {}",
                drop.id, drop.expires_at
            )));
        }
        if !drop.status.is_accessible() {
            return Err(DropError::InvalidState {
                expected: "distributed or active".to_string(),
                actual: drop.status.to_string(),
            });
        }
        Ok(())
    }

    /// Free node slots and flag fragments unavailable. Runs once, on the
    /// transition into a terminal status.
    fn retire_fragments(&self, fragments: &mut [Fragment]) {
        let now = Utc::now();
        for fragment in fragments {
            if fragment.holds_node_slot() {
                if let Some(node_id) = fragment.holder.node_id() {
                    if let Err(err) = self.registry.release_slot(node_id) {
                        tracing::warn!(node_id, error = %err, "Failed to release slot");
                    }
                }
            }
            fragment.is_available = false;
            fragment.updated_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::crypto::{MeshKeyPair, decrypt_from_sender, deserialize_payload};
    use crate::distribution::registry::InMemoryNodeRegistry;
    use crate::distribution::transport::LoopbackTransport;
    use crate::distribution::types::TargetLocation;
    use crate::location::{BeaconSignal, VerificationResult};

    const LAT: f64 = 40.7128;
    const LON: f64 = -74.0060;

    struct Harness {
        coordinator: Coordinator<InMemoryNodeRegistry, LoopbackTransport>,
        registry: Arc<InMemoryNodeRegistry>,
        transport: Arc<LoopbackTransport>,
        keys: Vec<(NodeId, MeshKeyPair)>,
    }

    fn harness_with(nodes: usize, transport: LoopbackTransport, settings: Settings) -> Harness {
        let storage = Storage::open_memory().unwrap();
        let registry = Arc::new(InMemoryNodeRegistry::new());
        let transport = Arc::new(transport);

        let keys: Vec<_> = (0..nodes)
            .map(|i| {
                let id = format!("node-{i}");
                let pair = MeshKeyPair::generate();
                let location = Coordinates::new(LAT + i as f64 * 0.001, LON).unwrap();
                registry
                    .register(
                        MeshNode::new(id.clone(), pair.public_key, 2)
                            .with_trust(0.7 + i as f64 * 0.05)
                            .with_location(location),
                    )
                    .unwrap();
                (id, pair)
            })
            .collect();

        let coordinator =
            Coordinator::new(storage, Arc::clone(&registry), Arc::clone(&transport), settings)
                .unwrap()
                .with_rng(StdRng::seed_from_u64(42));

        Harness {
            coordinator,
            registry,
            transport,
            keys,
        }
    }

    fn harness(nodes: usize) -> Harness {
        harness_with(nodes, LoopbackTransport::new(), Settings::for_tests())
    }

    fn request(secret: &str, k: u16, n: u16) -> CreateDropRequest {
        CreateDropRequest::new("owner", secret, TargetLocation::new(LAT, LON, 50.0), k, n)
    }

    fn holders(coordinator: &Coordinator<InMemoryNodeRegistry, LoopbackTransport>, id: &DropId) -> Vec<NodeId> {
        coordinator
            .storage()
            .list_fragments(id)
            .unwrap()
            .into_iter()
            .filter_map(|f| f.holder.node_id().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_create_distributes_to_every_node() {
        let h = harness(5);
        let (drop, result) = h
            .coordinator
            .create_and_distribute(request("correct horse battery staple", 3, 5))
            .await
            .unwrap();

        assert_eq!(drop.status, DropStatus::Active);
        assert!(result.is_complete());
        assert_eq!(result.fragments_local, 0);
        assert_eq!(h.transport.delivery_count(), 5);

        let stored = h.coordinator.get_drop(&drop.id).unwrap();
        assert_eq!(stored.status, DropStatus::Active);
        assert_eq!(stored.commitments.len(), 3);

        for (id, _) in &h.keys {
            assert_eq!(h.registry.load(id).unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_node_can_open_its_payload() {
        let h = harness(3);
        let (drop, result) = h
            .coordinator
            .create_and_distribute(request("open me", 2, 3))
            .await
            .unwrap();

        let assignment = &result.assignments[0];
        let (_, pair) = h.keys.iter().find(|(id, _)| *id == assignment.node_id).unwrap();
        let wire = &h.transport.delivered_to(&assignment.node_id)[0];
        let payload = deserialize_payload(wire).unwrap();

        let aad = format!("{}:{}", drop.id, assignment.index);
        let plaintext = decrypt_from_sender(&payload, pair.secret_key(), Some(aad.as_bytes())).unwrap();
        let share = Share::from_bytes(&plaintext).unwrap();
        assert_eq!(share.index, assignment.index);

        // Bound to its fragment
        assert!(decrypt_from_sender(&payload, pair.secret_key(), Some(b"other:1")).is_err());
    }

    #[tokio::test]
    async fn test_too_few_nodes_keeps_fragments_locally() {
        let h = harness(2);
        let (drop, result) = h
            .coordinator
            .create_and_distribute(request("few nodes", 3, 5))
            .await
            .unwrap();

        assert_eq!(result.fragments_distributed, 2);
        assert_eq!(result.fragments_local, 3);
        assert_eq!(result.errors.len(), 3);
        assert_eq!(drop.status, DropStatus::Distributed);

        let status = h.coordinator.get_distribution_status(&drop.id).await.unwrap();
        assert_eq!(status.local, 3);
        assert_eq!(status.health, DropHealth::Degraded);
    }

    #[tokio::test]
    async fn test_unreachable_node_falls_back_and_releases_slot() {
        let h = harness(3);
        h.transport.set_unreachable("node-1", true);

        let (drop, result) = h
            .coordinator
            .create_and_distribute(request("flaky", 2, 3))
            .await
            .unwrap();

        assert_eq!(result.fragments_distributed, 2);
        assert_eq!(result.fragments_local, 1);
        assert!(result.errors[0].contains("node-1"));
        assert_eq!(h.registry.load("node-1").unwrap(), 0);
        assert_eq!(drop.status, DropStatus::Active);

        let failures: Vec<_> = h
            .coordinator
            .transfer_log()
            .entries_for_drop(&drop.id)
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e.outcome, TransferOutcome::Failure { .. }))
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].to, FragmentHolder::Node("node-1".to_string()));
    }

    #[tokio::test]
    async fn test_slow_transport_times_out() {
        let settings = Settings::for_tests().with_transfer_timeout(Duration::from_millis(20));
        let h = harness_with(
            2,
            LoopbackTransport::new().with_delay(Duration::from_millis(200)),
            settings,
        );

        let (drop, result) = h
            .coordinator
            .create_and_distribute(request("slow", 2, 2))
            .await
            .unwrap();

        assert_eq!(result.fragments_distributed, 0);
        assert!(result.errors.iter().all(|e| e.contains("timed out")));
        assert_eq!(drop.status, DropStatus::Distributed);
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let h = harness(3);

        let err = h
            .coordinator
            .create_and_distribute(request("secret", 1, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, DropError::InvalidThreshold { .. }));

        let err = h
            .coordinator
            .create_and_distribute(request("", 2, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, DropError::EmptySecret));

        let past = request("secret", 2, 3).with_expiry(Utc::now() - chrono::Duration::minutes(1));
        assert!(h.coordinator.create_and_distribute(past).await.is_err());

        // Nothing was placed
        assert_eq!(h.transport.delivery_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_default_expiry_rejected() {
        let settings = Settings::for_tests().with_drop_expiry_hours(i64::MAX);
        let h = harness_with(3, LoopbackTransport::new(), settings);

        let err = h
            .coordinator
            .create_and_distribute(request("forever", 2, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, DropError::InvalidInput(_)));
        assert_eq!(h.transport.delivery_count(), 0);
    }

    #[tokio::test]
    async fn test_collection_accumulates_across_attempts() {
        let h = harness(3);
        let (drop, _) = h
            .coordinator
            .create_and_distribute(request("piecemeal", 2, 3))
            .await
            .unwrap();
        let held = holders(&h.coordinator, &drop.id);

        let first = h
            .coordinator
            .collect_fragments(&drop.id, &held[..1])
            .await
            .unwrap();
        assert!(!first.success);
        assert_eq!(first.fragments_collected, 1);
        assert_eq!(first.fragments_needed, 2);
        assert!(first.message.contains("need 2, have 1"));

        let second = h
            .coordinator
            .collect_fragments(&drop.id, &held[1..2])
            .await
            .unwrap();
        assert!(second.success);
        assert_eq!(second.secret_utf8(), Some("piecemeal"));

        let stored = h.coordinator.get_drop(&drop.id).unwrap();
        assert_eq!(stored.status, DropStatus::Collected);
        assert!(stored.collected_at.is_some());
        for (id, _) in &h.keys {
            assert_eq!(h.registry.load(id).unwrap(), 0);
        }

        let again = h.coordinator.collect_fragments(&drop.id, &held).await;
        assert!(matches!(again, Err(DropError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_hash_mismatch_leaves_drop_open() {
        let h = harness(3);
        let (mut drop, _) = h
            .coordinator
            .create_and_distribute(request("tamper", 2, 3))
            .await
            .unwrap();

        drop.status = DropStatus::Active;
        drop.secret_hash = "ff".repeat(32);
        h.coordinator.storage().put_drop(&drop).unwrap();

        let held = holders(&h.coordinator, &drop.id);
        let result = h.coordinator.collect_fragments(&drop.id, &held).await.unwrap();
        assert!(!result.success);
        assert!(result.reconstructed_secret.is_none());
        assert!(result.errors.iter().any(|e| e.contains("does not match")));
        assert_eq!(
            h.coordinator.get_drop(&drop.id).unwrap().status,
            DropStatus::Active
        );
    }

    #[tokio::test]
    async fn test_expired_drop_is_rejected_and_frees_nodes() {
        let h = harness(3);
        let (mut drop, _) = h
            .coordinator
            .create_and_distribute(request("stale", 2, 3))
            .await
            .unwrap();

        drop.expires_at = Utc::now() - chrono::Duration::seconds(1);
        h.coordinator.storage().put_drop(&drop).unwrap();

        let held = holders(&h.coordinator, &drop.id);
        let err = h.coordinator.collect_fragments(&drop.id, &held).await.unwrap_err();
        assert!(matches!(err, DropError::Expired(_)));
        assert_eq!(
            h.coordinator.get_drop(&drop.id).unwrap().status,
            DropStatus::Expired
        );
        for (id, _) in &h.keys {
            assert_eq!(h.registry.load(id).unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_rebalance_moves_fragments_off_offline_nodes() {
        let h = harness(5);
        let (drop, _) = h
            .coordinator
            .create_and_distribute(request("move me", 2, 3))
            .await
            .unwrap();

        let held = holders(&h.coordinator, &drop.id);
        h.registry.set_online(&held[0], false).unwrap();

        let moved = h.coordinator.rebalance_fragments(&drop.id).await.unwrap();
        assert_eq!(moved, 1);
        assert_eq!(h.registry.load(&held[0]).unwrap(), 0);

        let after = holders(&h.coordinator, &drop.id);
        assert!(!after.contains(&held[0]));
        // Two spare nodes were free, so the fragment lands on a fresh one
        let distinct: HashSet<_> = after.iter().collect();
        assert_eq!(distinct.len(), 3);

        let status = h.coordinator.get_distribution_status(&drop.id).await.unwrap();
        assert_eq!(status.available, 3);
        assert_eq!(status.health, DropHealth::Good);

        // Nothing left to move
        assert_eq!(h.coordinator.rebalance_fragments(&drop.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slow_rebalance_cannot_reopen_collected_drop() {
        let h = harness_with(
            3,
            LoopbackTransport::new().with_delay(Duration::from_millis(50)),
            Settings::for_tests(),
        );
        let (drop, _) = h
            .coordinator
            .create_and_distribute(request("race", 2, 3))
            .await
            .unwrap();

        let held = holders(&h.coordinator, &drop.id);
        h.registry.set_online(&held[0], false).unwrap();

        let (moved, collected) = tokio::join!(
            h.coordinator.rebalance_fragments(&drop.id),
            h.coordinator.collect_fragments(&drop.id, &held[1..]),
        );

        // Whichever runs second sees the other's result
        assert!(matches!(moved, Ok(_) | Err(DropError::InvalidState { .. })));
        let collected = collected.unwrap();
        assert!(collected.success, "{}", collected.message);
        assert_eq!(collected.secret_utf8(), Some("race"));

        let stored = h.coordinator.get_drop(&drop.id).unwrap();
        assert_eq!(stored.status, DropStatus::Collected);
        assert!(
            h.coordinator
                .storage()
                .list_fragments(&drop.id)
                .unwrap()
                .iter()
                .all(|f| !f.is_available)
        );
        for (id, _) in &h.keys {
            assert_eq!(h.registry.load(id).unwrap(), 0, "{id} still holds a slot");
        }
    }

    #[tokio::test]
    async fn test_cancel_releases_capacity() {
        let h = harness(3);
        let (drop, _) = h
            .coordinator
            .create_and_distribute(request("withdraw", 2, 3))
            .await
            .unwrap();

        let cancelled = h.coordinator.cancel_drop(&drop.id).await.unwrap();
        assert_eq!(cancelled.status, DropStatus::Cancelled);
        for (id, _) in &h.keys {
            assert_eq!(h.registry.load(id).unwrap(), 0);
        }

        assert!(h.coordinator.cancel_drop(&drop.id).await.is_err());
        let held = holders(&h.coordinator, &drop.id);
        assert!(matches!(
            h.coordinator.collect_fragments(&drop.id, &held).await,
            Err(DropError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_access_uses_drop_requirements() {
        let h = harness(3);
        let (drop, _) = h
            .coordinator
            .create_and_distribute(request("beacons", 2, 3).with_beacon())
            .await
            .unwrap();

        let bare = LocationClaim::at(LAT, LON, 5.0);
        let denied = h.coordinator.verify_access(&drop.id, &bare, None).await.unwrap();
        assert!(!denied.is_success());

        let with_beacons = LocationClaim::at(LAT, LON, 5.0).with_beacons(vec![
            BeaconSignal::new("node-0", -60),
            BeaconSignal::new("node-1", -65),
        ]);
        let granted = h
            .coordinator
            .verify_access(&drop.id, &with_beacons, None)
            .await
            .unwrap();
        assert_eq!(granted.result, VerificationResult::Success);
    }

    #[tokio::test]
    async fn test_unknown_drop() {
        let h = harness(1);
        let missing = Uuid::new_v4();
        assert!(matches!(
            h.coordinator.get_distribution_status(&missing).await,
            Err(DropError::DropNotFound(_))
        ));
    }
}

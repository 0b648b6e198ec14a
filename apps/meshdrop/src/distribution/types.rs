//! Dead drop, fragment and mesh node types.
//!
//! Records here are persisted as JSON in ReDB and returned to callers, so
//! secret material never appears in them except as ciphertext.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::DistributionStrategy;
use crate::crypto::{LocationSealed, PublicKey};
use crate::location::Coordinates;

/// Dead drop identifier.
pub type DropId = Uuid;

/// Mesh node identifier.
pub type NodeId = String;

// =============================================================================
// Dead drops
// =============================================================================

/// Dead drop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropStatus {
    /// Persisted, fragments not yet placed.
    Pending,
    /// Placed, but fewer than the threshold reached mesh nodes.
    Distributed,
    /// At least the threshold of fragments are held by mesh nodes.
    Active,
    /// Secret reconstructed.
    Collected,
    /// Past its expiry time.
    Expired,
    /// Withdrawn by the owner.
    Cancelled,
}

impl DropStatus {
    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Collected | Self::Expired | Self::Cancelled)
    }

    /// Fragments may be collected or verified against.
    pub fn is_accessible(self) -> bool {
        matches!(self, Self::Distributed | Self::Active)
    }
}

impl std::fmt::Display for DropStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Distributed => write!(f, "distributed"),
            Self::Active => write!(f, "active"),
            Self::Collected => write!(f, "collected"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Where the drop is hidden.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetLocation {
    pub lat: f64,
    pub lon: f64,
    pub radius_m: f64,
}

impl TargetLocation {
    pub fn new(lat: f64, lon: f64, radius_m: f64) -> Self {
        Self { lat, lon, radius_m }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            lat: self.lat,
            lon: self.lon,
        }
    }
}

/// A secret split across mesh nodes at a physical location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadDrop {
    pub id: DropId,
    pub owner_id: String,
    pub target: TargetLocation,
    /// Fragments needed to reconstruct (k).
    pub threshold: u16,
    /// Fragments created (n).
    pub total: u16,
    /// SHA-256 of the secret (hex).
    pub secret_hash: String,
    pub secret_len: usize,
    /// Feldman commitments (hex), one per polynomial coefficient.
    pub commitments: Vec<String>,
    pub status: DropStatus,
    pub strategy: DistributionStrategy,
    pub require_beacon: bool,
    pub require_tap: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_at: Option<DateTime<Utc>>,
}

impl DeadDrop {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Request to create and distribute a drop.
pub struct CreateDropRequest {
    pub owner_id: String,
    pub secret: Zeroizing<Vec<u8>>,
    pub target: TargetLocation,
    pub threshold: u16,
    pub total: u16,
    /// Falls back to the configured default.
    pub strategy: Option<DistributionStrategy>,
    /// Falls back to now plus the configured lifetime.
    pub expires_at: Option<DateTime<Utc>>,
    pub require_beacon: bool,
    pub require_tap: bool,
}

impl CreateDropRequest {
    pub fn new(
        owner_id: impl Into<String>,
        secret: impl Into<Vec<u8>>,
        target: TargetLocation,
        threshold: u16,
        total: u16,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            secret: Zeroizing::new(secret.into()),
            target,
            threshold,
            total,
            strategy: None,
            expires_at: None,
            require_beacon: false,
            require_tap: false,
        }
    }

    pub fn with_strategy(mut self, strategy: DistributionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_beacon(mut self) -> Self {
        self.require_beacon = true;
        self
    }

    pub fn with_tap(mut self) -> Self {
        self.require_tap = true;
        self
    }
}

impl std::fmt::Debug for CreateDropRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateDropRequest")
            .field("owner_id", &self.owner_id)
            .field("secret_len", &self.secret.len())
            .field("target", &self.target)
            .field("threshold", &self.threshold)
            .field("total", &self.total)
            .field("strategy", &self.strategy)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Fragments
// =============================================================================

/// Who currently holds a fragment's ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "node_id", rename_all = "snake_case")]
pub enum FragmentHolder {
    Node(NodeId),
    /// Kept by the coordinator after a failed or impossible placement.
    Local,
}

impl FragmentHolder {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::Node(id) => Some(id),
            Self::Local => None,
        }
    }
}

impl std::fmt::Display for FragmentHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node(id) => write!(f, "node:{id}"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// One share of a drop and its placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub dead_drop_id: DropId,
    /// Share index, 1-based and unique within the drop.
    pub index: u16,
    pub holder: FragmentHolder,
    /// Wire payload delivered to the holder node.
    #[serde(default)]
    pub ciphertext: Option<Vec<u8>>,
    /// Share sealed to the drop's geohash cell under the escrow key.
    pub escrow: LocationSealed,
    pub is_distributed: bool,
    pub is_available: bool,
    pub is_collected: bool,
    pub updated_at: DateTime<Utc>,
}

impl Fragment {
    pub fn new(dead_drop_id: DropId, index: u16, escrow: LocationSealed) -> Self {
        Self {
            dead_drop_id,
            index,
            holder: FragmentHolder::Local,
            ciphertext: None,
            escrow,
            is_distributed: false,
            is_available: false,
            is_collected: false,
            updated_at: Utc::now(),
        }
    }

    /// Associated data binding a node payload to this fragment.
    pub fn aad(&self) -> String {
        format!("{}:{}", self.dead_drop_id, self.index)
    }

    /// Currently occupies a capacity slot on `holder`.
    pub fn holds_node_slot(&self) -> bool {
        matches!(self.holder, FragmentHolder::Node(_)) && self.is_distributed
    }
}

// =============================================================================
// Mesh nodes
// =============================================================================

/// Snapshot of a mesh node as seen by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshNode {
    pub id: NodeId,
    #[serde(with = "hex::serde")]
    pub public_key: PublicKey,
    /// Trust in `[0, 1]`.
    pub trust_score: f64,
    #[serde(default)]
    pub last_known_location: Option<Coordinates>,
    pub capacity: u32,
    pub current_load: u32,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

impl MeshNode {
    pub fn new(id: impl Into<NodeId>, public_key: PublicKey, capacity: u32) -> Self {
        Self {
            id: id.into(),
            public_key,
            trust_score: 0.5,
            last_known_location: None,
            capacity,
            current_load: 0,
            is_online: true,
            last_seen: Utc::now(),
        }
    }

    pub fn with_trust(mut self, trust_score: f64) -> Self {
        self.trust_score = trust_score.clamp(0.0, 1.0);
        self
    }

    pub fn with_location(mut self, location: Coordinates) -> Self {
        self.last_known_location = Some(location);
        self
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.capacity
    }
}

// =============================================================================
// Results
// =============================================================================

/// Which node received which fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAssignment {
    pub index: u16,
    pub node_id: NodeId,
}

/// Outcome of placing a drop's fragments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionResult {
    pub dead_drop_id: DropId,
    pub fragments_total: usize,
    pub fragments_distributed: usize,
    pub fragments_local: usize,
    pub assignments: Vec<NodeAssignment>,
    /// One entry per fragment that fell back to local storage.
    pub errors: Vec<String>,
}

impl DistributionResult {
    pub fn is_complete(&self) -> bool {
        self.fragments_distributed == self.fragments_total
    }
}

/// Outcome of a collection attempt.
pub struct CollectionResult {
    pub success: bool,
    pub fragments_collected: usize,
    pub fragments_needed: usize,
    pub reconstructed_secret: Option<Zeroizing<Vec<u8>>>,
    pub message: String,
    pub errors: Vec<String>,
}

impl CollectionResult {
    /// Reconstructed secret as UTF-8, when it is text.
    pub fn secret_utf8(&self) -> Option<&str> {
        self.reconstructed_secret
            .as_ref()
            .and_then(|s| std::str::from_utf8(s).ok())
    }
}

impl std::fmt::Debug for CollectionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionResult")
            .field("success", &self.success)
            .field("fragments_collected", &self.fragments_collected)
            .field("fragments_needed", &self.fragments_needed)
            .field(
                "reconstructed_secret",
                &self.reconstructed_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("message", &self.message)
            .field("errors", &self.errors)
            .finish()
    }
}

/// Reconstruction headroom of a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropHealth {
    Good,
    Degraded,
}

impl std::fmt::Display for DropHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Good => write!(f, "good"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Placement summary for a drop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionStatus {
    pub dead_drop_id: DropId,
    pub status: DropStatus,
    pub threshold: u16,
    pub total: u16,
    pub distributed: usize,
    /// Available fragments on nodes that are online now.
    pub available: usize,
    pub collected: usize,
    pub local: usize,
    /// Distinct holder nodes that are online.
    pub nodes_online: usize,
    pub health: DropHealth,
}

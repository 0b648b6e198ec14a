// Crate-level lint configuration
#![allow(clippy::multiple_crate_versions)] // Transitive deps, can't easily fix
#![allow(clippy::missing_errors_doc)] // Would require extensive doc changes
#![allow(clippy::missing_panics_doc)] // Would require extensive doc changes
#![allow(clippy::must_use_candidate)] // Too many false positives for internal APIs
#![allow(clippy::module_name_repetitions)] // Acceptable for clarity (e.g., DropError in error mod)
#![allow(clippy::doc_markdown)] // Too strict about backticks in docs
#![allow(clippy::cast_precision_loss)] // Counts and meters are far below 2^52

//! Mesh Dead Drop
//!
//! Hides a secret at a physical location. The secret is split into threshold
//! shares, the shares are placed on nearby short-range mesh nodes, and the
//! secret can only be rebuilt by someone who is there and can reach enough
//! of those nodes before the drop expires.
//!
//! ## Layout
//!
//! - [`sharing`]: Shamir splitting over a 256-bit prime field with Feldman
//!   commitments and proactive refresh
//! - [`crypto`]: X25519 node payloads, geohash-bound and time-bound encryption
//! - [`location`]: GPS, beacon and tap evidence fused into one decision, with
//!   velocity-based spoofing detection
//! - [`distribution`]: node scoring, placement, collection and rebalancing
//! - [`transfer_log`]: signed hash chain of every fragment movement
//!
//! ## Security Model
//!
//! - **k-of-n threshold**: fewer than `k` fragments reveal nothing
//! - **Per-node sealing**: each fragment is encrypted to its holder with an
//!   ephemeral X25519 key and bound to its drop and index
//! - **Location escrow**: the coordinator's copy only opens for the drop's geohash cell
//! - **Verifiable shares**: collected shares are checked against commitments
//!   before reconstruction, and the result against the recorded hash

pub mod config;
pub mod crypto;
pub mod distribution;
pub mod error;
pub mod location;
pub mod sharing;
pub mod storage;
pub mod telemetry;
pub mod transfer_log;

// Re-export commonly used types
pub use config::{DistributionStrategy, Settings};
pub use distribution::{
    CollectionResult, Coordinator, CreateDropRequest, DeadDrop, DropStatus,
    InMemoryNodeRegistry, LoopbackTransport, MeshNode, TargetLocation,
};
pub use error::{DropError, DropResult};
pub use location::{LocationClaim, LocationHistoryStore, LocationVerifier};
pub use storage::Storage;
pub use transfer_log::TransferLog;

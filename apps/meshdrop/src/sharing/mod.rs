//! Threshold secret sharing.
//!
//! - `field`: arithmetic modulo `p = 2^256 - 189`
//! - `shamir`: split, reconstruct, Feldman verification, proactive refresh
//! - `types`: shares, commitments and results

pub mod field;
pub mod shamir;
pub mod types;

pub use field::FieldElement;
pub use shamir::{
    reconstruct, reconstruct_with_threshold, refresh, refresh_with_rng, secret_hash, split,
    split_with_rng, verify_share,
};
pub use types::{Commitments, RefreshResult, Share, SplitResult};

//! Location verification.
//!
//! Claims are checked against a target with GPS range, velocity
//! anti-spoofing, short-range beacons, an optional tap challenge and a weak
//! network fingerprint. History is injected by the caller.

pub mod geo;
pub mod history;
pub mod types;
pub mod verifier;

pub use geo::{Coordinates, EARTH_RADIUS_M, haversine_distance_m};
pub use history::{DEFAULT_HISTORY_LIMIT, LocationHistoryStore};
pub use types::{
    BeaconSignal, LocationClaim, MovementClass, MovementPattern, VerificationFailure,
    VerificationPolicy, VerificationResponse, VerificationResult,
};
pub use verifier::{DEFAULT_MAX_SPEED_MPS, HistoryScope, LocationVerifier};

//! Location claims, verification policy and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DropError, DropResult};
use crate::location::geo::Coordinates;

// =============================================================================
// Claims
// =============================================================================

/// A short-range beacon observed by the claimant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconSignal {
    /// Beacon (mesh node) identifier.
    pub id: String,
    /// Received signal strength in dBm.
    pub signal_strength: i32,
}

impl BeaconSignal {
    pub fn new(id: impl Into<String>, signal_strength: i32) -> Self {
        Self {
            id: id.into(),
            signal_strength,
        }
    }
}

/// A claimant's assertion of where they are right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationClaim {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_meters: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub beacon_signals: Vec<BeaconSignal>,
    #[serde(default)]
    pub tap_response: Option<String>,
    /// Weak supporting signal, e.g. a hash of visible Wi-Fi networks.
    #[serde(default)]
    pub network_fingerprint: Option<String>,
}

impl LocationClaim {
    /// GPS-only claim stamped with the current time.
    pub fn at(lat: f64, lon: f64, accuracy_meters: f64) -> Self {
        Self {
            lat,
            lon,
            accuracy_meters,
            timestamp: Utc::now(),
            beacon_signals: Vec::new(),
            tap_response: None,
            network_fingerprint: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_beacons(mut self, beacons: Vec<BeaconSignal>) -> Self {
        self.beacon_signals = beacons;
        self
    }

    pub fn with_tap_response(mut self, response: impl Into<String>) -> Self {
        self.tap_response = Some(response.into());
        self
    }

    pub fn with_network_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.network_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            lat: self.lat,
            lon: self.lon,
        }
    }
}

// =============================================================================
// Policy
// =============================================================================

/// What a claim must satisfy for a given target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationPolicy {
    pub target: Coordinates,
    pub radius_m: f64,
    pub require_beacon: bool,
    pub require_tap: bool,
    pub min_beacons: usize,
    pub required_beacon_ids: Vec<String>,
    pub expected_tap_response: Option<String>,
    pub expected_network_fingerprint: Option<String>,
}

impl VerificationPolicy {
    /// GPS-only policy.
    pub fn new(target: Coordinates, radius_m: f64) -> Self {
        Self {
            target,
            radius_m,
            require_beacon: false,
            require_tap: false,
            min_beacons: 1,
            required_beacon_ids: Vec::new(),
            expected_tap_response: None,
            expected_network_fingerprint: None,
        }
    }

    pub fn require_beacons(mut self, min_beacons: usize) -> Self {
        self.require_beacon = true;
        self.min_beacons = min_beacons;
        self
    }

    pub fn with_required_beacon_ids(mut self, ids: Vec<String>) -> Self {
        self.require_beacon = true;
        self.required_beacon_ids = ids;
        self
    }

    pub fn require_tap(mut self, expected: Option<String>) -> Self {
        self.require_tap = true;
        self.expected_tap_response = expected;
        self
    }

    pub fn with_expected_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.expected_network_fingerprint = Some(fingerprint.into());
        self
    }
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationResult {
    Success,
    Failed,
    InsufficientEvidence,
    SpoofingDetected,
}

impl std::fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::InsufficientEvidence => write!(f, "insufficient_evidence"),
            Self::SpoofingDetected => write!(f, "spoofing_detected"),
        }
    }
}

/// Why a verification did not succeed, when a specific check decided it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum VerificationFailure {
    OutOfRange { distance_m: f64, allowed_m: f64 },
    ImpossibleSpeed { speed_mps: f64 },
    TooFewBeacons { needed: usize, seen: usize },
    MissingBeacon { id: String },
    WeakBeacons { confidence: f64 },
    MissingTap,
    TapMismatch,
    LowConfidence { confidence: f64 },
}

/// Full verification report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub result: VerificationResult,
    /// Fused confidence in `[0, 1]`.
    pub confidence: f64,
    pub gps_verified: bool,
    pub beacon_verified: bool,
    pub tap_verified: bool,
    pub distance_m: f64,
    pub message: String,
    pub failure: Option<VerificationFailure>,
}

impl VerificationResponse {
    pub fn is_success(&self) -> bool {
        self.result == VerificationResult::Success
    }

    /// Convert a non-successful response into the matching error.
    pub fn ensure_granted(&self) -> DropResult<()> {
        match (self.result, &self.failure) {
            (VerificationResult::Success, _) => Ok(()),
            (VerificationResult::SpoofingDetected, _) => {
                Err(DropError::SpoofingDetected(self.message.clone()))
            }
            (_, Some(VerificationFailure::TooFewBeacons { needed, seen })) => {
                Err(DropError::InsufficientBeacons {
                    needed: *needed,
                    seen: *seen,
                })
            }
            _ => Err(DropError::VerificationFailed(self.message.clone())),
        }
    }
}

// =============================================================================
// Movement analysis
// =============================================================================

/// Coarse movement class from average speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementClass {
    Stationary,
    Walking,
    Driving,
    FastVehicle,
    Flying,
}

impl MovementClass {
    pub fn from_speed(speed_mps: f64) -> Self {
        if speed_mps < 0.5 {
            Self::Stationary
        } else if speed_mps < 3.0 {
            Self::Walking
        } else if speed_mps < 40.0 {
            Self::Driving
        } else if speed_mps < 100.0 {
            Self::FastVehicle
        } else {
            Self::Flying
        }
    }
}

impl std::fmt::Display for MovementClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stationary => write!(f, "stationary"),
            Self::Walking => write!(f, "walking"),
            Self::Driving => write!(f, "driving"),
            Self::FastVehicle => write!(f, "fast_vehicle"),
            Self::Flying => write!(f, "flying"),
        }
    }
}

/// Summary of a claim history, for risk scoring only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementPattern {
    pub class: MovementClass,
    pub avg_speed_mps: f64,
    /// `0.0` (regular) to `1.0` (implausible).
    pub anomaly_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_movement_class_thresholds() {
        assert_eq!(MovementClass::from_speed(0.0), MovementClass::Stationary);
        assert_eq!(MovementClass::from_speed(0.5), MovementClass::Walking);
        assert_eq!(MovementClass::from_speed(2.9), MovementClass::Walking);
        assert_eq!(MovementClass::from_speed(3.0), MovementClass::Driving);
        assert_eq!(MovementClass::from_speed(40.0), MovementClass::FastVehicle);
        assert_eq!(MovementClass::from_speed(250.0), MovementClass::Flying);
        assert_eq!(MovementClass::FastVehicle.to_string(), "fast_vehicle");
    }

    #[test]
    fn test_ensure_granted_maps_errors() {
        let mut response = VerificationResponse {
            result: VerificationResult::Success,
            confidence: 0.9,
            gps_verified: true,
            beacon_verified: false,
            tap_verified: false,
            distance_m: 0.0,
            message: "ok".to_string(),
            failure: None,
        };
        assert!(response.ensure_granted().is_ok());

        response.result = VerificationResult::SpoofingDetected;
        assert!(matches!(
            response.ensure_granted(),
            Err(DropError::SpoofingDetected(_))
        ));

        response.result = VerificationResult::Failed;
        response.failure = Some(VerificationFailure::TooFewBeacons { needed: 2, seen: 1 });
        assert!(matches!(
            response.ensure_granted(),
            Err(DropError::InsufficientBeacons { needed: 2, seen: 1 })
        ));

        response.result = VerificationResult::InsufficientEvidence;
        response.failure = None;
        assert!(matches!(
            response.ensure_granted(),
            Err(DropError::VerificationFailed(_))
        ));
    }

    #[test]
    fn test_claim_serde_defaults() {
        let json = r#"{"lat":1.0,"lon":2.0,"accuracy_meters":5.0,"timestamp":"2026-01-01T00:00:00Z"}"#;
        let claim: LocationClaim = serde_json::from_str(json).unwrap();
        assert!(claim.beacon_signals.is_empty());
        assert!(claim.tap_response.is_none());
    }
}

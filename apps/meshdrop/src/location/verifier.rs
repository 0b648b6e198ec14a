//! Multi-signal location verification with velocity anti-spoofing.

use chrono::{DateTime, Utc};

use crate::error::{DropError, DropResult};
use crate::location::geo::{Coordinates, haversine_distance_m};
use crate::location::history::LocationHistoryStore;
use crate::location::types::{
    BeaconSignal, LocationClaim, MovementClass, MovementPattern, VerificationFailure,
    VerificationPolicy, VerificationResponse, VerificationResult,
};

/// Faster than a commercial jet.
pub const DEFAULT_MAX_SPEED_MPS: f64 = 333.0;

const GPS_WEIGHT: f64 = 0.3;
const BEACON_WEIGHT: f64 = 0.4;
const TAP_WEIGHT: f64 = 0.3;
const WEAK_WEIGHT: f64 = 0.1;

const SUCCESS_THRESHOLD: f64 = 0.7;
const PARTIAL_THRESHOLD: f64 = 0.4;
const BEACON_REJECT_AT: f64 = 0.5;

const BEACON_BONUS_PER_EXTRA: f64 = 0.05;
const BEACON_BONUS_CAP: f64 = 0.10;

/// The per-user history to check a claim against.
#[derive(Debug, Clone, Copy)]
pub struct HistoryScope<'a> {
    pub store: &'a LocationHistoryStore,
    pub user_id: &'a str,
}

impl<'a> HistoryScope<'a> {
    pub fn new(store: &'a LocationHistoryStore, user_id: &'a str) -> Self {
        Self { store, user_id }
    }
}

/// Fuses GPS, beacon, tap and weak signals into a single decision.
#[derive(Debug, Clone)]
pub struct LocationVerifier {
    max_speed_mps: f64,
}

impl Default for LocationVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SPEED_MPS)
    }
}

/// Seconds between two claims, never below one second.
fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let millis = (to - from).num_milliseconds() as f64;
    (millis / 1000.0).max(1.0)
}

fn leg_speed(from: &LocationClaim, to: &LocationClaim) -> f64 {
    let distance = haversine_distance_m(from.lat, from.lon, to.lat, to.lon);
    distance / elapsed_secs(from.timestamp, to.timestamp)
}

/// Plausibility of a single reading from its signal strength bucket.
pub fn beacon_signal_confidence(signal_strength: i32) -> f64 {
    match signal_strength {
        s if s > 0 || s < -120 => 0.0,
        s if s >= -50 => 0.95,
        s if s >= -70 => 0.85,
        s if s >= -85 => 0.70,
        _ => 0.50,
    }
}

/// Mean bucket confidence plus a capped bonus for each beacon beyond the first.
pub fn beacon_confidence(signals: &[BeaconSignal]) -> f64 {
    if signals.is_empty() {
        return 0.0;
    }
    let mean = signals
        .iter()
        .map(|s| beacon_signal_confidence(s.signal_strength))
        .sum::<f64>()
        / signals.len() as f64;
    let bonus = (BEACON_BONUS_PER_EXTRA * (signals.len() - 1) as f64).min(BEACON_BONUS_CAP);
    (mean + bonus).min(1.0)
}

fn gps_confidence(distance_m: f64, radius_m: f64, accuracy_m: f64) -> f64 {
    let allowed = radius_m + accuracy_m;
    let mut confidence = if allowed > 0.0 {
        1.0 - 0.5 * distance_m / allowed
    } else {
        1.0
    };
    // A fix less precise than the target area is weaker evidence
    if accuracy_m > radius_m && accuracy_m > 0.0 {
        confidence *= radius_m / accuracy_m;
    }
    confidence.clamp(0.0, 1.0)
}

struct Evidence {
    weighted: f64,
    weights: f64,
}

impl Evidence {
    fn new() -> Self {
        Self {
            weighted: 0.0,
            weights: 0.0,
        }
    }

    fn add(&mut self, confidence: f64, weight: f64) {
        self.weighted += confidence * weight;
        self.weights += weight;
    }

    fn confidence(&self) -> f64 {
        if self.weights == 0.0 {
            0.0
        } else {
            (self.weighted / self.weights).clamp(0.0, 1.0)
        }
    }
}

impl LocationVerifier {
    pub fn new(max_speed_mps: f64) -> Self {
        Self { max_speed_mps }
    }

    pub fn max_speed_mps(&self) -> f64 {
        self.max_speed_mps
    }

    /// Verify `claim` against `policy`.
    ///
    /// GPS range and impossible travel speed are checked first and end the
    /// evaluation. A claim that passes the velocity check is appended to the
    /// user's history under that user's lock.
    pub fn verify(
        &self,
        claim: &LocationClaim,
        policy: &VerificationPolicy,
        history: Option<HistoryScope<'_>>,
    ) -> DropResult<VerificationResponse> {
        Coordinates::new(claim.lat, claim.lon)?;
        if !claim.accuracy_meters.is_finite() || claim.accuracy_meters < 0.0 {
            return Err(DropError::InvalidInput(format!(
                "accuracy {} must be a non-negative number",
                claim.accuracy_meters
            )));
        }

        let distance_m = claim.coordinates().distance_m(&policy.target);
        let allowed_m = policy.radius_m + claim.accuracy_meters;
        let mut response = VerificationResponse {
            result: VerificationResult::Failed,
            confidence: 0.0,
            gps_verified: false,
            beacon_verified: false,
            tap_verified: false,
            distance_m,
            message: String::new(),
            failure: None,
        };

        if distance_m > allowed_m {
            response.message = format!(
                "{distance_m:.1} m from target, outside the allowed {allowed_m:.1} m"
            );
            response.failure = Some(VerificationFailure::OutOfRange {
                distance_m,
                allowed_m,
            });
            return Ok(response);
        }
        response.gps_verified = true;

        if let Some(scope) = history {
            if let Some(speed_mps) = self.check_velocity(claim, scope)? {
                tracing::warn!(
                    user_id = %scope.user_id,
                    speed_mps = speed_mps,
                    "Impossible travel speed, rejecting claim"
                );
                response.result = VerificationResult::SpoofingDetected;
                response.message = format!(
                    "implied speed {speed_mps:.0} m/s exceeds {:.0} m/s",
                    self.max_speed_mps
                );
                response.failure = Some(VerificationFailure::ImpossibleSpeed { speed_mps });
                return Ok(response);
            }
        }

        let mut evidence = Evidence::new();
        evidence.add(
            gps_confidence(distance_m, policy.radius_m, claim.accuracy_meters),
            GPS_WEIGHT,
        );

        if policy.require_beacon {
            if let Err(failure) = self.check_beacons(claim, policy, &mut evidence) {
                response.message = match &failure {
                    VerificationFailure::TooFewBeacons { needed, seen } => {
                        format!("saw {seen} beacons, need {needed}")
                    }
                    VerificationFailure::MissingBeacon { id } => {
                        format!("required beacon {id} not observed")
                    }
                    VerificationFailure::WeakBeacons { confidence } => {
                        format!("beacon readings implausible (confidence {confidence:.2})")
                    }
                    _ => "beacon check failed".to_string(),
                };
                response.failure = Some(failure);
                return Ok(response);
            }
            response.beacon_verified = true;
        }

        if policy.require_tap {
            match (&claim.tap_response, &policy.expected_tap_response) {
                (None, _) => {
                    response.message = "tap verification required".to_string();
                    response.failure = Some(VerificationFailure::MissingTap);
                    return Ok(response);
                }
                (Some(given), Some(expected)) if given != expected => {
                    tracing::warn!("Tap response mismatch");
                    response.result = VerificationResult::SpoofingDetected;
                    response.message = "tap response does not match".to_string();
                    response.failure = Some(VerificationFailure::TapMismatch);
                    return Ok(response);
                }
                (Some(_), Some(_)) => evidence.add(1.0, TAP_WEIGHT),
                (Some(_), None) => evidence.add(0.8, TAP_WEIGHT),
            }
            response.tap_verified = true;
        }

        if let Some(fingerprint) = &claim.network_fingerprint {
            let weak = match &policy.expected_network_fingerprint {
                Some(expected) if expected == fingerprint => 1.0,
                Some(_) => 0.0,
                None => 0.6,
            };
            evidence.add(weak, WEAK_WEIGHT);
        }

        response.confidence = evidence.confidence();
        response.result = if response.confidence >= SUCCESS_THRESHOLD {
            VerificationResult::Success
        } else if response.confidence >= PARTIAL_THRESHOLD {
            VerificationResult::InsufficientEvidence
        } else {
            VerificationResult::Failed
        };
        if response.result != VerificationResult::Success {
            response.failure = Some(VerificationFailure::LowConfidence {
                confidence: response.confidence,
            });
        }
        response.message = format!(
            "{} with confidence {:.2}",
            response.result, response.confidence
        );

        tracing::debug!(
            result = %response.result,
            confidence = response.confidence,
            distance_m = distance_m,
            "Location verified"
        );

        Ok(response)
    }

    /// Returns the implied speed when it is impossible; otherwise records the claim.
    fn check_velocity(
        &self,
        claim: &LocationClaim,
        scope: HistoryScope<'_>,
    ) -> DropResult<Option<f64>> {
        scope.store.with_user(scope.user_id, |history| {
            if let Some(previous) = history.back() {
                let speed = leg_speed(previous, claim);
                if speed > self.max_speed_mps {
                    return Some(speed);
                }
            }
            history.push_back(claim.clone());
            None
        })
    }

    fn check_beacons(
        &self,
        claim: &LocationClaim,
        policy: &VerificationPolicy,
        evidence: &mut Evidence,
    ) -> Result<(), VerificationFailure> {
        let seen = claim.beacon_signals.len();
        if seen < policy.min_beacons {
            return Err(VerificationFailure::TooFewBeacons {
                needed: policy.min_beacons,
                seen,
            });
        }
        if let Some(missing) = policy
            .required_beacon_ids
            .iter()
            .find(|id| !claim.beacon_signals.iter().any(|s| &s.id == *id))
        {
            return Err(VerificationFailure::MissingBeacon {
                id: missing.clone(),
            });
        }

        let confidence = beacon_confidence(&claim.beacon_signals);
        if confidence <= BEACON_REJECT_AT {
            return Err(VerificationFailure::WeakBeacons { confidence });
        }
        evidence.add(confidence, BEACON_WEIGHT);
        Ok(())
    }

    /// Summarize movement over a history, oldest first. Advisory only.
    pub fn analyze_pattern(&self, history: &[LocationClaim]) -> MovementPattern {
        let speeds: Vec<f64> = history
            .windows(2)
            .map(|pair| leg_speed(&pair[0], &pair[1]))
            .collect();

        if speeds.is_empty() {
            return MovementPattern {
                class: MovementClass::Stationary,
                avg_speed_mps: 0.0,
                anomaly_score: 0.0,
            };
        }

        let n = speeds.len() as f64;
        let mean = speeds.iter().sum::<f64>() / n;
        let variance = speeds.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

        let anomaly_score = if speeds.iter().any(|s| *s > self.max_speed_mps) {
            1.0
        } else if mean > 0.0 {
            let cv = variance.sqrt() / mean;
            cv / (1.0 + cv)
        } else {
            0.0
        };

        MovementPattern {
            class: MovementClass::from_speed(mean),
            avg_speed_mps: mean,
            anomaly_score,
        }
    }
}

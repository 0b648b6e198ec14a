//! Coordinator configuration derived from environment variables.
//!
//! Configuration is loaded once at startup and validated before any drop is
//! created.
//!
//! ## Environment Variables
//!
//! - `MESHDROP_DB_PATH`: Path to the ReDB database file (default: `./.data/meshdrop.redb`)
//! - `MESHDROP_TRANSFER_TIMEOUT_MS`: Per-node delivery timeout (default: 5000)
//! - `MESHDROP_GEOHASH_PRECISION`: Geohash cell size for escrow sealing, 1-12 (default: 7)
//! - `MESHDROP_DROP_EXPIRY_HOURS`: Default drop lifetime, at most ten years (default: 72)
//! - `MESHDROP_MAX_SPEED_MPS`: Travel speed treated as spoofing (default: 333)
//! - `MESHDROP_HISTORY_LIMIT`: Claims kept per user (default: 100)
//! - `MESHDROP_MIN_BEACONS`: Beacons required when a drop demands them (default: 1)
//! - `MESHDROP_ESCROW_KEY`: Base64 32-byte key sealing fragment escrow (random if unset)
//! - `MESHDROP_STRATEGY`: Default node selection strategy (default: balanced)
//! - `MESHDROP_LOG_FORMAT`: `json` for structured logs, anything else for text
//! - `RUST_LOG`: Log level filter

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::KEY_LEN;
use crate::crypto::geohash::{MAX_PRECISION, MIN_PRECISION};
use crate::location::{DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_SPEED_MPS};

const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_GEOHASH_PRECISION: usize = 7;
const DEFAULT_DROP_EXPIRY_HOURS: i64 = 72;
const MAX_DROP_EXPIRY_HOURS: i64 = 24 * 365 * 10;
const DEFAULT_MIN_BEACONS: usize = 1;

/// Helper to get trimmed env var or empty string.
fn env_trim(name: &str) -> String {
    env::var(name).unwrap_or_default().trim().to_string()
}

/// How candidate nodes are ranked when placing fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Highest trust score first.
    ReliabilityFirst,
    /// Closest to the drop first.
    LocalityFirst,
    /// Uniformly random order.
    Random,
    /// Weighted mix of trust and proximity.
    #[default]
    Balanced,
}

impl FromStr for DistributionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "reliability_first" | "reliability" => Ok(Self::ReliabilityFirst),
            "locality_first" | "locality" => Ok(Self::LocalityFirst),
            "random" => Ok(Self::Random),
            "balanced" => Ok(Self::Balanced),
            other => Err(format!(
                "Invalid strategy '{other}'. Must be 'reliability_first', 'locality_first', \
                 'random' or 'balanced'."
            )),
        }
    }
}

impl std::fmt::Display for DistributionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReliabilityFirst => write!(f, "reliability_first"),
            Self::LocalityFirst => write!(f, "locality_first"),
            Self::Random => write!(f, "random"),
            Self::Balanced => write!(f, "balanced"),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        if env_trim("MESHDROP_LOG_FORMAT").eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Symmetric key protecting the coordinator's fragment escrow.
#[derive(Clone)]
pub struct EscrowKey(Zeroizing<[u8; KEY_LEN]>);

impl EscrowKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        let key = Self::from_bytes(bytes);
        bytes.fill(0);
        key
    }

    pub fn from_base64(encoded: &str) -> Result<Self, String> {
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded)
                .map_err(|e| format!("MESHDROP_ESCROW_KEY is not valid base64: {e}"))?,
        );
        let array: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("MESHDROP_ESCROW_KEY must decode to {KEY_LEN} bytes"))?;
        Ok(Self::from_bytes(array))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for EscrowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EscrowKey(..)")
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    db_path: PathBuf,
    transfer_timeout_ms: u64,
    geohash_precision: usize,
    drop_expiry_hours: i64,
    max_speed_mps: f64,
    history_limit: usize,
    min_beacons: usize,
    escrow_key: EscrowKey,
    escrow_key_generated: bool,
    strategy: DistributionStrategy,
    log_format: LogFormat,
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// Unparseable numeric values fall back to their defaults; an invalid
    /// escrow key is reported by [`Settings::validate`].
    pub fn from_env() -> Result<Self, String> {
        let db_path = env_trim("MESHDROP_DB_PATH")
            .parse::<PathBuf>()
            .ok()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("./.data/meshdrop.redb"));

        let transfer_timeout_ms = env_trim("MESHDROP_TRANSFER_TIMEOUT_MS")
            .parse::<u64>()
            .unwrap_or(DEFAULT_TRANSFER_TIMEOUT_MS);

        let geohash_precision = env_trim("MESHDROP_GEOHASH_PRECISION")
            .parse::<usize>()
            .unwrap_or(DEFAULT_GEOHASH_PRECISION);

        let drop_expiry_hours = env_trim("MESHDROP_DROP_EXPIRY_HOURS")
            .parse::<i64>()
            .unwrap_or(DEFAULT_DROP_EXPIRY_HOURS);

        let max_speed_mps = env_trim("MESHDROP_MAX_SPEED_MPS")
            .parse::<f64>()
            .unwrap_or(DEFAULT_MAX_SPEED_MPS);

        let history_limit = env_trim("MESHDROP_HISTORY_LIMIT")
            .parse::<usize>()
            .unwrap_or(DEFAULT_HISTORY_LIMIT);

        let min_beacons = env_trim("MESHDROP_MIN_BEACONS")
            .parse::<usize>()
            .unwrap_or(DEFAULT_MIN_BEACONS);

        let escrow_key_raw = Zeroizing::new(env_trim("MESHDROP_ESCROW_KEY"));
        let (escrow_key, escrow_key_generated) = if escrow_key_raw.is_empty() {
            (EscrowKey::generate(), true)
        } else {
            (EscrowKey::from_base64(&escrow_key_raw)?, false)
        };

        let strategy = env_trim("MESHDROP_STRATEGY")
            .parse::<DistributionStrategy>()
            .unwrap_or_default();

        Ok(Self {
            db_path,
            transfer_timeout_ms,
            geohash_precision,
            drop_expiry_hours,
            max_speed_mps,
            history_limit,
            min_beacons,
            escrow_key,
            escrow_key_generated,
            strategy,
            log_format: LogFormat::from_env(),
        })
    }

    /// Settings for tests: short timeouts and a fixed escrow key.
    pub fn for_tests() -> Self {
        Self {
            db_path: PathBuf::from("./.data/test-meshdrop.redb"),
            transfer_timeout_ms: 500,
            geohash_precision: DEFAULT_GEOHASH_PRECISION,
            drop_expiry_hours: DEFAULT_DROP_EXPIRY_HOURS,
            max_speed_mps: DEFAULT_MAX_SPEED_MPS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            min_beacons: DEFAULT_MIN_BEACONS,
            escrow_key: EscrowKey::from_bytes([0x5a; KEY_LEN]),
            escrow_key_generated: false,
            strategy: DistributionStrategy::Balanced,
            log_format: LogFormat::Text,
        }
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_drop_expiry_hours(mut self, hours: i64) -> Self {
        self.drop_expiry_hours = hours;
        self
    }

    pub fn with_strategy(mut self, strategy: DistributionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Validate ranges.
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&self.geohash_precision) {
            return Err(format!(
                "MESHDROP_GEOHASH_PRECISION must be between {MIN_PRECISION} and {MAX_PRECISION}"
            ));
        }
        if self.transfer_timeout_ms == 0 {
            return Err("MESHDROP_TRANSFER_TIMEOUT_MS must be positive".to_string());
        }
        if !(1..=MAX_DROP_EXPIRY_HOURS).contains(&self.drop_expiry_hours) {
            return Err(format!(
                "MESHDROP_DROP_EXPIRY_HOURS must be between 1 and {MAX_DROP_EXPIRY_HOURS}"
            ));
        }
        if !self.max_speed_mps.is_finite() || self.max_speed_mps <= 0.0 {
            return Err("MESHDROP_MAX_SPEED_MPS must be a positive number".to_string());
        }
        if self.history_limit == 0 {
            return Err("MESHDROP_HISTORY_LIMIT must be positive".to_string());
        }
        Ok(())
    }

    // Getters

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn geohash_precision(&self) -> usize {
        self.geohash_precision
    }

    /// Default drop lifetime, saturating when the configured hours overflow.
    pub fn drop_expiry(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.drop_expiry_hours).unwrap_or(chrono::Duration::MAX)
    }

    pub fn max_speed_mps(&self) -> f64 {
        self.max_speed_mps
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    pub fn min_beacons(&self) -> usize {
        self.min_beacons
    }

    pub fn escrow_key(&self) -> &EscrowKey {
        &self.escrow_key
    }

    /// True when no escrow key was configured and a random one is in use.
    ///
    /// Escrowed fragments cannot be recovered after a restart in that case.
    pub fn escrow_key_generated(&self) -> bool {
        self.escrow_key_generated
    }

    pub fn strategy(&self) -> DistributionStrategy {
        self.strategy
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "balanced".parse::<DistributionStrategy>().unwrap(),
            DistributionStrategy::Balanced
        );
        assert_eq!(
            "Reliability-First".parse::<DistributionStrategy>().unwrap(),
            DistributionStrategy::ReliabilityFirst
        );
        assert_eq!(
            "locality_first".parse::<DistributionStrategy>().unwrap(),
            DistributionStrategy::LocalityFirst
        );
        assert!("invalid".parse::<DistributionStrategy>().is_err());
        assert_eq!(DistributionStrategy::Random.to_string(), "random");
    }

    #[test]
    fn test_escrow_key_parsing() {
        let encoded = BASE64.encode([7u8; KEY_LEN]);
        let key = EscrowKey::from_base64(&encoded).unwrap();
        assert_eq!(key.as_bytes(), &[7u8; KEY_LEN]);
        assert_eq!(format!("{key:?}"), "EscrowKey(..)");

        assert!(EscrowKey::from_base64("not base64!").is_err());
        assert!(EscrowKey::from_base64(&BASE64.encode([1u8; 16])).is_err());
    }

    #[test]
    fn test_settings_validation() {
        let settings = Settings::for_tests();
        assert!(settings.validate().is_ok());

        let mut bad = Settings::for_tests();
        bad.geohash_precision = 13;
        assert!(bad.validate().is_err());

        let mut bad = Settings::for_tests();
        bad.history_limit = 0;
        assert!(bad.validate().is_err());

        assert!(Settings::for_tests().with_drop_expiry_hours(0).validate().is_err());
        assert!(
            Settings::for_tests()
                .with_drop_expiry_hours(MAX_DROP_EXPIRY_HOURS + 1)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_huge_drop_expiry_saturates() {
        let settings = Settings::for_tests().with_drop_expiry_hours(i64::MAX);
        assert_eq!(settings.drop_expiry(), chrono::Duration::MAX);

        let settings = Settings::for_tests().with_drop_expiry_hours(MAX_DROP_EXPIRY_HOURS);
        assert!(settings.validate().is_ok());
        assert_eq!(settings.drop_expiry().num_days(), 3650);
    }
}

//! Coordinates and great-circle distance.

use serde::{Deserialize, Serialize};

use crate::error::{DropError, DropResult};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A validated WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    /// Create coordinates with range validation.
    pub fn new(lat: f64, lon: f64) -> DropResult<Self> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(DropError::InvalidInput(format!(
                "Latitude {lat} not in range [-90, 90]"
            )));
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(DropError::InvalidInput(format!(
                "Longitude {lon} not in range [-180, 180]"
            )));
        }
        Ok(Self { lat, lon })
    }

    /// Haversine distance in meters.
    pub fn distance_m(&self, other: &Coordinates) -> f64 {
        haversine_distance_m(self.lat, self.lon, other.lat, other.lon)
    }

    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        self.distance_m(other) / 1000.0
    }
}

/// Great-circle distance between two points in meters.
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

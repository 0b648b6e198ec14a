//! Geohash encoding used to quantize drop locations into key material.

use crate::error::{DropError, DropResult};

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

pub const MIN_PRECISION: usize = 1;
pub const MAX_PRECISION: usize = 12;

fn check_precision(precision: usize) -> DropResult<()> {
    if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
        return Err(DropError::InvalidInput(format!(
            "geohash precision must be between {MIN_PRECISION} and {MAX_PRECISION}, got {precision}"
        )));
    }
    Ok(())
}

fn check_coordinates(lat: f64, lon: f64) -> DropResult<()> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(DropError::InvalidInput(format!("latitude {lat} out of range")));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(DropError::InvalidInput(format!("longitude {lon} out of range")));
    }
    Ok(())
}

fn char_value(c: char) -> DropResult<u8> {
    let lower = c.to_ascii_lowercase() as u32;
    BASE32
        .iter()
        .position(|b| u32::from(*b) == lower)
        .map(|p| p as u8)
        .ok_or_else(|| DropError::InvalidInput(format!("invalid geohash character '{c}'")))
}

/// Encode a coordinate at `precision` characters.
pub fn encode(lat: f64, lon: f64, precision: usize) -> DropResult<String> {
    check_precision(precision)?;
    check_coordinates(lat, lon)?;

    let (mut lat_lo, mut lat_hi) = (-90.0f64, 90.0f64);
    let (mut lon_lo, mut lon_hi) = (-180.0f64, 180.0f64);
    let mut out = String::with_capacity(precision);
    let mut even = true;
    let mut bits = 0u8;
    let mut bit_count = 0;

    while out.len() < precision {
        if even {
            let mid = (lon_lo + lon_hi) / 2.0;
            bits <<= 1;
            if lon >= mid {
                bits |= 1;
                lon_lo = mid;
            } else {
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            bits <<= 1;
            if lat >= mid {
                bits |= 1;
                lat_lo = mid;
            } else {
                lat_hi = mid;
            }
        }
        even = !even;
        bit_count += 1;

        if bit_count == 5 {
            out.push(BASE32[bits as usize] as char);
            bits = 0;
            bit_count = 0;
        }
    }

    Ok(out)
}

/// Decode to the cell center and half-widths: `(lat, lon, lat_err, lon_err)`.
pub fn decode(hash: &str) -> DropResult<(f64, f64, f64, f64)> {
    check_precision(hash.chars().count())?;

    let (mut lat_lo, mut lat_hi) = (-90.0f64, 90.0f64);
    let (mut lon_lo, mut lon_hi) = (-180.0f64, 180.0f64);
    let mut even = true;

    for c in hash.chars() {
        let value = char_value(c)?;
        for shift in (0..5).rev() {
            let bit = (value >> shift) & 1 == 1;
            if even {
                let mid = (lon_lo + lon_hi) / 2.0;
                if bit {
                    lon_lo = mid;
                } else {
                    lon_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if bit {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even = !even;
        }
    }

    Ok((
        (lat_lo + lat_hi) / 2.0,
        (lon_lo + lon_hi) / 2.0,
        (lat_hi - lat_lo) / 2.0,
        (lon_hi - lon_lo) / 2.0,
    ))
}

/// The eight surrounding cells at the same precision, clockwise from north.
///
/// Cells past a pole are skipped; longitude wraps at the antimeridian.
pub fn neighbors(hash: &str) -> DropResult<Vec<String>> {
    let precision = hash.chars().count();
    let (lat, lon, lat_err, lon_err) = decode(hash)?;
    let offsets: [(f64, f64); 8] = [
        (1.0, 0.0),
        (1.0, 1.0),
        (0.0, 1.0),
        (-1.0, 1.0),
        (-1.0, 0.0),
        (-1.0, -1.0),
        (0.0, -1.0),
        (1.0, -1.0),
    ];

    let mut out = Vec::with_capacity(8);
    for (dlat, dlon) in offsets {
        let n_lat = lat + dlat * lat_err * 2.0;
        if !(-90.0..=90.0).contains(&n_lat) {
            continue;
        }
        let mut n_lon = lon + dlon * lon_err * 2.0;
        if n_lon > 180.0 {
            n_lon -= 360.0;
        } else if n_lon < -180.0 {
            n_lon += 360.0;
        }
        let cell = encode(n_lat, n_lon, precision)?;
        if cell != hash && !out.contains(&cell) {
            out.push(cell);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_values() {
        assert_eq!(encode(57.64911, 10.40744, 11).unwrap(), "u4pruydqqvj");
        assert_eq!(encode(37.7749, -122.4194, 5).unwrap(), "9q8yy");
        assert_eq!(encode(0.0, 0.0, 1).unwrap(), "s");
    }

    #[test]
    fn test_decode_contains_point() {
        let hash = encode(40.7128, -74.0060, 7).unwrap();
        let (lat, lon, lat_err, lon_err) = decode(&hash).unwrap();
        assert!((lat - 40.7128).abs() <= lat_err);
        assert!((lon - -74.0060).abs() <= lon_err);
        assert_eq!(encode(lat, lon, 7).unwrap(), hash);
    }

    #[test]
    fn test_decode_is_case_insensitive() {
        assert_eq!(decode("9Q8YY").unwrap(), decode("9q8yy").unwrap());
    }

    #[test]
    fn test_invalid_input() {
        assert!(encode(91.0, 0.0, 5).is_err());
        assert!(encode(0.0, 181.0, 5).is_err());
        assert!(encode(f64::NAN, 0.0, 5).is_err());
        assert!(encode(0.0, 0.0, 0).is_err());
        assert!(encode(0.0, 0.0, 13).is_err());
        assert!(decode("abc").is_err());
        assert!(decode("").is_err());
    }

    #[test]
    fn test_neighbors() {
        let cells = neighbors("9q8yy").unwrap();
        assert_eq!(cells.len(), 8);
        assert!(cells.iter().all(|c| c.len() == 5 && c != "9q8yy"));
        assert_eq!(cells[0], "9q8zn");
        assert!(cells.contains(&"9q8yz".to_string()));
    }

    #[test]
    fn test_neighbors_at_pole() {
        let hash = encode(89.99, 0.0, 3).unwrap();
        let cells = neighbors(&hash).unwrap();
        assert_eq!(cells.len(), 5);
    }
}

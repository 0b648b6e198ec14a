//! Location-bound encryption.
//!
//! The key is derived from the geohash cell of a coordinate, so only a caller
//! who can name the same cell can decrypt. The geohash also binds the
//! ciphertext as AAD.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::geohash;
use crate::crypto::keys::KEY_LEN;
use crate::crypto::sealing::{NONCE_LEN, aead_open, aead_seal, random_nonce};
use crate::error::{DropError, DropResult};

/// Ciphertext sealed to a geohash cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSealed {
    pub geohash: String,
    pub precision: u8,
    #[serde(with = "hex::serde")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
}

/// Derive a 256-bit key from the geohash cell containing `(lat, lon)`.
///
/// Returns the key and the geohash it was derived from.
pub fn create_location_bound_key(
    lat: f64,
    lon: f64,
    precision: usize,
    base_key: Option<&[u8; KEY_LEN]>,
) -> DropResult<(Zeroizing<[u8; KEY_LEN]>, String)> {
    let cell = geohash::encode(lat, lon, precision)?;
    let key = key_for_cell(&cell, base_key);
    Ok((key, cell))
}

fn key_for_cell(cell: &str, base_key: Option<&[u8; KEY_LEN]>) -> Zeroizing<[u8; KEY_LEN]> {
    let input = format!("location:{cell}");
    let hash = match base_key {
        Some(base) => blake3::keyed_hash(base, input.as_bytes()),
        None => blake3::hash(input.as_bytes()),
    };
    Zeroizing::new(*hash.as_bytes())
}

/// Encrypt `plaintext` so it can only be opened from within the same geohash cell.
pub fn encrypt_with_location(
    plaintext: &[u8],
    lat: f64,
    lon: f64,
    precision: usize,
    base_key: Option<&[u8; KEY_LEN]>,
) -> DropResult<LocationSealed> {
    let (key, cell) = create_location_bound_key(lat, lon, precision, base_key)?;
    let nonce = random_nonce();
    let ciphertext = aead_seal(&key, &nonce, plaintext, cell.as_bytes())?;

    Ok(LocationSealed {
        precision: cell.len() as u8,
        geohash: cell,
        nonce,
        ciphertext,
    })
}

/// Decrypt from a claimed position.
///
/// Fails with [`DropError::LocationMismatch`] before any decryption when the
/// position falls in a different cell.
pub fn decrypt_with_location(
    sealed: &LocationSealed,
    lat: f64,
    lon: f64,
    base_key: Option<&[u8; KEY_LEN]>,
) -> DropResult<Vec<u8>> {
    let cell = geohash::encode(lat, lon, usize::from(sealed.precision))?;
    if cell != sealed.geohash {
        return Err(DropError::LocationMismatch {
            expected: sealed.geohash.clone(),
            actual: cell,
        });
    }

    let key = key_for_cell(&cell, base_key);
    aead_open(&key, &sealed.nonce, &sealed.ciphertext, cell.as_bytes())
}

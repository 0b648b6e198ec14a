//! Time-window encryption.
//!
//! ```text
//! version:u8 | not_before:u64 LE | not_after:u64 LE | nonce:12 | ciphertext
//! ```
//!
//! The 17-byte header is both HKDF input and AEAD associated data, so editing
//! the window breaks authentication. The window itself is enforced against the
//! unwrapping party's clock.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::keys::KEY_LEN;
use crate::crypto::sealing::{NONCE_LEN, aead_open, aead_seal, random_nonce};
use crate::error::{DropError, DropResult};

const TIME_LOCK_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 8 + 8;
const TIME_LOCK_CONTEXT: &[u8] = b"meshdrop/time-lock/v1";

fn header(not_before: u64, not_after: u64) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0] = TIME_LOCK_VERSION;
    out[1..9].copy_from_slice(&not_before.to_le_bytes());
    out[9..17].copy_from_slice(&not_after.to_le_bytes());
    out
}

fn window_key(header: &[u8], base_key: &[u8; KEY_LEN]) -> DropResult<Zeroizing<[u8; KEY_LEN]>> {
    let hk = Hkdf::<Sha256>::new(Some(base_key.as_slice()), header);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(TIME_LOCK_CONTEXT, &mut *key)
        .map_err(|e| DropError::Internal(format!("HKDF expand failed: {e}")))?;
    Ok(key)
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Wrap `data` so it only unwraps between `not_before` and `not_after` (Unix seconds, inclusive).
pub fn create_time_bound_wrapper(
    data: &[u8],
    not_before: u64,
    not_after: u64,
    base_key: &[u8; KEY_LEN],
) -> DropResult<Vec<u8>> {
    if not_before > not_after {
        return Err(DropError::InvalidInput(format!(
            "time window is inverted: not_before {not_before} > not_after {not_after}"
        )));
    }

    let header = header(not_before, not_after);
    let key = window_key(&header, base_key)?;
    let nonce = random_nonce();
    let ciphertext = aead_seal(&key, &nonce, data, &header)?;

    let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Unwrap against the current wall clock.
pub fn unwrap_time_bound(wrapped: &[u8], base_key: &[u8; KEY_LEN]) -> DropResult<Vec<u8>> {
    unwrap_time_bound_at(wrapped, base_key, unix_now())
}

/// Unwrap as of `now` (Unix seconds).
pub fn unwrap_time_bound_at(
    wrapped: &[u8],
    base_key: &[u8; KEY_LEN],
    now: u64,
) -> DropResult<Vec<u8>> {
    if wrapped.len() < HEADER_LEN + NONCE_LEN {
        return Err(DropError::InvalidPayload(
            "time-bound payload truncated".to_string(),
        ));
    }
    let (header, rest) = wrapped.split_at(HEADER_LEN);
    if header[0] != TIME_LOCK_VERSION {
        return Err(DropError::InvalidPayload(format!(
            "unsupported time-lock version {}",
            header[0]
        )));
    }

    let mut field = [0u8; 8];
    field.copy_from_slice(&header[1..9]);
    let not_before = u64::from_le_bytes(field);
    field.copy_from_slice(&header[9..17]);
    let not_after = u64::from_le_bytes(field);

    if now < not_before {
        return Err(DropError::NotYetValid { not_before });
    }
    if now > not_after {
        return Err(DropError::Expired(format!(
            "time window closed at {not_after}"
        )));
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&rest[..NONCE_LEN]);
    let key = window_key(header, base_key)?;
    aead_open(&key, &nonce, &rest[NONCE_LEN..], header)
}

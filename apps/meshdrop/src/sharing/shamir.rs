//! Threshold secret sharing over `GF(p)` with Feldman commitments.
//!
//! A secret is the constant term of a random degree `k-1` polynomial; shares
//! are its evaluations at `x = 1..n`. Any `k` shares recover the constant term
//! by Lagrange interpolation at zero.
//!
//! Commitments live in the multiplicative group mod `p`, whose order is
//! `p - 1` rather than `p`. Each share therefore records the integer
//! evaluation's carry (`floor(f(x) / p)`); since `g^p = g`, a genuine share
//! satisfies `g^(y + carry) = prod C_j^(x^j)`.

use std::collections::HashSet;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{DropError, DropResult};
use crate::sharing::field::{FIELD_BYTES, FieldElement, GROUP_ORDER, PRIME};
use crate::sharing::types::{Commitments, RefreshResult, Share, SplitResult};

/// SHA-256 of the secret, hex encoded.
pub fn secret_hash(secret: &[u8]) -> String {
    hex::encode(Sha256::digest(secret))
}

fn validate_threshold(k: usize, n: usize) -> DropResult<()> {
    if k < 2 || k > n || n > usize::from(u16::MAX) {
        return Err(DropError::InvalidThreshold {
            threshold: k,
            total: n,
        });
    }
    Ok(())
}

/// Split `secret` into `n` shares, any `k` of which reconstruct it.
///
/// Secrets are at most [`FIELD_BYTES`] long and numerically below `p`.
/// Longer input is rejected even when its leading bytes are zero.
pub fn split(secret: &[u8], k: usize, n: usize, with_commitments: bool) -> DropResult<SplitResult> {
    split_with_rng(secret, k, n, with_commitments, &mut OsRng)
}

/// [`split`] with an injected randomness source.
pub fn split_with_rng<R: RngCore + CryptoRng>(
    secret: &[u8],
    k: usize,
    n: usize,
    with_commitments: bool,
    rng: &mut R,
) -> DropResult<SplitResult> {
    if secret.is_empty() {
        return Err(DropError::EmptySecret);
    }
    if secret.len() > FIELD_BYTES {
        return Err(DropError::SecretTooLarge { len: secret.len() });
    }
    let secret_int = BigUint::from_bytes_be(secret);
    if secret_int >= *PRIME {
        return Err(DropError::SecretTooLarge { len: secret.len() });
    }
    validate_threshold(k, n)?;

    let mut coefficients = Vec::with_capacity(k);
    coefficients.push(FieldElement::reduce(&secret_int));
    for _ in 1..k {
        coefficients.push(FieldElement::random(rng));
    }

    let shares = (1..=n)
        .map(|x| {
            // Bounded by validate_threshold
            #[allow(clippy::cast_possible_truncation)]
            let index = x as u16;
            let value = evaluate(&coefficients, &FieldElement::from_u64(x as u64));
            let carry = with_commitments.then(|| evaluation_carry(&coefficients, x as u64));
            Share {
                index,
                value,
                carry,
            }
        })
        .collect();

    let commitments = with_commitments.then(|| commit(&coefficients));

    Ok(SplitResult {
        shares,
        commitments,
        secret_hash: secret_hash(secret),
        secret_len: secret.len(),
    })
}

/// Horner evaluation mod `p`.
fn evaluate(coefficients: &[FieldElement], x: &FieldElement) -> FieldElement {
    coefficients
        .iter()
        .rev()
        .fold(FieldElement::zero(), |acc, coeff| acc.mul(x).add(coeff))
}

/// `floor(sum a_j x^j / p)` with the sum taken over the integers.
fn evaluation_carry(coefficients: &[FieldElement], x: u64) -> BigUint {
    let x = BigUint::from(x);
    let exact = coefficients
        .iter()
        .rev()
        .fold(BigUint::zero(), |acc, coeff| acc * &x + coeff.as_biguint());
    exact / &*PRIME
}

fn commit(coefficients: &[FieldElement]) -> Commitments {
    Commitments(
        coefficients
            .iter()
            .map(|a| FieldElement::generator_pow(a.as_biguint()))
            .collect(),
    )
}

/// Recover the polynomial's constant term from the supplied shares.
///
/// Correct only when at least the original `k` distinct shares are given;
/// fewer yields a different value without any error. Callers that know `k`
/// should use [`reconstruct_with_threshold`].
///
/// The field element carries no leading zero bytes. With `expected_hash`
/// the secret is left-padded to the length whose hash matches; without it
/// the minimal big-endian encoding is returned.
pub fn reconstruct(shares: &[Share], expected_hash: Option<&str>) -> DropResult<Zeroizing<Vec<u8>>> {
    let value = interpolate_at_zero(shares)?;
    let raw = Zeroizing::new(value.as_biguint().to_bytes_be());
    let Some(expected) = expected_hash else {
        return Ok(raw);
    };

    (raw.len()..=FIELD_BYTES)
        .map(|len| left_pad(&raw, len))
        .find(|candidate| check_hash(candidate, Some(expected)).is_ok())
        .ok_or(DropError::HashMismatch)
}

/// Strict reconstruction: fails below `k`, interpolates over exactly the
/// first `k` distinct shares and restores the original byte length.
pub fn reconstruct_with_threshold(
    shares: &[Share],
    k: usize,
    secret_len: usize,
    expected_hash: Option<&str>,
) -> DropResult<Zeroizing<Vec<u8>>> {
    let mut seen = HashSet::new();
    let distinct: Vec<Share> = shares
        .iter()
        .filter(|share| seen.insert(share.index))
        .take(k)
        .cloned()
        .collect();

    if k < 2 || distinct.len() < k {
        return Err(DropError::InsufficientShares {
            needed: k.max(2),
            have: distinct.len(),
        });
    }

    let value = interpolate_at_zero(&distinct)?;
    let raw = Zeroizing::new(value.as_biguint().to_bytes_be());
    let secret = left_pad(&raw, secret_len);
    check_hash(&secret, expected_hash)?;
    Ok(secret)
}

fn left_pad(raw: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    // Zero encodes as a single 0x00 byte
    let trimmed: &[u8] = if raw == [0u8].as_slice() { &[] } else { raw };
    if trimmed.len() >= len {
        return Zeroizing::new(trimmed.to_vec());
    }
    let mut out = Zeroizing::new(vec![0u8; len]);
    out[len - trimmed.len()..].copy_from_slice(trimmed);
    out
}

fn check_hash(secret: &[u8], expected_hash: Option<&str>) -> DropResult<()> {
    match expected_hash {
        Some(expected) if !secret_hash(secret).eq_ignore_ascii_case(expected) => {
            Err(DropError::HashMismatch)
        }
        _ => Ok(()),
    }
}

fn interpolate_at_zero(shares: &[Share]) -> DropResult<FieldElement> {
    if shares.len() < 2 {
        return Err(DropError::InsufficientShares {
            needed: 2,
            have: shares.len(),
        });
    }

    let mut seen = HashSet::with_capacity(shares.len());
    for share in shares {
        if share.index == 0 {
            return Err(DropError::InvalidShare("share index 0 is reserved".to_string()));
        }
        if !seen.insert(share.index) {
            return Err(DropError::InvalidShare(format!(
                "duplicate share index {}",
                share.index
            )));
        }
    }

    let xs: Vec<FieldElement> = shares
        .iter()
        .map(|s| FieldElement::from_u64(u64::from(s.index)))
        .collect();

    let mut secret = FieldElement::zero();
    for (i, share) in shares.iter().enumerate() {
        let mut numerator = FieldElement::one();
        let mut denominator = FieldElement::one();
        for (j, x_j) in xs.iter().enumerate() {
            if i == j {
                continue;
            }
            numerator = numerator.mul(x_j);
            denominator = denominator.mul(&x_j.sub(&xs[i]));
        }
        let inverse = denominator
            .inverse()
            .ok_or_else(|| DropError::Internal("zero Lagrange denominator".to_string()))?;
        secret = secret.add(&share.value.mul(&numerator).mul(&inverse));
    }

    Ok(secret)
}

/// Check a share against published commitments without learning the secret.
pub fn verify_share(share: &Share, commitments: &Commitments, k: usize) -> bool {
    if commitments.len() != k || k == 0 || share.index == 0 {
        return false;
    }
    let Some(carry) = share.carry.as_ref() else {
        return false;
    };

    let lhs = FieldElement::generator_pow(&(share.value.as_biguint() + carry));

    let x = BigUint::from(share.index);
    let mut x_pow = BigUint::one();
    let mut rhs = FieldElement::one();
    for commitment in &commitments.0 {
        rhs = rhs.mul(&commitment.pow(&x_pow));
        x_pow = (x_pow * &x) % &*GROUP_ORDER;
    }

    lhs == rhs
}

/// Proactively re-randomize shares without changing the secret.
///
/// Adds a fresh polynomial with zero constant term to every share. When
/// commitments are supplied and every share carries verification data, the
/// commitments and carries are updated to match; otherwise both are dropped.
pub fn refresh(
    old_shares: &[Share],
    k: usize,
    n: usize,
    commitments: Option<&Commitments>,
) -> DropResult<RefreshResult> {
    refresh_with_rng(old_shares, k, n, commitments, &mut OsRng)
}

/// [`refresh`] with an injected randomness source.
pub fn refresh_with_rng<R: RngCore + CryptoRng>(
    old_shares: &[Share],
    k: usize,
    n: usize,
    commitments: Option<&Commitments>,
    rng: &mut R,
) -> DropResult<RefreshResult> {
    validate_threshold(k, n)?;
    if let Some(share) = old_shares
        .iter()
        .find(|s| s.index == 0 || usize::from(s.index) > n)
    {
        return Err(DropError::InvalidShare(format!(
            "share index {} outside 1..={n}",
            share.index
        )));
    }

    let mut delta = Vec::with_capacity(k);
    delta.push(FieldElement::zero());
    for _ in 1..k {
        delta.push(FieldElement::random(rng));
    }

    let track = commitments.is_some_and(|c| c.len() == k)
        && old_shares.iter().all(|s| s.carry.is_some());

    let shares = old_shares
        .iter()
        .map(|share| {
            let x = u64::from(share.index);
            let offset = evaluate(&delta, &FieldElement::from_u64(x));
            let value = share.value.add(&offset);
            let carry = if track {
                share.carry.as_ref().map(|old| {
                    let wrapped = share.value.as_biguint() + offset.as_biguint() >= *PRIME;
                    let mut carry = old + evaluation_carry(&delta, x);
                    if wrapped {
                        carry += 1u32;
                    }
                    carry
                })
            } else {
                None
            };
            Share {
                index: share.index,
                value,
                carry,
            }
        })
        .collect();

    let commitments = match commitments {
        Some(existing) if track => {
            let update = commit(&delta);
            Some(Commitments(
                existing
                    .0
                    .iter()
                    .zip(&update.0)
                    .map(|(c, r)| c.mul(r))
                    .collect(),
            ))
        }
        _ => None,
    };

    Ok(RefreshResult {
        shares,
        commitments,
    })
}

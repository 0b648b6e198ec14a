//! Arithmetic in the prime field `GF(p)` with `p = 2^256 - 189`.

use std::fmt;
use std::sync::LazyLock;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DropError, DropResult};

/// Width of a serialized field element in bytes.
pub const FIELD_BYTES: usize = 32;

/// Field modulus `p = 2^256 - 189`.
pub static PRIME: LazyLock<BigUint> =
    LazyLock::new(|| (BigUint::one() << 256usize) - BigUint::from(189u32));

/// `p - 1`, the order of the multiplicative group.
pub static GROUP_ORDER: LazyLock<BigUint> = LazyLock::new(|| &*PRIME - BigUint::one());

/// Commitment generator.
pub static GENERATOR: LazyLock<BigUint> = LazyLock::new(|| BigUint::from(2u32));

/// An element of `GF(p)`, always fully reduced.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FieldElement(BigUint);

impl FieldElement {
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    pub fn one() -> Self {
        Self(BigUint::one())
    }

    pub fn from_u64(value: u64) -> Self {
        Self(BigUint::from(value) % &*PRIME)
    }

    /// Reduce an arbitrary integer into the field.
    pub fn reduce(value: &BigUint) -> Self {
        Self(value % &*PRIME)
    }

    /// Parse a big-endian value, rejecting anything `>= p`.
    pub fn from_be_bytes(bytes: &[u8]) -> DropResult<Self> {
        let value = BigUint::from_bytes_be(bytes);
        if value >= *PRIME {
            return Err(DropError::InvalidShare(
                "field element is not below the modulus".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Fixed-width big-endian encoding.
    pub fn to_be_bytes(&self) -> [u8; FIELD_BYTES] {
        let raw = self.0.to_bytes_be();
        let mut out = [0u8; FIELD_BYTES];
        // Reduced values never exceed 32 bytes
        out[FIELD_BYTES - raw.len()..].copy_from_slice(&raw);
        out
    }

    /// Uniformly random element via rejection sampling.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; FIELD_BYTES];
        loop {
            rng.fill_bytes(&mut bytes);
            let candidate = BigUint::from_bytes_be(&bytes);
            if candidate < *PRIME {
                return Self(candidate);
            }
        }
    }

    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn add(&self, other: &Self) -> Self {
        Self((&self.0 + &other.0) % &*PRIME)
    }

    pub fn sub(&self, other: &Self) -> Self {
        if self.0 >= other.0 {
            Self(&self.0 - &other.0)
        } else {
            Self(&*PRIME - (&other.0 - &self.0))
        }
    }

    pub fn mul(&self, other: &Self) -> Self {
        Self((&self.0 * &other.0) % &*PRIME)
    }

    pub fn pow(&self, exponent: &BigUint) -> Self {
        Self(self.0.modpow(exponent, &PRIME))
    }

    /// Multiplicative inverse via Fermat's little theorem (`a^(p-2)`).
    pub fn inverse(&self) -> Option<Self> {
        if self.is_zero() {
            return None;
        }
        let exponent = &*PRIME - BigUint::from(2u32);
        Some(self.pow(&exponent))
    }

    /// `g^exponent mod p` for the commitment generator.
    pub fn generator_pow(exponent: &BigUint) -> Self {
        Self(GENERATOR.modpow(exponent, &PRIME))
    }
}

impl fmt::Debug for FieldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Share values are secret material
        f.write_str("FieldElement(..)")
    }
}

impl Serialize for FieldElement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_be_bytes()))
    }
}

impl<'de> Deserialize<'de> for FieldElement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(serde::de::Error::custom)?;
        Self::from_be_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_prime_value() {
        let expected =
            hex::decode("ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff43")
                .unwrap();
        assert_eq!(PRIME.to_bytes_be(), expected);
    }

    #[test]
    fn test_sub_wraps() {
        let a = FieldElement::from_u64(3);
        let b = FieldElement::from_u64(5);
        let diff = a.sub(&b);
        assert_eq!(diff.add(&b), a);
    }

    #[test]
    fn test_inverse() {
        let a = FieldElement::random(&mut OsRng);
        let inv = a.inverse().unwrap();
        assert_eq!(a.mul(&inv), FieldElement::one());
        assert!(FieldElement::zero().inverse().is_none());
    }

    #[test]
    fn test_bytes_reject_modulus() {
        assert!(FieldElement::from_be_bytes(&PRIME.to_bytes_be()).is_err());
        let small = FieldElement::from_be_bytes(&[0x01, 0x02]).unwrap();
        assert_eq!(small, FieldElement::from_u64(0x0102));
        assert_eq!(small.to_be_bytes()[30..], [0x01, 0x02]);
    }

    #[test]
    fn test_serde_hex() {
        let a = FieldElement::from_u64(42);
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.ends_with("2a\""));
        let back: FieldElement = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}

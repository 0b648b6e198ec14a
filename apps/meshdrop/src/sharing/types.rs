//! Share and split result types.

use num_bigint::BigUint;

use crate::error::{DropError, DropResult};
use crate::sharing::field::{FIELD_BYTES, FieldElement};

/// Feldman commitments `C_j = g^{a_j} mod p`, one per coefficient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitments(pub Vec<FieldElement>);

impl Commitments {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hex encoding for persistence alongside a dead drop.
    pub fn to_hex(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|c| hex::encode(c.to_be_bytes()))
            .collect()
    }

    pub fn from_hex(encoded: &[String]) -> DropResult<Self> {
        encoded
            .iter()
            .map(|value| {
                let bytes = hex::decode(value)
                    .map_err(|e| DropError::Deserialization(format!("Invalid commitment: {e}")))?;
                FieldElement::from_be_bytes(&bytes)
            })
            .collect::<DropResult<Vec<_>>>()
            .map(Self)
    }
}

/// One point `(index, f(index))` on the sharing polynomial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    /// Evaluation point, 1-based.
    pub index: u16,
    /// `f(index) mod p`.
    pub value: FieldElement,
    /// `floor(f(index) / p)` over the integers. Present only when the split
    /// produced commitments; required by [`crate::sharing::verify_share`].
    pub carry: Option<BigUint>,
}

impl Share {
    /// Encode as `index:u16 BE | value:32 | carry_len:u16 BE | carry`.
    pub fn to_bytes(&self) -> DropResult<Vec<u8>> {
        let carry = self
            .carry
            .as_ref()
            .map(BigUint::to_bytes_be)
            .unwrap_or_default();
        let carry_len = u16::try_from(carry.len())
            .map_err(|_| DropError::Serialization("share carry too large".to_string()))?;

        let mut out = Vec::with_capacity(2 + FIELD_BYTES + 2 + carry.len());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.value.to_be_bytes());
        out.extend_from_slice(&carry_len.to_be_bytes());
        out.extend_from_slice(&carry);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> DropResult<Self> {
        let header = 2 + FIELD_BYTES + 2;
        if bytes.len() < header {
            return Err(DropError::InvalidShare("encoded share truncated".to_string()));
        }

        let index = u16::from_be_bytes([bytes[0], bytes[1]]);
        if index == 0 {
            return Err(DropError::InvalidShare("share index 0 is reserved".to_string()));
        }
        let value = FieldElement::from_be_bytes(&bytes[2..2 + FIELD_BYTES])?;
        let carry_len =
            u16::from_be_bytes([bytes[2 + FIELD_BYTES], bytes[3 + FIELD_BYTES]]) as usize;

        if bytes.len() != header + carry_len {
            return Err(DropError::InvalidShare(format!(
                "encoded share length {} does not match carry length {carry_len}",
                bytes.len()
            )));
        }

        let carry = (carry_len > 0).then(|| BigUint::from_bytes_be(&bytes[header..]));

        Ok(Self {
            index,
            value,
            carry,
        })
    }
}

/// Output of [`crate::sharing::split`].
#[derive(Debug, Clone)]
pub struct SplitResult {
    /// Exactly `n` shares, ordered by index.
    pub shares: Vec<Share>,
    /// Exactly `k` commitments when requested.
    pub commitments: Option<Commitments>,
    /// SHA-256 of the secret (hex).
    pub secret_hash: String,
    /// Original secret length, so leading zero bytes can be restored.
    pub secret_len: usize,
}

/// Output of [`crate::sharing::refresh`].
#[derive(Debug, Clone)]
pub struct RefreshResult {
    pub shares: Vec<Share>,
    /// Updated commitments, present when the inputs carried verifiable data.
    pub commitments: Option<Commitments>,
}

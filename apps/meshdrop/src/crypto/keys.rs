//! X25519 key agreement for mesh nodes.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use curve25519_dalek::montgomery::MontgomeryPoint;
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{DropError, DropResult};

/// X25519 key length in bytes.
pub const KEY_LEN: usize = 32;

/// X25519 public key.
pub type PublicKey = [u8; KEY_LEN];

/// X25519 key pair for a mesh node or an ephemeral sender.
pub struct MeshKeyPair {
    pub public_key: PublicKey,
    secret_key: Zeroizing<[u8; KEY_LEN]>,
}

impl MeshKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut secret = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut *secret);
        Self::from_secret_bytes(*secret)
    }

    /// Create from existing private key bytes.
    pub fn from_secret_bytes(secret: [u8; KEY_LEN]) -> Self {
        let public_key = MontgomeryPoint::mul_base_clamped(secret).to_bytes();
        Self {
            public_key,
            secret_key: Zeroizing::new(secret),
        }
    }

    /// Get the secret key (use carefully).
    pub fn secret_key(&self) -> &[u8; KEY_LEN] {
        &self.secret_key
    }

    /// Serialize the public key to base64.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key)
    }

    /// Deserialize a public key from base64.
    pub fn public_key_from_base64(encoded: &str) -> DropResult<PublicKey> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| DropError::InvalidInput(format!("Invalid base64: {e}")))?;

        bytes
            .try_into()
            .map_err(|_| DropError::InvalidInput("Public key must be 32 bytes".to_string()))
    }
}

impl std::fmt::Debug for MeshKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshKeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// Generate a fresh X25519 key pair.
pub fn generate_keypair() -> MeshKeyPair {
    MeshKeyPair::generate()
}

/// X25519 agreement expanded through HKDF-SHA256 with `context_label` as info.
///
/// A low-order peer key produces an all-zero shared point and is rejected.
pub fn derive_shared_secret(
    private_key: &[u8; KEY_LEN],
    peer_public: &PublicKey,
    context_label: &[u8],
) -> DropResult<Zeroizing<[u8; KEY_LEN]>> {
    let shared = Zeroizing::new(MontgomeryPoint(*peer_public).mul_clamped(*private_key).to_bytes());

    if shared.iter().all(|b| *b == 0) {
        return Err(DropError::AuthenticationError(
            "peer public key is a low-order point".to_string(),
        ));
    }

    let hk = Hkdf::<Sha256>::new(None, &*shared);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(context_label, &mut *okm)
        .map_err(|e| DropError::Internal(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_generation() {
        let kp = generate_keypair();
        let restored = MeshKeyPair::from_secret_bytes(*kp.secret_key());
        assert_eq!(restored.public_key, kp.public_key);

        let decoded = MeshKeyPair::public_key_from_base64(&kp.public_key_base64()).unwrap();
        assert_eq!(decoded, kp.public_key);
    }

    #[test]
    fn test_shared_secret_agrees() {
        let alice = generate_keypair();
        let bob = generate_keypair();

        let ab = derive_shared_secret(alice.secret_key(), &bob.public_key, b"ctx").unwrap();
        let ba = derive_shared_secret(bob.secret_key(), &alice.public_key, b"ctx").unwrap();
        assert_eq!(*ab, *ba);

        let other = derive_shared_secret(alice.secret_key(), &bob.public_key, b"other").unwrap();
        assert_ne!(*ab, *other);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let kp = generate_keypair();
        let result = derive_shared_secret(kp.secret_key(), &[0u8; KEY_LEN], b"ctx");
        assert!(matches!(result, Err(DropError::AuthenticationError(_))));
    }

    #[test]
    fn test_public_key_length_checked() {
        let short = BASE64.encode([1u8; 16]);
        assert!(MeshKeyPair::public_key_from_base64(&short).is_err());
    }
}
